//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. These arguments are parsed at startup and then merged on top
//! of the configuration file and environment variables.

use crate::dispatcher::OverloadPolicy;
use clap::Parser;
use figment::{
    providers::Serialized,
    value::{Dict, Map},
    Error, Figment, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Bridges PostgreSQL LISTEN/NOTIFY channels to SNS topics and HTTP webhooks.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file for pg-bridge (JSON or TOML).
    #[arg(short = 'c', long, value_name = "FILE")]
    pub conf: Option<PathBuf>,

    /// The logging level, used when RUST_LOG is not set.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// PostgreSQL connection string.
    #[arg(long, value_name = "URL")]
    pub postgres_url: Option<String>,

    /// A route of the form "<channel> <sink>". Repeat to add routes; replaces
    /// the configured routes.
    #[arg(long = "route", value_name = "ROUTE")]
    pub routes: Vec<String>,

    /// Port for the health endpoint (0 disables it).
    #[arg(long, value_name = "PORT")]
    pub health_port: Option<u16>,

    /// Path of the health endpoint.
    #[arg(long, value_name = "PATH")]
    pub health_path: Option<String>,

    /// Maximum number of concurrent deliveries.
    #[arg(long, value_name = "N")]
    pub max_in_flight: Option<usize>,

    /// What to do when the delivery limit is reached: wait or shed.
    #[arg(long, value_name = "POLICY", value_enum, ignore_case = true)]
    pub overload_policy: Option<OverloadPolicy>,

    /// Serve Prometheus metrics on /metrics of the health server.
    #[arg(long)]
    pub metrics: bool,
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut figment = Figment::new();

        if let Some(level) = &self.log_level {
            figment = figment.merge(Serialized::default("log_level", level));
        }
        if let Some(url) = &self.postgres_url {
            figment = figment.merge(Serialized::default("postgres.url", url));
        }
        if !self.routes.is_empty() {
            figment = figment.merge(Serialized::default("routes", &self.routes));
        }
        if let Some(port) = self.health_port {
            figment = figment.merge(Serialized::default("health.port", port));
        }
        if let Some(path) = &self.health_path {
            figment = figment.merge(Serialized::default("health.path", path));
        }
        if let Some(max) = self.max_in_flight {
            figment = figment.merge(Serialized::default("dispatch.max_in_flight", max));
        }
        if let Some(policy) = self.overload_policy {
            figment = figment.merge(Serialized::default("dispatch.overload_policy", policy));
        }
        // A bare flag can only enable metrics; the file or env can still do so
        // when the flag is absent.
        if self.metrics {
            figment = figment.merge(Serialized::default("metrics.enabled", true));
        }

        figment.data()
    }
}
