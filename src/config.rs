//! Configuration management for pg-bridge
//!
//! This module defines the main `Config` struct and its sub-structs. It uses
//! the `figment` crate to layer, from lowest to highest precedence:
//!
//! 1. built-in defaults,
//! 2. a configuration file (`.json` is read as JSON, anything else as TOML),
//! 3. inline JSON from `PG_BRIDGE_CONFIG`,
//! 4. the container encoding: `PG_BRIDGE_ROUTES="channel,sink;channel,sink"`
//!    with `POSTGRES_URL` (or `DATABASE_URL`), then `HEALTH_PORT` and
//!    `HEALTH_PATH`,
//! 5. `PG_BRIDGE_`-prefixed variables, with `__` separating nested keys
//!    (e.g. `PG_BRIDGE_DISPATCH__MAX_IN_FLIGHT=64`),
//! 6. command-line flags.

use crate::cli::Cli;
use crate::dispatcher::{DispatcherConfig, OverloadPolicy};
use crate::error::BridgeError;
use crate::listener::ListenerConfig;
use crate::routing::RouteTable;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Reconnect intervals may never exceed this bound.
pub const MAX_RECONNECT_INTERVAL_SECONDS: u64 = 60;

const ROUTES_KEY: &str = "routes";
const LEGACY_ROUTES_KEY: &str = "Routes";

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    /// The logging level, used when `RUST_LOG` is not set.
    pub log_level: String,
    pub postgres: PostgresConfig,
    /// Route lines of the form `"<channel> <sink>"`. Older JSON files spell
    /// the key `Routes`; `merge_file` re-keys it.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<String>,
    pub health: HealthConfig,
    pub listener: ListenerSettings,
    pub dispatch: DispatchSettings,
    pub webhook: WebhookConfig,
    pub sns: SnsConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct PostgresConfig {
    /// A libpq-style connection string or `postgres://` URL.
    pub url: String,
}

/// Configuration for the HTTP health endpoint.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct HealthConfig {
    /// Port to listen on; 0 disables the endpoint.
    pub port: u16,
    pub path: String,
    /// How often the listener is probed.
    pub interval_seconds: u64,
    /// Timeout for one probe round-trip.
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: 0,
            path: "/health".to_string(),
            interval_seconds: 5,
            probe_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ListenerSettings {
    pub min_reconnect_interval_seconds: u64,
    pub max_reconnect_interval_seconds: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            min_reconnect_interval_seconds: 10,
            max_reconnect_interval_seconds: MAX_RECONNECT_INTERVAL_SECONDS,
        }
    }
}

/// Bounds on concurrent deliveries.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DispatchSettings {
    pub max_in_flight: usize,
    pub overload_policy: OverloadPolicy,
    pub drain_timeout_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 1024,
            overload_policy: OverloadPolicy::Wait,
            drain_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WebhookConfig {
    pub timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Overrides for the AWS SDK. Unset fields fall back to the SDK's default
/// provider chain.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct SnsConfig {
    pub region: Option<String>,
    /// Custom endpoint, e.g. a localstack URL.
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve the Prometheus exposition on `/metrics` of the health server.
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            postgres: PostgresConfig::default(),
            routes: Vec::new(),
            health: HealthConfig::default(),
            listener: ListenerSettings::default(),
            dispatch: DispatchSettings::default(),
            webhook: WebhookConfig::default(),
            sns: SnsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration from every source.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config: Config = Self::figment(cli)?
            .extract()
            .context("could not decode configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Assembles the layered providers without extracting them.
    pub fn figment(cli: &Cli) -> Result<Figment> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(path) = &cli.conf {
            figment = merge_file(figment, path)?;
        }

        if let Ok(inline) = std::env::var("PG_BRIDGE_CONFIG") {
            figment = figment.merge(Json::string(&inline));
        }

        if let Ok(encoded) = std::env::var("PG_BRIDGE_ROUTES") {
            figment = figment.merge(Serialized::default(ROUTES_KEY, parse_route_list(&encoded)));
        }

        figment = figment
            .merge(Env::raw().only(&["DATABASE_URL"]).map(|_| "postgres.url".into()))
            .merge(Env::raw().only(&["POSTGRES_URL"]).map(|_| "postgres.url".into()))
            .merge(Env::raw().only(&["HEALTH_PORT"]).map(|_| "health.port".into()))
            .merge(Env::raw().only(&["HEALTH_PATH"]).map(|_| "health.path".into()))
            // Allow overriding with environment variables, e.g., PG_BRIDGE_LOG_LEVEL=debug
            .merge(
                Env::prefixed("PG_BRIDGE_")
                    .filter(|key| {
                        !key.as_str().eq_ignore_ascii_case("config")
                            && !key.as_str().eq_ignore_ascii_case("routes")
                    })
                    .split("__"),
            )
            .merge(cli.clone());

        Ok(figment)
    }

    /// Checks the values that cannot be expressed in the types, and clamps
    /// the reconnect bound.
    pub fn validate(&mut self) -> Result<(), BridgeError> {
        if self.postgres.url.trim().is_empty() {
            return Err(BridgeError::config("postgres.url is required"));
        }
        if !self.health.path.starts_with('/') {
            return Err(BridgeError::config(format!(
                "health.path must start with '/', got {:?}",
                self.health.path
            )));
        }
        if self.metrics.enabled && self.health.path == "/metrics" {
            return Err(BridgeError::config(
                "health.path cannot be /metrics while metrics are enabled",
            ));
        }
        if self.dispatch.max_in_flight == 0 {
            return Err(BridgeError::config("dispatch.max_in_flight must be at least 1"));
        }

        let listener = &mut self.listener;
        if listener.max_reconnect_interval_seconds > MAX_RECONNECT_INTERVAL_SECONDS {
            warn!(
                configured = listener.max_reconnect_interval_seconds,
                max = MAX_RECONNECT_INTERVAL_SECONDS,
                "Clamping listener.max_reconnect_interval_seconds"
            );
            listener.max_reconnect_interval_seconds = MAX_RECONNECT_INTERVAL_SECONDS;
        }
        if listener.min_reconnect_interval_seconds == 0 {
            return Err(BridgeError::config(
                "listener.min_reconnect_interval_seconds must be at least 1",
            ));
        }
        if listener.min_reconnect_interval_seconds > listener.max_reconnect_interval_seconds {
            return Err(BridgeError::config(format!(
                "listener.min_reconnect_interval_seconds ({}) exceeds the maximum ({})",
                listener.min_reconnect_interval_seconds, listener.max_reconnect_interval_seconds
            )));
        }

        self.route_table()?;
        Ok(())
    }

    pub fn route_table(&self) -> Result<RouteTable, BridgeError> {
        RouteTable::parse(&self.routes)
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            min_reconnect_interval: Duration::from_secs(self.listener.min_reconnect_interval_seconds),
            max_reconnect_interval: Duration::from_secs(self.listener.max_reconnect_interval_seconds),
            probe_timeout: Duration::from_millis(self.health.probe_timeout_ms),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_in_flight: self.dispatch.max_in_flight,
            overload_policy: self.dispatch.overload_policy,
            drain_timeout: Duration::from_millis(self.dispatch.drain_timeout_ms),
        }
    }
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    if !path.is_file() {
        anyhow::bail!("could not read config file {}", path.display());
    }
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if !is_json {
        return Ok(figment.merge(Toml::file(path)));
    }

    // `Routes` is re-keyed at the file's own precedence so later sources
    // still replace it. The original key is left behind and ignored.
    let file = Figment::from(Json::file(path));
    let mut figment = figment.merge(Json::file(path));
    if file.find_value(ROUTES_KEY).is_err() {
        if let Ok(legacy) = file.find_value(LEGACY_ROUTES_KEY) {
            figment = figment.merge(Serialized::default(ROUTES_KEY, legacy));
        }
    }
    Ok(figment)
}

/// Decodes `"channel,sink;channel,sink"` into route lines. Each pair is split
/// at its first comma; empty pairs are skipped.
pub fn parse_route_list(encoded: &str) -> Vec<String> {
    encoded
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once(',') {
            Some((channel, sink)) => format!("{} {}", channel.trim(), sink.trim()),
            None => pair.to_string(),
        })
        .collect()
}
