#![allow(dead_code)]
//! Test helpers for running the full application against fakes.

pub mod app;

use pg_bridge::config::{Config, PostgresConfig};

/// A valid configuration with the given route lines.
pub fn config_with_routes(routes: &[&str]) -> Config {
    Config {
        postgres: PostgresConfig {
            url: "postgres://bridge@localhost/app".to_string(),
        },
        routes: routes.iter().map(|r| r.to_string()).collect(),
        ..Config::default()
    }
}
