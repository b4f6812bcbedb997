//! Configuration layering: file, environment encodings and CLI flags.
//!
//! Every test runs inside a `figment::Jail` so environment changes never leak
//! between tests.

use clap::Parser;
use figment::Jail;
use pg_bridge::{cli::Cli, config::Config, dispatcher::OverloadPolicy};
use std::io::Write;

fn load(args: &[&str]) -> Result<Config, figment::Error> {
    let mut argv = vec!["pg-bridge"];
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(argv).map_err(|e| e.to_string())?;
    Config::load(&cli).map_err(|e| format!("{:#}", e).into())
}

#[test]
fn test_load_toml_file() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "bridge.toml",
            r#"
            log_level = "debug"
            routes = ["orders topic:arn:aws:sns:us-east-1:1:orders", "orders https://hook/a"]

            [postgres]
            url = "postgres://bridge@db/app"

            [health]
            port = 8080
            path = "/healthz"

            [dispatch]
            max_in_flight = 64
            overload_policy = "shed"

            [sns]
            region = "eu-west-1"
            "#,
        )?;

        let config = load(&["-c", "bridge.toml"])?;

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.postgres.url, "postgres://bridge@db/app");
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.health.port, 8080);
        assert_eq!(config.health.path, "/healthz");
        assert_eq!(config.dispatch.max_in_flight, 64);
        assert_eq!(config.dispatch.overload_policy, OverloadPolicy::Shed);
        assert_eq!(config.sns.region.as_deref(), Some("eu-west-1"));
        // Untouched sections keep their defaults.
        assert_eq!(config.webhook.timeout_ms, 30_000);
        assert_eq!(config.listener.min_reconnect_interval_seconds, 10);
        Ok(())
    });
}

#[test]
fn test_load_legacy_json_file() {
    Jail::expect_with(|_jail| {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "postgres": {{ "url": "host=db user=bridge dbname=app" }},
                "Routes": ["orders https://hook/a", "billing arn:aws:sns:us-east-1:1:billing"],
                "health": {{ "port": 9000, "path": "/health" }}
            }}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = load(&["--conf", &path])?;

        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.health.port, 9000);
        let table = config.route_table().unwrap();
        assert_eq!(table.sinks_for("billing").len(), 1);
        Ok(())
    });
}

#[test]
fn test_legacy_routes_key_is_replaced_by_later_sources() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "bridge.json",
            r#"{
                "postgres": { "url": "postgres://file/app" },
                "Routes": ["orders https://hook/a"]
            }"#,
        )?;

        let config = load(&["-c", "bridge.json"])?;
        assert_eq!(config.routes, vec!["orders https://hook/a"]);

        jail.set_env("PG_BRIDGE_ROUTES", "billing,https://hook/b");
        let config = load(&["-c", "bridge.json"])?;
        assert_eq!(config.routes, vec!["billing https://hook/b"]);

        let config = load(&["-c", "bridge.json", "--route", "invoices topic:arn:i"])?;
        assert_eq!(config.routes, vec!["invoices topic:arn:i"]);
        Ok(())
    });
}

#[test]
fn test_inline_json_from_environment() {
    Jail::expect_with(|jail| {
        jail.set_env(
            "PG_BRIDGE_CONFIG",
            r#"{"postgres":{"url":"postgres://env/app"},"routes":["orders https://hook/a"]}"#,
        );

        let config = load(&[])?;

        assert_eq!(config.postgres.url, "postgres://env/app");
        assert_eq!(config.routes, vec!["orders https://hook/a"]);
        Ok(())
    });
}

#[test]
fn test_container_encoding() {
    Jail::expect_with(|jail| {
        jail.set_env(
            "PG_BRIDGE_ROUTES",
            "orders,arn:aws:sns:us-east-1:1:orders;orders,https://hook/a",
        );
        jail.set_env("DATABASE_URL", "postgres://fallback/app");
        jail.set_env("POSTGRES_URL", "postgres://preferred/app");
        jail.set_env("HEALTH_PORT", "8181");
        jail.set_env("HEALTH_PATH", "/ready");

        let config = load(&[])?;

        assert_eq!(
            config.routes,
            vec!["orders arn:aws:sns:us-east-1:1:orders", "orders https://hook/a"]
        );
        assert_eq!(config.postgres.url, "postgres://preferred/app");
        assert_eq!(config.health.port, 8181);
        assert_eq!(config.health.path, "/ready");
        Ok(())
    });
}

#[test]
fn test_database_url_is_a_fallback() {
    Jail::expect_with(|jail| {
        jail.set_env("PG_BRIDGE_ROUTES", "orders,https://hook/a");
        jail.set_env("DATABASE_URL", "postgres://fallback/app");

        let config = load(&[])?;

        assert_eq!(config.postgres.url, "postgres://fallback/app");
        Ok(())
    });
}

#[test]
fn test_prefixed_env_overrides_file_and_cli_overrides_env() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "bridge.toml",
            r#"
            routes = ["orders https://hook/a"]
            [postgres]
            url = "postgres://file/app"
            [dispatch]
            max_in_flight = 8
            "#,
        )?;
        jail.set_env("PG_BRIDGE_DISPATCH__MAX_IN_FLIGHT", "16");
        jail.set_env("PG_BRIDGE_LOG_LEVEL", "warn");

        let config = load(&["-c", "bridge.toml"])?;
        assert_eq!(config.dispatch.max_in_flight, 16);
        assert_eq!(config.log_level, "warn");

        let config = load(&["-c", "bridge.toml", "--max-in-flight", "32", "--log-level", "trace"])?;
        assert_eq!(config.dispatch.max_in_flight, 32);
        assert_eq!(config.log_level, "trace");
        Ok(())
    });
}

#[test]
fn test_cli_routes_replace_configured_routes() {
    Jail::expect_with(|jail| {
        jail.set_env("PG_BRIDGE_ROUTES", "orders,https://hook/a");
        jail.set_env("POSTGRES_URL", "postgres://env/app");

        let config = load(&["--route", "billing topic:arn:b", "--metrics"])?;

        assert_eq!(config.routes, vec!["billing topic:arn:b"]);
        assert!(config.metrics.enabled);
        Ok(())
    });
}

#[test]
fn test_missing_config_file_is_an_error() {
    Jail::expect_with(|_jail| {
        let err = load(&["-c", "does-not-exist.toml"]).unwrap_err();
        assert!(err.to_string().contains("could not read config file"));
        Ok(())
    });
}

#[test]
fn test_validation_errors_are_reported() {
    Jail::expect_with(|jail| {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("postgres.url"));

        jail.set_env("POSTGRES_URL", "postgres://env/app");
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("no routes configured"));

        jail.set_env("PG_BRIDGE_ROUTES", "orders");
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("routes[0]"));

        jail.set_env("PG_BRIDGE_ROUTES", "orders,https://hook/a");
        jail.set_env("HEALTH_PATH", "health");
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("health.path"));
        Ok(())
    });
}
