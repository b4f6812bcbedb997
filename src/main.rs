//! pg-bridge - PostgreSQL LISTEN/NOTIFY bridge
//!
//! Fans database notifications out to SNS topics and HTTP webhooks.

use anyhow::Result;
use clap::Parser;
use pg_bridge::{app::App, cli::Cli, config::Config, task_manager::TaskManager};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// How long tasks get to stop when startup fails half-way.
const STARTUP_ABORT_GRACE: Duration = Duration::from_secs(2);

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_requested() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "sigterm",
            },
            Err(e) => {
                error!("Could not install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "ctrl-c"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}

async fn run(config: Config) -> Result<()> {
    let task_manager = TaskManager::new();

    let signal_manager = task_manager.clone();
    tokio::spawn(async move {
        let signal = shutdown_requested().await;
        signal_manager.trigger_shutdown(signal);
    });

    let app = match App::builder(config).build(task_manager.clone()).await {
        Ok(app) => app,
        Err(e) => {
            task_manager.trigger_shutdown("startup failed");
            task_manager.join(STARTUP_ABORT_GRACE).await;
            return Err(e);
        }
    };
    info!("pg-bridge is running");
    app.run().await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            init_tracing("info");
            error!("Failed to load configuration: {:#}", err);
            std::process::exit(1);
        }
    };

    init_tracing(&config.log_level);

    info!("pg-bridge starting up...");
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    info!("Routes: {}", config.routes.len());
    if config.health.port != 0 {
        info!("Health Endpoint: :{}{}", config.health.port, config.health.path);
    } else {
        info!("Health Endpoint: Disabled");
    }
    info!(
        "Dispatch: max_in_flight={} policy={:?}",
        config.dispatch.max_in_flight, config.dispatch.overload_policy
    );
    info!("Metrics: {}", if config.metrics.enabled { "Enabled" } else { "Disabled" });
    info!("-------------------------------------------------------");

    if let Err(e) = run(config).await {
        error!("pg-bridge stopped: {:#}", e);
        std::process::exit(1);
    }
    info!("pg-bridge shut down cleanly.");
}
