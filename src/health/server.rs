//! # Health Server
//!
//! An `axum` server exposing the cached health report on the configured path
//! and, when metrics are enabled, the Prometheus exposition on `/metrics`.
//!
//! The server runs until the shutdown signal is raised.

use super::HealthMonitor;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, trace};

pub struct HealthServer {
    listener: TcpListener,
    path: String,
    monitor: Arc<HealthMonitor>,
    prom_handle: Option<PrometheusHandle>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthServer {
    /// Creates a new `HealthServer` but does not spawn it.
    ///
    /// # Arguments
    ///
    /// * `listener` - A `TcpListener` that has already been bound to an address.
    /// * `path` - The route answering health checks.
    /// * `monitor` - The source of the cached health report.
    /// * `prom_handle` - When set, `/metrics` renders the Prometheus exposition.
    /// * `shutdown_rx` - A watch channel receiver for graceful shutdown.
    pub fn new(
        listener: TcpListener,
        path: impl Into<String>,
        monitor: Arc<HealthMonitor>,
        prom_handle: Option<PrometheusHandle>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            path: path.into(),
            monitor,
            prom_handle,
            shutdown_rx,
        }
    }

    fn router(path: &str, monitor: Arc<HealthMonitor>, prom_handle: Option<PrometheusHandle>) -> Router {
        let mut router = Router::new().route(path, get(health_handler));
        if let Some(handle) = prom_handle {
            router = router.route("/metrics", get(move || async move { handle.render() }));
        }
        router.with_state(monitor)
    }

    /// Returns a future that runs the server until a shutdown signal is received.
    pub fn run(self) -> impl Future<Output = ()> {
        let Self {
            listener,
            path,
            monitor,
            prom_handle,
            mut shutdown_rx,
        } = self;
        let app = Self::router(&path, monitor, prom_handle);

        async move {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    trace!("Health server received shutdown signal.");
                }
                result = axum::serve(listener, app.into_make_service()) => {
                    if let Err(e) = result {
                        error!("Health server error: {}", e);
                    }
                }
            }
            trace!("Health server task finished.");
        }
    }
}

async fn health_handler(State(monitor): State<Arc<HealthMonitor>>) -> impl IntoResponse {
    let report = monitor.report();
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
