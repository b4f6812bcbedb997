//! # Internal Metrics Module
//!
//! Counters and gauges describing the bridge's traffic, plus the optional
//! Prometheus recorder that exposes them.
//!
//! - **`Metrics`**: a cloneable handle passed into each component's
//!   constructor. It provides high-level methods for the predefined metrics.
//! - **`MetricsBuilder`**: installs the Prometheus recorder when metrics are
//!   enabled and returns the handle used by the health server to render
//!   `/metrics`.

use crate::config::MetricsConfig;
use crate::core::SinkKind;
use metrics::{Counter, Gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::error;

/// The public API for the metrics system.
#[derive(Clone)]
pub struct Metrics {
    pub listener_reconnects_total: Counter,
    pub deliveries_in_flight: Gauge,
    listener_state: Gauge,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a new `Metrics` instance and registers descriptions for all
    /// supported metrics with the global recorder.
    pub fn new() -> Self {
        metrics::describe_counter!("notifications_received_total", Unit::Count, "Total number of notifications received, labeled by channel.");
        metrics::describe_counter!("notifications_unrouted_total", Unit::Count, "Notifications received on a channel with no registered sink.");
        metrics::describe_counter!("deliveries_total", Unit::Count, "Delivery attempts, labeled by sink kind and outcome.");
        metrics::describe_counter!("deliveries_shed_total", Unit::Count, "Deliveries dropped because the in-flight limit was reached.");
        metrics::describe_gauge!("deliveries_in_flight", Unit::Count, "Delivery tasks currently running.");
        metrics::describe_gauge!("listener_state", Unit::Count, "Listener state (0 disconnected, 1 connecting, 2 listening, 3 reconnecting, 4 failed).");
        metrics::describe_counter!("listener_reconnects_total", Unit::Count, "Times the listener lost its connection and started reconnecting.");

        Self {
            listener_reconnects_total: metrics::counter!("listener_reconnects_total"),
            deliveries_in_flight: metrics::gauge!("deliveries_in_flight"),
            listener_state: metrics::gauge!("listener_state"),
        }
    }

    /// Creates a `Metrics` instance for when metrics are disabled. No
    /// recorder is installed, so the handles record nothing.
    pub fn disabled() -> Self {
        Self {
            listener_reconnects_total: metrics::counter!("disabled"),
            deliveries_in_flight: metrics::gauge!("disabled"),
            listener_state: metrics::gauge!("disabled"),
        }
    }

    /// Without an installed recorder the `metrics` macros are no-ops, so
    /// tests can use the real handles.
    pub fn new_for_test() -> Self {
        Self::new()
    }

    pub fn record_notification(&self, channel: &str) {
        metrics::counter!("notifications_received_total", "channel" => channel.to_string()).increment(1);
    }

    pub fn record_unrouted(&self, channel: &str) {
        metrics::counter!("notifications_unrouted_total", "channel" => channel.to_string()).increment(1);
    }

    pub fn record_delivery(&self, kind: SinkKind, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        metrics::counter!("deliveries_total", "kind" => kind.as_str(), "outcome" => outcome).increment(1);
    }

    pub fn record_shed(&self, kind: SinkKind) {
        metrics::counter!("deliveries_shed_total", "kind" => kind.as_str()).increment(1);
    }

    pub fn set_listener_state(&self, value: f64) {
        self.listener_state.set(value);
    }
}

/// Builder for the metrics system.
pub struct MetricsBuilder {
    config: MetricsConfig,
}

impl MetricsBuilder {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    /// Installs the Prometheus recorder and returns the `Metrics` handle and
    /// the handle used to render the exposition.
    ///
    /// If metrics are disabled, or the recorder cannot be installed, returns
    /// a disabled `Metrics` and `None`.
    pub fn build(self) -> (Metrics, Option<PrometheusHandle>) {
        if !self.config.enabled {
            return (Metrics::disabled(), None);
        }

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        if let Err(e) = metrics::set_global_recorder(recorder) {
            error!("Failed to install Prometheus recorder: {}", e);
            return (Metrics::disabled(), None);
        }

        (Metrics::new(), Some(handle))
    }
}
