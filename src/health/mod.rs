//! Health Monitoring Service
//!
//! Periodically probes the listener and caches the result so the HTTP
//! endpoint answers without touching the database.

pub mod server;

use crate::error::Result;
use crate::listener::ListenerManager;
use crate::task_manager::TaskManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn, Instrument, Span};

pub use server::HealthServer;

/// Anything that can answer a liveness round-trip.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self) -> Result<()>;
}

#[async_trait]
impl LivenessProbe for ListenerManager {
    async fn probe(&self) -> Result<()> {
        ListenerManager::probe(self).await
    }
}

/// The body served by the health endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub healthy: bool,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

impl HealthReport {
    fn pending() -> Self {
        Self {
            healthy: false,
            status: "starting",
            error: None,
            checked_at: None,
        }
    }
}

/// Caches the outcome of the most recent probe.
pub struct HealthMonitor {
    probe: Arc<dyn LivenessProbe>,
    interval: Duration,
    report: Mutex<HealthReport>,
    span: Span,
}

impl HealthMonitor {
    /// The monitor reports unhealthy until its first probe completes.
    pub fn new(probe: Arc<dyn LivenessProbe>, interval: Duration, span: Span) -> Arc<Self> {
        Arc::new(Self {
            probe,
            interval,
            report: Mutex::new(HealthReport::pending()),
            span,
        })
    }

    /// Starts the periodic probe task. The first probe runs immediately.
    pub fn spawn(self: &Arc<Self>, task_manager: &TaskManager) {
        let monitor = Arc::clone(self);
        let mut shutdown_rx = task_manager.shutdown_signal();
        let span = self.span.clone();
        task_manager.spawn(
            "HealthMonitor",
            async move {
                let mut interval = tokio::time::interval(monitor.interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            info!("Health monitor received shutdown signal.");
                            break;
                        }
                        _ = interval.tick() => {
                            monitor.check_now().await;
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Runs one probe and records its outcome.
    pub async fn check_now(&self) -> HealthReport {
        let outcome = self.probe.probe().await;
        let was_healthy = self.is_healthy();

        let report = match outcome {
            Ok(()) => {
                if !was_healthy {
                    info!("Listener probe passed, reporting HEALTHY.");
                }
                HealthReport {
                    healthy: true,
                    status: "ok",
                    error: None,
                    checked_at: Some(Utc::now()),
                }
            }
            Err(e) => {
                if was_healthy {
                    error!(error = %e, "Listener probe failed, reporting UNHEALTHY.");
                } else {
                    warn!(error = %e, "Listener probe failed, still UNHEALTHY.");
                }
                HealthReport {
                    healthy: false,
                    status: "unhealthy",
                    error: Some(e.to_string()),
                    checked_at: Some(Utc::now()),
                }
            }
        };

        *self.report.lock().unwrap() = report.clone();
        report
    }

    pub fn is_healthy(&self) -> bool {
        self.report.lock().unwrap().healthy
    }

    pub fn report(&self) -> HealthReport {
        self.report.lock().unwrap().clone()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use crate::error::BridgeError;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A probe whose answer the test controls.
    #[derive(Default)]
    pub struct StaticProbe {
        failing: AtomicBool,
    }

    impl StaticProbe {
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LivenessProbe for StaticProbe {
        async fn probe(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(BridgeError::Probe("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }
}
