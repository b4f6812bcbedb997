//! # Dispatcher
//!
//! Consumes the listener's notification stream and fans each notification
//! out to every sink registered for its channel. Each delivery runs as its
//! own task; the loop never waits on a delivery's result.
//!
//! The number of running deliveries is bounded by a semaphore. When the
//! bound is reached the `OverloadPolicy` decides whether the loop waits for
//! a free slot or drops the delivery.

use crate::core::{Notification, Publishers, Sink, SinkPublisher};
use crate::internal_metrics::Metrics;
use crate::routing::RouteTable;
use clap::ValueEnum;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn, Instrument, Span};

/// What to do with a delivery when `max_in_flight` deliveries are running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OverloadPolicy {
    /// Stop reading notifications until a slot frees up.
    #[default]
    Wait,
    /// Drop the delivery and count it.
    Shed,
}

/// Runtime settings for the `Dispatcher`.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_in_flight: usize,
    pub overload_policy: OverloadPolicy,
    /// How long `run` waits for running deliveries after its input ends.
    pub drain_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1024,
            overload_policy: OverloadPolicy::Wait,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// The result of dispatching one notification.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Delivery tasks started.
    pub launched: usize,
    /// Deliveries dropped by the `Shed` policy.
    pub shed: usize,
}

pub struct Dispatcher {
    table: Arc<RouteTable>,
    publishers: Publishers,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
    metrics: Arc<Metrics>,
    span: Span,
}

impl Dispatcher {
    pub fn new(
        table: Arc<RouteTable>,
        publishers: Publishers,
        config: DispatcherConfig,
        metrics: Arc<Metrics>,
        span: Span,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            table,
            publishers,
            config,
            permits,
            tasks: JoinSet::new(),
            metrics,
            span,
        }
    }

    /// Deliveries currently running.
    pub fn in_flight(&self) -> usize {
        self.config.max_in_flight.max(1) - self.permits.available_permits()
    }

    /// Launches one delivery task per sink registered for the notification's
    /// channel. A channel with no sinks is logged and counted.
    ///
    /// Under `OverloadPolicy::Wait` this only returns once every delivery has
    /// been launched.
    pub async fn dispatch(&mut self, notification: Notification) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        info!(
            channel = %notification.channel,
            payload = %notification.payload,
            process_id = ?notification.process_id,
            "Received notification"
        );

        let table = Arc::clone(&self.table);
        let sinks = table.sinks_for(&notification.channel);
        if sinks.is_empty() {
            warn!(channel = %notification.channel, "No sink registered for channel");
            self.metrics.record_unrouted(&notification.channel);
            return outcome;
        }

        let notification = Arc::new(notification);
        for sink in sinks {
            let Some(permit) = self.acquire(sink).await else {
                outcome.shed += 1;
                continue;
            };
            let publisher = Arc::clone(self.publishers.for_kind(sink.kind()));
            let task = deliver(
                publisher,
                sink.clone(),
                Arc::clone(&notification),
                Arc::clone(&self.metrics),
                permit,
            );
            self.metrics.deliveries_in_flight.increment(1.0);
            self.tasks.spawn(task.instrument(self.span.clone()));
            outcome.launched += 1;
        }
        outcome
    }

    async fn acquire(&self, sink: &Sink) -> Option<OwnedSemaphorePermit> {
        match self.config.overload_policy {
            OverloadPolicy::Wait => {
                if self.permits.available_permits() == 0 {
                    debug!(sink = %sink, "Delivery limit reached, waiting for a free slot");
                }
                Arc::clone(&self.permits).acquire_owned().await.ok()
            }
            OverloadPolicy::Shed => match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(
                        sink = %sink,
                        max_in_flight = self.config.max_in_flight,
                        "Delivery limit reached, dropping delivery"
                    );
                    self.metrics.record_shed(sink.kind());
                    None
                }
            },
        }
    }

    /// Dispatches every notification from `notifications` until the stream
    /// ends or shutdown is signalled, then drains running deliveries.
    pub async fn run<S>(mut self, mut notifications: S, mut shutdown_rx: watch::Receiver<bool>)
    where
        S: Stream<Item = Notification> + Unpin,
    {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!(parent: &self.span, "Dispatcher received shutdown signal");
                    break;
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.reap(joined);
                }
                next = notifications.next() => match next {
                    Some(notification) => {
                        // Under `Wait` a full dispatcher parks here; shutdown
                        // drops the deliveries not yet launched.
                        let stopped = tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => true,
                            _ = self.dispatch(notification) => false,
                        };
                        if stopped {
                            info!(parent: &self.span, "Dispatcher received shutdown signal while waiting for a delivery slot");
                            break;
                        }
                    }
                    None => {
                        info!(parent: &self.span, "Notification stream ended");
                        break;
                    }
                },
            }
        }
        self.drain().await;
    }

    /// Waits up to `drain_timeout` for running deliveries, then aborts the
    /// rest.
    pub async fn drain(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        info!(parent: &self.span, pending = self.tasks.len(), "Draining in-flight deliveries");

        let deadline = tokio::time::sleep(self.config.drain_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = self.tasks.join_next() => match joined {
                    Some(joined) => self.reap(joined),
                    None => return,
                },
                _ = &mut deadline => {
                    let abandoned = self.tasks.len();
                    warn!(
                        parent: &self.span,
                        abandoned,
                        "Drain timeout elapsed, aborting remaining deliveries"
                    );
                    self.tasks.shutdown().await;
                    self.metrics.deliveries_in_flight.decrement(abandoned as f64);
                    return;
                }
            }
        }
    }

    fn reap(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(parent: &self.span, "Delivery task panicked: {}", e);
            }
        }
    }
}

async fn deliver(
    publisher: Arc<dyn SinkPublisher>,
    sink: Sink,
    notification: Arc<Notification>,
    metrics: Arc<Metrics>,
    _permit: OwnedSemaphorePermit,
) {
    let kind = sink.kind();
    let result = publisher
        .deliver(&notification.channel, &sink, &notification.payload)
        .await;
    metrics.deliveries_in_flight.decrement(1.0);

    match result {
        Ok(()) => {
            debug!(channel = %notification.channel, sink = %sink, publisher = publisher.name(), "Delivery complete");
            metrics.record_delivery(kind, true);
        }
        Err(e) => {
            error!(
                channel = %notification.channel,
                sink = %sink,
                payload = %notification.payload,
                error = %e,
                "Failed to deliver notification"
            );
            metrics.record_delivery(kind, false);
        }
    }
}
