//! The main application logic, decoupled from the entry point.

use crate::{
    config::Config,
    core::Publishers,
    dispatcher::Dispatcher,
    error::BridgeError,
    health::{HealthMonitor, HealthServer, LivenessProbe},
    internal_metrics::{Metrics, MetricsBuilder},
    listener::{Connector, ListenerManager, ListenerState, PgConnector},
    publishers::{SnsPublisher, WebhookPublisher},
    task_manager::TaskManager,
};
use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, instrument, Instrument};

/// Extra time granted to tasks beyond the dispatcher's drain period.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A handle to the running application.
pub struct App {
    task_manager: TaskManager,
    listener: Arc<ListenerManager>,
    health_addr: Option<SocketAddr>,
    shutdown_grace: Duration,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    /// The address the health server is bound to, if it runs.
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
    }

    pub fn listener_state(&self) -> ListenerState {
        self.listener.state()
    }

    /// Waits for the shutdown signal, releases the listener and joins every
    /// task. Returns an error when the listener failed.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.task_manager.shutdown_signal();
        shutdown_rx.wait_for(|stop| *stop).await.ok();
        info!("Shutdown signal received. Waiting for tasks to complete...");

        self.listener.close().await;
        let panics = self.task_manager.join(self.shutdown_grace).await;
        if panics > 0 {
            error!(panics, "Some tasks panicked during shutdown");
        }

        match self.listener.failure() {
            Some(reason) => Err(BridgeError::Subscription(reason).into()),
            None => Ok(()),
        }
    }
}

/// Builder for the main application.
///
/// Components that talk to the outside world can be overridden for tests.
pub struct AppBuilder {
    config: Config,
    connector_override: Option<Arc<dyn Connector>>,
    publishers_override: Option<Publishers>,
    metrics_override: Option<Metrics>,
    health_addr_override: Option<SocketAddr>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            connector_override: None,
            publishers_override: None,
            metrics_override: None,
            health_addr_override: None,
        }
    }

    /// Overrides the notification source for testing.
    pub fn connector_override(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector_override = Some(connector);
        self
    }

    /// Overrides the sink publishers for testing.
    pub fn publishers_override(mut self, publishers: Publishers) -> Self {
        self.publishers_override = Some(publishers);
        self
    }

    /// Overrides the metrics system for testing.
    pub fn metrics_override(mut self, metrics: Metrics) -> Self {
        self.metrics_override = Some(metrics);
        self
    }

    /// Serves the health endpoint on `addr` regardless of `health.port`.
    pub fn health_addr_override(mut self, addr: SocketAddr) -> Self {
        self.health_addr_override = Some(addr);
        self
    }

    /// Builds and starts every component. The listener is subscribed to all
    /// routed channels before this returns.
    ///
    /// On a fatal startup error the listener is closed before returning.
    #[instrument(skip_all)]
    pub async fn build(self, task_manager: TaskManager) -> Result<App> {
        let config = self.config;

        // 1. Metrics
        let (metrics, prom_handle) = match self.metrics_override {
            Some(m) => (m, None),
            None => MetricsBuilder::new(config.metrics.clone()).build(),
        };
        let metrics = Arc::new(metrics);

        // 2. Routes and publishers
        let table = Arc::new(config.route_table()?);
        info!(
            routes = table.len(),
            channels = ?table.channels(),
            "Loaded routing table"
        );

        let publishers = match self.publishers_override {
            Some(publishers) => publishers,
            None => {
                let webhook = WebhookPublisher::new(Duration::from_millis(config.webhook.timeout_ms))?;
                let sns = SnsPublisher::from_config(&config.sns).await;
                Publishers::new(Arc::new(sns), Arc::new(webhook))
            }
        };

        // 3. Listener
        let connector: Arc<dyn Connector> = match self.connector_override {
            Some(connector) => connector,
            None => Arc::new(PgConnector::new(&config.postgres.url)?),
        };
        let listener = Arc::new(ListenerManager::new(
            connector,
            config.listener_config(),
            metrics.clone(),
            info_span!("listener"),
        ));

        if let Err(e) = listener.start(table.channels()).await {
            listener.close().await;
            return Err(e).context("could not subscribe to the routed channels");
        }
        let notifications = listener
            .notifications()
            .ok_or_else(|| BridgeError::Subscription("notification stream already taken".into()))?;

        // 4. Dispatcher
        let dispatch_config = config.dispatcher_config();
        let shutdown_grace = dispatch_config.drain_timeout + SHUTDOWN_GRACE;
        let dispatcher_span = info_span!("dispatcher");
        let dispatcher = Dispatcher::new(
            table,
            publishers,
            dispatch_config,
            metrics.clone(),
            dispatcher_span.clone(),
        );
        task_manager.spawn(
            "Dispatcher",
            dispatcher
                .run(notifications, task_manager.shutdown_signal())
                .instrument(dispatcher_span),
        );

        // 5. Shut down when the listener fails.
        let watch_manager = task_manager.clone();
        let mut state_rx = listener.subscribe_state();
        let mut shutdown_rx = task_manager.shutdown_signal();
        task_manager.spawn("ListenerWatch", async move {
            let failed = async {
                state_rx
                    .wait_for(|state| *state == ListenerState::Failed)
                    .await
                    .is_ok()
            };
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    debug!("Listener watch received shutdown signal.");
                }
                failed = failed => {
                    if failed {
                        error!("Listener entered the Failed state");
                        watch_manager.trigger_shutdown("listener failed");
                    }
                }
            }
        });

        // 6. Health endpoint
        let health_addr = match self.health_addr_override {
            Some(addr) => Some(addr),
            None if config.health.port != 0 => {
                Some(SocketAddr::from(([0, 0, 0, 0], config.health.port)))
            }
            None => None,
        };
        let health_addr = match health_addr {
            Some(addr) => {
                let span = info_span!("health");
                let probe: Arc<dyn LivenessProbe> = listener.clone();
                let monitor = HealthMonitor::new(
                    probe,
                    Duration::from_secs(config.health.interval_seconds.max(1)),
                    span.clone(),
                );
                monitor.spawn(&task_manager);

                let tcp = match TcpListener::bind(addr).await {
                    Ok(tcp) => tcp,
                    Err(e) => {
                        task_manager.trigger_shutdown("health endpoint unavailable");
                        listener.close().await;
                        return Err(e).with_context(|| format!("could not bind health endpoint on {}", addr));
                    }
                };
                let bound = tcp.local_addr().unwrap_or(addr);
                let server = HealthServer::new(
                    tcp,
                    config.health.path.clone(),
                    monitor,
                    prom_handle,
                    task_manager.shutdown_signal(),
                );
                task_manager.spawn("HealthServer", server.run().instrument(span));
                info!(addr = %bound, path = %config.health.path, "Health endpoint listening");
                Some(bound)
            }
            None => {
                debug!("Health endpoint disabled");
                None
            }
        };

        Ok(App {
            task_manager,
            listener,
            health_addr,
            shutdown_grace,
        })
    }
}
