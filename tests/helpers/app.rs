//! A running application wired to a `FakeConnector` and recording publishers.

use anyhow::Result;
use pg_bridge::{
    app::App,
    config::Config,
    core::Publishers,
    internal_metrics::Metrics,
    listener::{test_utils::FakeConnector, ListenerState},
    publishers::test_utils::RecordingPublisher,
    task_manager::TaskManager,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::timeout};

pub struct TestApp {
    pub source: FakeConnector,
    pub topics: RecordingPublisher,
    pub webhooks: RecordingPublisher,
    pub task_manager: TaskManager,
    pub health_addr: Option<SocketAddr>,
    app_handle: Option<JoinHandle<Result<()>>>,
}

impl TestApp {
    /// Raises the shutdown signal and waits for the app to finish.
    pub async fn shutdown(mut self, timeout_duration: Duration) -> Result<()> {
        self.task_manager.trigger_shutdown("test finished");
        self.wait(timeout_duration).await
    }

    /// Waits for the app to stop on its own.
    pub async fn wait(&mut self, timeout_duration: Duration) -> Result<()> {
        let handle = self
            .app_handle
            .take()
            .expect("the app has already been awaited");
        match timeout(timeout_duration, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(anyhow::anyhow!("App failed to shut down within the timeout")),
        }
    }
}

pub struct TestAppBuilder {
    config: Config,
    source: FakeConnector,
    topics: RecordingPublisher,
    webhooks: RecordingPublisher,
    with_health: bool,
}

impl TestAppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            source: FakeConnector::new(),
            topics: RecordingPublisher::new(),
            webhooks: RecordingPublisher::new(),
            with_health: false,
        }
    }

    /// Uses a connector the test has already primed.
    pub fn with_source(mut self, source: FakeConnector) -> Self {
        self.source = source;
        self
    }

    pub fn with_webhooks(mut self, webhooks: RecordingPublisher) -> Self {
        self.webhooks = webhooks;
        self
    }

    /// Serves the health endpoint on an ephemeral local port.
    pub fn with_health(mut self) -> Self {
        self.with_health = true;
        self
    }

    pub async fn start(self) -> Result<TestApp> {
        let task_manager = TaskManager::new();
        let mut builder = App::builder(self.config)
            .connector_override(Arc::new(self.source.clone()))
            .publishers_override(Publishers::new(
                Arc::new(self.topics.clone()),
                Arc::new(self.webhooks.clone()),
            ))
            .metrics_override(Metrics::new_for_test());
        if self.with_health {
            builder = builder.health_addr_override(SocketAddr::from(([127, 0, 0, 1], 0)));
        }

        let app = match builder.build(task_manager.clone()).await {
            Ok(app) => app,
            Err(e) => {
                task_manager.trigger_shutdown("startup failed");
                task_manager.join(Duration::from_secs(1)).await;
                return Err(e);
            }
        };
        assert_eq!(app.listener_state(), ListenerState::Listening);
        let health_addr = app.health_addr();
        let app_handle = tokio::spawn(app.run());

        Ok(TestApp {
            source: self.source,
            topics: self.topics,
            webhooks: self.webhooks,
            task_manager,
            health_addr,
            app_handle: Some(app_handle),
        })
    }
}
