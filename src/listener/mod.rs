//! Persistent subscription to the notification source.
//!
//! The `ListenerManager` owns the connection. A supervisor task connects,
//! issues one `LISTEN` per channel, forwards notifications into the stream
//! handed out by `notifications()`, and reconnects with exponential backoff
//! when the connection drops. Only errors the source classifies as fatal end
//! the supervisor in the `Failed` state.

pub mod postgres;
pub mod source;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use postgres::PgConnector;
pub use source::{Connector, ErrorClass, RawNotification, Session, SourceConnection, SourceError};

use crate::{
    core::Notification,
    error::{BridgeError, Result},
    internal_metrics::Metrics,
};
use chrono::Utc;
use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Notifications buffered between the supervisor and the dispatcher.
const NOTIFICATION_BUFFER: usize = 1024;

/// How long `close` waits for the supervisor before aborting it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// The notification sequence handed out by `ListenerManager::notifications`.
pub type NotificationStream = ReceiverStream<Notification>;

/// Lifecycle of the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Listening,
    Reconnecting,
    Failed,
}

impl ListenerState {
    fn gauge_value(self) -> f64 {
        match self {
            ListenerState::Disconnected => 0.0,
            ListenerState::Connecting => 1.0,
            ListenerState::Listening => 2.0,
            ListenerState::Reconnecting => 3.0,
            ListenerState::Failed => 4.0,
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerState::Disconnected => "disconnected",
            ListenerState::Connecting => "connecting",
            ListenerState::Listening => "listening",
            ListenerState::Reconnecting => "reconnecting",
            ListenerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Reconnect and probe timings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub min_reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            min_reconnect_interval: Duration::from_secs(10),
            max_reconnect_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// State shared between the manager and its supervisor task.
struct Shared {
    connector: Arc<dyn Connector>,
    config: ListenerConfig,
    state_tx: watch::Sender<ListenerState>,
    session: Mutex<Option<Arc<dyn Session>>>,
    failure: Mutex<Option<String>>,
    metrics: Arc<Metrics>,
}

impl Shared {
    fn state(&self) -> ListenerState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ListenerState) {
        let previous = self.state_tx.send_replace(next);
        self.metrics.set_listener_state(next.gauge_value());
        if previous != next {
            match next {
                ListenerState::Failed => error!(from = %previous, "Listener state is now FAILED"),
                ListenerState::Reconnecting => warn!(from = %previous, "Listener state is now RECONNECTING"),
                _ => info!(from = %previous, to = %next, "Listener state changed"),
            }
        }
    }

    fn fail(&self, reason: String) {
        error!(error = %reason, "Listener hit a non-recoverable error");
        *self.failure.lock().unwrap() = Some(reason);
        self.set_state(ListenerState::Failed);
    }

    fn current_session(&self) -> Option<Arc<dyn Session>> {
        self.session.lock().unwrap().clone()
    }

    fn replace_session(&self, session: Option<Arc<dyn Session>>) {
        *self.session.lock().unwrap() = session;
    }
}

/// Why an attempt to (re)establish the subscription failed.
enum EstablishError {
    Connect(SourceError),
    Listen(String, SourceError),
}

/// Why a live connection stopped producing notifications.
enum PumpExit {
    Shutdown,
    ConsumerGone,
    Lost(SourceError),
}

/// Keeps the process subscribed to every routed channel.
pub struct ListenerManager {
    shared: Arc<Shared>,
    notifications_tx: Mutex<Option<mpsc::Sender<Notification>>>,
    notifications_rx: Mutex<Option<mpsc::Receiver<Notification>>>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl ListenerManager {
    /// Creates a manager in the `Disconnected` state. Nothing connects until
    /// `start` is called.
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ListenerConfig,
        metrics: Arc<Metrics>,
        span: Span,
    ) -> Self {
        let (state_tx, _) = watch::channel(ListenerState::Disconnected);
        let (notifications_tx, notifications_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                state_tx,
                session: Mutex::new(None),
                failure: Mutex::new(None),
                metrics,
            }),
            notifications_tx: Mutex::new(Some(notifications_tx)),
            notifications_rx: Mutex::new(Some(notifications_rx)),
            shutdown_tx,
            supervisor: Mutex::new(None),
            span,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.shared.state()
    }

    /// A watch on state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.shared.state_tx.subscribe()
    }

    /// The reason the manager entered `Failed`, if it did.
    pub fn failure(&self) -> Option<String> {
        self.shared.failure.lock().unwrap().clone()
    }

    /// Opens the subscription and starts the supervisor.
    ///
    /// Returns once the first attempt has settled: `Ok` when listening, or
    /// when a transient connection error left the manager reconnecting;
    /// `Err(Subscription)` when the manager failed.
    pub async fn start(&self, channels: BTreeSet<String>) -> Result<()> {
        if channels.is_empty() {
            return Err(BridgeError::config("no channels to listen on"));
        }
        let notifications_tx = self
            .notifications_tx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BridgeError::Subscription("listener already started".into()))?;

        let mut state_rx = self.subscribe_state();
        self.shared.set_state(ListenerState::Connecting);

        let supervisor = Supervisor {
            shared: self.shared.clone(),
            channels,
            notifications_tx,
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(supervisor.run(shutdown_rx).instrument(self.span.clone()));
        *self.supervisor.lock().unwrap() = Some(handle);

        let settled = state_rx
            .wait_for(|state| *state != ListenerState::Connecting)
            .await
            .map(|state| *state)
            .unwrap_or(ListenerState::Failed);

        match settled {
            ListenerState::Failed => Err(BridgeError::Subscription(
                self.failure()
                    .unwrap_or_else(|| "listener stopped during startup".into()),
            )),
            ListenerState::Reconnecting => {
                warn!(parent: &self.span, "Initial connection failed, retrying in the background");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Hands out the notification sequence. Returns `None` after the first call.
    ///
    /// The stream yields notifications in source order and ends when the
    /// manager fails or is closed.
    pub fn notifications(&self) -> Option<NotificationStream> {
        self.notifications_rx
            .lock()
            .unwrap()
            .take()
            .map(ReceiverStream::new)
    }

    /// Round-trips over the current connection, bounded by the probe timeout.
    pub async fn probe(&self) -> Result<()> {
        let state = self.state();
        if state == ListenerState::Failed {
            return Err(BridgeError::Probe(format!(
                "listener failed: {}",
                self.failure().unwrap_or_default()
            )));
        }
        let session = self
            .shared
            .current_session()
            .ok_or_else(|| BridgeError::Probe(format!("not connected (listener is {})", state)))?;

        let timeout = self.shared.config.probe_timeout;
        match tokio::time::timeout(timeout, session.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::Probe(e.to_string())),
            Err(_) => Err(BridgeError::Probe(format!("ping timed out after {:?}", timeout))),
        }
    }

    /// Stops the supervisor and releases the connection. Safe to call more
    /// than once.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.supervisor.lock().unwrap().take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    error!(parent: &self.span, "Listener supervisor panicked: {:?}", e);
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(parent: &self.span, timeout = ?CLOSE_TIMEOUT, "Listener supervisor did not stop, aborting it");
                    handle.abort();
                }
            }
        }
        self.shared.replace_session(None);
        if self.state() != ListenerState::Failed {
            self.shared.set_state(ListenerState::Disconnected);
        }
        info!(parent: &self.span, "Listener closed");
    }
}

impl Drop for ListenerManager {
    fn drop(&mut self) {
        // The supervisor also exits when the sender is dropped; signalling
        // first makes the release explicit.
        let _ = self.shutdown_tx.send(true);
    }
}

struct Supervisor {
    shared: Arc<Shared>,
    channels: BTreeSet<String>,
    notifications_tx: mpsc::Sender<Notification>,
}

impl Supervisor {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let config = self.shared.config.clone();
        let mut backoff = config.min_reconnect_interval;
        let mut initial = true;

        loop {
            let attempt = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                attempt = self.establish() => attempt,
            };

            match attempt {
                Ok(mut events) => {
                    initial = false;
                    backoff = config.min_reconnect_interval;
                    self.shared.set_state(ListenerState::Listening);

                    let exit = self.pump(&mut events, &mut shutdown_rx).await;
                    self.shared.replace_session(None);
                    match exit {
                        PumpExit::Shutdown => break,
                        PumpExit::ConsumerGone => {
                            info!("Notification consumer is gone, stopping listener");
                            break;
                        }
                        PumpExit::Lost(e) if e.is_fatal() => {
                            self.shared.fail(e.message);
                            break;
                        }
                        PumpExit::Lost(e) => {
                            warn!(error = %e, "Lost connection to the notification source");
                            self.shared.metrics.listener_reconnects_total.increment(1);
                            self.shared.set_state(ListenerState::Reconnecting);
                        }
                    }
                }
                Err(EstablishError::Connect(e)) if e.is_fatal() => {
                    self.shared.fail(format!("could not connect: {}", e));
                    break;
                }
                Err(EstablishError::Listen(channel, e)) if initial || e.is_fatal() => {
                    self.shared
                        .fail(format!("could not listen on '{}': {}", channel, e));
                    break;
                }
                Err(EstablishError::Connect(e)) | Err(EstablishError::Listen(_, e)) => {
                    warn!(error = %e, retry_in = ?backoff, "Could not establish subscription");
                    self.shared.set_state(ListenerState::Reconnecting);
                }
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = std::cmp::min(backoff * 2, config.max_reconnect_interval);
        }

        self.shared.replace_session(None);
        debug!("Listener supervisor finished");
    }

    /// Connects and subscribes every channel. The session is published for
    /// the probe only once all channels are subscribed.
    async fn establish(
        &self,
    ) -> std::result::Result<mpsc::UnboundedReceiver<source::SourceEvent>, EstablishError> {
        let connection = self
            .shared
            .connector
            .connect()
            .await
            .map_err(EstablishError::Connect)?;

        for channel in &self.channels {
            info!(channel = %channel, "Listening on channel");
            connection
                .session
                .listen(channel)
                .await
                .map_err(|e| EstablishError::Listen(channel.clone(), e))?;
        }

        self.shared.replace_session(Some(connection.session));
        Ok(connection.events)
    }

    /// Forwards notifications until the connection ends or shutdown is signalled.
    async fn pump(
        &self,
        events: &mut mpsc::UnboundedReceiver<source::SourceEvent>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return PumpExit::Shutdown,
                event = events.recv() => event,
            };

            match event {
                Some(Ok(raw)) => {
                    let notification = Notification {
                        channel: raw.channel,
                        payload: raw.payload,
                        received_at: Utc::now(),
                        process_id: raw.process_id,
                    };
                    self.shared.metrics.record_notification(&notification.channel);
                    // A full buffer must not hold the supervisor past shutdown.
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => return PumpExit::Shutdown,
                        sent = self.notifications_tx.send(notification) => {
                            if sent.is_err() {
                                return PumpExit::ConsumerGone;
                            }
                        }
                    }
                }
                Some(Err(e)) => return PumpExit::Lost(e),
                None => return PumpExit::Lost(SourceError::transient("connection closed")),
            }
        }
    }
}
