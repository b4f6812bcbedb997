//! In-memory notification source for tests.

use super::source::{Connector, RawNotification, Session, SourceConnection, SourceError, SourceEvent};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeSourceState {
    connect_failures: VecDeque<SourceError>,
    listen_failures: HashMap<String, SourceError>,
    ping_failure: Option<SourceError>,
    ping_delay: Option<Duration>,
    current: Option<mpsc::UnboundedSender<SourceEvent>>,
    connects: usize,
    listens: Vec<String>,
}

/// A `Connector` whose connections are driven by the test.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeSourceState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next connection attempt fail with `err`.
    pub fn fail_next_connect(&self, err: SourceError) {
        self.state.lock().unwrap().connect_failures.push_back(err);
    }

    /// Makes every `LISTEN` on `channel` fail until cleared.
    pub fn fail_listen(&self, channel: &str, err: SourceError) {
        self.state
            .lock()
            .unwrap()
            .listen_failures
            .insert(channel.to_string(), err);
    }

    pub fn clear_listen_failures(&self) {
        self.state.lock().unwrap().listen_failures.clear();
    }

    pub fn fail_ping(&self, err: Option<SourceError>) {
        self.state.lock().unwrap().ping_failure = err;
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        self.state.lock().unwrap().ping_delay = Some(delay);
    }

    /// Emits a notification on the current connection. Returns `false` if
    /// there is no open connection.
    pub fn notify(&self, channel: &str, payload: &str) -> bool {
        let state = self.state.lock().unwrap();
        match &state.current {
            Some(tx) => tx
                .send(Ok(RawNotification {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                    process_id: Some(4242),
                }))
                .is_ok(),
            None => false,
        }
    }

    /// Drops the current connection, optionally reporting `err` first.
    pub fn sever(&self, err: Option<SourceError>) {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.current.take() {
            if let Some(err) = err {
                let _ = tx.send(Err(err));
            }
        }
    }

    /// Returns `true` while the listener holds the current connection open.
    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Every successful `LISTEN`, across all connections, in call order.
    pub fn listened_channels(&self) -> Vec<String> {
        self.state.lock().unwrap().listens.clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<SourceConnection, SourceError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.current = Some(tx);
        Ok(SourceConnection {
            session: Arc::new(FakeSession {
                state: self.state.clone(),
            }),
            events: rx,
        })
    }
}

struct FakeSession {
    state: Arc<Mutex<FakeSourceState>>,
}

#[async_trait]
impl Session for FakeSession {
    async fn listen(&self, channel: &str) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.listen_failures.get(channel) {
            return Err(err.clone());
        }
        state.listens.push(channel.to_string());
        Ok(())
    }

    async fn ping(&self) -> Result<(), SourceError> {
        let (delay, failure) = {
            let state = self.state.lock().unwrap();
            (state.ping_delay, state.ping_failure.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
