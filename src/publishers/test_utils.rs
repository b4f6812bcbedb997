//! A recording `SinkPublisher` for tests.

use crate::core::{Sink, SinkPublisher};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// One delivery attempt seen by a `RecordingPublisher`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: String,
    pub sink: Sink,
    pub payload: String,
}

/// Records every delivery attempt. Attempts can be made to fail per sink
/// target, or held back until the test releases them.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    attempts: Arc<Mutex<Vec<Delivery>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    gate: Option<Arc<Semaphore>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A publisher whose deliveries block until `release` is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    /// Lets `n` blocked deliveries complete.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn fail_for(&self, target: &str) {
        self.failing.lock().unwrap().insert(target.to_string());
    }

    pub fn attempts(&self) -> Vec<Delivery> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// Deliveries that have started but not finished.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// The highest number of concurrently running deliveries observed.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Waits until at least `expected` attempts were recorded, or the
    /// timeout elapses. Returns the attempts seen so far.
    pub async fn wait_for_attempts(&self, expected: usize, timeout: Duration) -> Vec<Delivery> {
        let _ = tokio::time::timeout(timeout, async {
            while self.attempt_count() < expected {
                self.notify.notified().await;
            }
        })
        .await;
        self.attempts()
    }
}

#[async_trait]
impl SinkPublisher for RecordingPublisher {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, channel: &str, sink: &Sink, payload: &str) -> Result<()> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        self.attempts.lock().unwrap().push(Delivery {
            channel: channel.to_string(),
            sink: sink.clone(),
            payload: payload.to_string(),
        });
        self.notify.notify_one();

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(sink.target()) {
            return Err(BridgeError::delivery(sink, "injected failure"));
        }
        Ok(())
    }
}
