//! Manages the lifecycle of the background tasks and the shutdown signal.
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Tracks spawned tasks and owns the process-wide shutdown signal.
///
/// Any holder can raise the signal: the binary does so on Ctrl-C or SIGTERM,
/// the application does so when the listener fails. Tasks observe it through
/// `shutdown_signal` and are joined by `join`.
#[derive(Clone, Debug)]
pub struct TaskManager {
    handles: Arc<Mutex<Vec<(&'static str, JoinHandle<()>)>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Spawns a new task and adds its handle to the manager.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task_name = name, "Spawning task");
        let handle = tokio::spawn(future);
        self.handles.lock().unwrap().push((name, handle));
    }

    /// A receiver that changes once shutdown has been requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Raises the shutdown signal. Later calls are no-ops.
    pub fn trigger_shutdown(&self, reason: &str) {
        let already = self.shutdown_tx.send_replace(true);
        if !already {
            info!(reason, "Shutdown requested");
        }
    }

    /// Waits for every managed task, aborting those still running after
    /// `grace`. Returns the number of tasks that panicked.
    pub async fn join(self, grace: Duration) -> usize {
        let handles = self.handles.lock().unwrap().drain(..).collect::<Vec<_>>();
        info!("Waiting for {} tasks to complete...", handles.len());

        let (names, handles): (Vec<&'static str>, Vec<JoinHandle<()>>) = handles.into_iter().unzip();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let mut joined = Box::pin(join_all(handles));
        let results = match tokio::time::timeout(grace, &mut joined).await {
            Ok(results) => results,
            Err(_) => {
                let stuck: Vec<&'static str> = names
                    .iter()
                    .zip(&aborts)
                    .filter(|(_, abort)| !abort.is_finished())
                    .map(|(name, _)| *name)
                    .collect();
                warn!(tasks = ?stuck, "Tasks did not stop in time, aborting");
                aborts.iter().for_each(|abort| abort.abort());
                joined.await
            }
        };

        let mut panics = 0;
        for (task_name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => debug!(task_name, "Task shut down gracefully."),
                Err(e) if e.is_panic() => {
                    error!(task_name, "Task panicked: {}", e);
                    panics += 1;
                }
                Err(_) => debug!(task_name, "Task was aborted."),
            }
        }

        if panics == 0 {
            info!("All tasks shut down.");
        }
        panics
    }
}
