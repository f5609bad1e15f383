//! Stop signal and task handles of one background worker.
//!
//! The owner subscribes each spawned task to the token, registers its handle
//! with [`ShutdownToken::add_task`], and on disable calls
//! [`ShutdownToken::stop`], which signals and then joins every task.

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

pub struct ShutdownToken {
    name: String,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownToken {
    pub fn new(name: impl Into<String>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            name: name.into(),
            stop_tx,
            stop_rx,
            task_handles: Vec::new(),
        }
    }

    /// A receiver for one task, to be awaited with [`wait_for_stop`].
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    pub fn add_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    pub fn task_count(&self) -> usize {
        self.task_handles.len()
    }

    /// Idempotent.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Awaits every registered task, draining the handle list. Returns how
    /// many tasks were joined.
    pub async fn join_all(&mut self) -> usize {
        let handles: Vec<JoinHandle<()>> = self.task_handles.drain(..).collect();
        let joined = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(worker = %self.name, error = %e, "worker task ended abnormally");
            }
        }
        debug!(worker = %self.name, tasks = joined, "worker stopped");
        joined
    }

    pub async fn stop(&mut self) -> usize {
        self.signal_stop();
        self.join_all().await
    }
}

/// Resolves once the stop signal is raised or its sender is gone.
pub async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
