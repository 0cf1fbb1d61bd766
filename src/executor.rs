//! Off-path task execution.
//!
//! The engine hands audit writes to a [`TaskExecutor`] so that evaluating a
//! request never waits on storage.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SubmitError;

/// A unit of background work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks somewhere other than the caller's hot path.
pub trait TaskExecutor: Send + Sync {
    /// Schedule `task`. Must not block; a task that cannot be accepted is
    /// dropped and reported through the error.
    fn submit(&self, task: Task) -> Result<(), SubmitError>;
}

/// Runs every task immediately on the submitting thread.
///
/// Useful in tests and single-shot tools where ordering matters more than
/// latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn submit(&self, task: Task) -> Result<(), SubmitError> {
        task();
        Ok(())
    }
}

/// A fixed set of tokio workers fed by a bounded queue.
///
/// When the queue is full, [`submit`](TaskExecutor::submit) fails with
/// [`SubmitError::Saturated`] instead of waiting.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `workers` workers sharing a queue of `capacity` tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(capacity: usize, workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Task>(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let task = receiver.lock().await.recv().await;
                        let Some(task) = task else { break };
                        if let Err(e) = tokio::task::spawn_blocking(task).await {
                            warn!(worker = id, error = %e, "Background task failed");
                        }
                    }
                    debug!(worker = id, "Worker stopped");
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Stop accepting tasks, then wait for the queued ones to finish.
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker did not shut down cleanly");
            }
        }
    }
}

impl TaskExecutor for WorkerPool {
    fn submit(&self, task: Task) -> Result<(), SubmitError> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(SubmitError::Closed);
        };
        sender.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::Saturated,
            TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.lock().len())
            .field("open", &self.sender.lock().is_some())
            .finish()
    }
}
