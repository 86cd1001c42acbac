//! Generic level-triggered reconciliation machinery
//!
//! A watch source enqueues keys into a keyed, delayed, retrying work
//! queue; a reconcile loop drains the queue and invokes a callback,
//! re-scheduling keys according to the callback's verdict or with
//! exponential backoff on error. The machinery is shared by source
//! adapters through composition rather than duplicated per adapter.

mod queue;

#[cfg(test)]
mod tests;

pub use queue::WorkQueue;

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{error, warn};

/// Consecutive failures tolerated before a key is dropped from the queue
pub const MAX_RETRIES: u32 = 10;

/// What to do with a key after a successful reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Done; no periodic recheck needed
    Forget,
    /// Process the key again after the given delay
    After(Duration),
}

/// Callback invoked for every key the queue hands out
#[async_trait]
pub trait Reconciler: Send + Sync {
    type Key: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static;

    async fn reconcile(&self, key: &Self::Key) -> anyhow::Result<Requeue>;
}

/// Drains a work queue through a reconciler until shutdown
pub struct ReconcileLoop<R: Reconciler> {
    queue: Arc<WorkQueue<R::Key>>,
    reconciler: R,
}

impl<R: Reconciler> ReconcileLoop<R> {
    pub fn new(queue: Arc<WorkQueue<R::Key>>, reconciler: R) -> Self {
        Self { queue, reconciler }
    }

    /// Process keys until the shutdown signal fires or the queue shuts
    /// down. Errors re-enqueue with exponential backoff; after
    /// [`MAX_RETRIES`] consecutive failures the key is dropped and will
    /// only come back through a new watch event.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let key = tokio::select! {
                _ = shutdown.recv() => {
                    self.queue.shut_down();
                    break;
                }
                key = self.queue.next() => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            match self.reconciler.reconcile(&key).await {
                Ok(Requeue::Forget) => self.queue.forget(&key),
                Ok(Requeue::After(delay)) => {
                    self.queue.forget(&key);
                    self.queue.add_after(key, delay);
                }
                Err(error) => {
                    if self.queue.retries(&key) < MAX_RETRIES {
                        let attempt = self.queue.requeue_backoff(&key);
                        warn!(key = %key, attempt, error = %error, "reconcile failed, requeueing with backoff");
                    } else {
                        self.queue.forget(&key);
                        error!(key = %key, error = %error, "reconcile failed too many times, dropping key");
                    }
                }
            }
        }
    }
}
