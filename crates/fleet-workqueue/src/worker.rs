//! Bounded worker pool driving a reconciler from a work queue.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::queue::WorkQueue;

pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Outcome of a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Nothing more to do until the next change.
    Done,
    /// Come back after the given delay (backoff is reset).
    After(Duration),
}

/// Drives one object towards its desired state.
///
/// `Err` is treated as transient: the key is re-added with rate-limited
/// backoff.
pub trait Reconciler<K>: Send + Sync + 'static {
    fn reconcile(&self, key: K) -> BoxFuture<'_, anyhow::Result<Requeue>>;
}

/// Run `workers` concurrent workers until the queue is shut down.
///
/// A key is never handed to two workers at once, so reconciles of the same
/// object are serialized.
pub async fn run_workers<K, R>(queue: Arc<WorkQueue<K>>, reconciler: Arc<R>, workers: usize)
where
    K: Clone + Eq + Hash + Send + Sync + Debug + Display + 'static,
    R: Reconciler<K>,
{
    let workers = workers.max(1);
    debug!(queue = %queue.name(), workers, "starting workers");
    let mut set = JoinSet::new();
    for id in 0..workers {
        let queue = Arc::clone(&queue);
        let reconciler = Arc::clone(&reconciler);
        set.spawn(async move {
            while let Some(key) = queue.get().await {
                process_one(&queue, &reconciler, key, id).await;
            }
        });
    }
    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(queue = %queue.name(), error = %e, "worker task ended abnormally");
        }
    }
    debug!(queue = %queue.name(), "workers stopped");
}

/// Reconcile one key on its own task so a panic is reported as a failure
/// instead of taking the worker and the key down with it.
async fn process_one<K, R>(queue: &Arc<WorkQueue<K>>, reconciler: &Arc<R>, key: K, worker: usize)
where
    K: Clone + Eq + Hash + Send + Sync + Debug + Display + 'static,
    R: Reconciler<K>,
{
    let handle = {
        let reconciler = Arc::clone(reconciler);
        let key = key.clone();
        tokio::spawn(async move { reconciler.reconcile(key).await })
    };
    let outcome = match handle.await {
        Ok(res) => res,
        Err(e) => Err(anyhow::anyhow!("reconcile ended abnormally: {e}")),
    };
    match outcome {
        Ok(Requeue::Done) => queue.forget(&key),
        Ok(Requeue::After(delay)) => {
            queue.forget(&key);
            queue.add_after(key.clone(), delay);
        }
        Err(e) => {
            warn!(
                queue = %queue.name(),
                worker,
                key = %key,
                requeues = queue.num_requeues(&key),
                error = %e,
                "reconcile failed, retrying with backoff"
            );
            queue.add_rate_limited(key.clone());
        }
    }
    queue.done(&key);
}
