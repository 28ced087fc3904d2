//! Deduplicating work queue.
//!
//! An item is held by at most one worker at a time. Adding an item that is
//! already queued is a no-op; adding one that is being processed marks it
//! dirty so it is queued again when the worker calls [`WorkQueue::done`].

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

use crate::ratelimit::RateLimiter;

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Items waiting to be processed (queued, or re-added while processing).
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(name: &str, limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `item` for processing.
    pub fn add(&self, item: K) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(queue = %self.name, ?item, "item in flight, deferred");
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Queue `item` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, item: K, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Queue `item` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(self: &Arc<Self>, item: K) {
        let delay = self.limiter.when(&item);
        trace!(queue = %self.name, ?item, ?delay, "rate-limited requeue");
        self.add_after(item, delay);
    }

    /// Stop backoff tracking for `item`.
    pub fn forget(&self, item: &K) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Mark `item` as processed. Re-queues it if it was added meanwhile.
    pub fn done(&self, item: &K) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Number of items waiting (not counting in-flight ones).
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiting worker and refuse new items.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ItemExponentialRateLimiter;

    fn test_queue() -> Arc<WorkQueue<String>> {
        Arc::new(WorkQueue::new(
            "test",
            Box::new(ItemExponentialRateLimiter::new(
                Duration::from_millis(5),
                Duration::from_secs(1),
            )),
        ))
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = test_queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn item_in_flight_is_requeued_on_done() {
        let q = test_queue();
        q.add("a".to_string());
        let item = q.get().await.unwrap();

        // Re-added while processing: not handed to another worker yet.
        q.add("a".to_string());
        assert!(q.is_empty());

        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn done_without_readd_drops_item() {
        let q = test_queue();
        q.add("a".to_string());
        let item = q.get().await.unwrap();
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn get_waits_for_add() {
        let q = test_queue();
        let q2 = Arc::clone(&q);
        let waiter = tokio::spawn(async move { q2.get().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.add("late".to_string());
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn add_after_delays_item() {
        let q = test_queue();
        q.add_after("a".to_string(), Duration::from_millis(30));
        assert!(q.is_empty());
        let got = tokio::time::timeout(Duration::from_secs(1), q.get()).await.unwrap();
        assert_eq!(got.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn rate_limited_add_counts_requeues() {
        let q = test_queue();
        q.add_rate_limited("a".to_string());
        q.add_rate_limited("a".to_string());
        assert_eq!(q.num_requeues(&"a".to_string()), 2);
        q.forget(&"a".to_string());
        assert_eq!(q.num_requeues(&"a".to_string()), 0);
    }

    #[tokio::test]
    async fn shut_down_releases_waiters() {
        let q = test_queue();
        let q2 = Arc::clone(&q);
        let waiter = tokio::spawn(async move { q2.get().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shut_down();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());

        q.add("ignored".to_string());
        assert!(q.is_empty());
    }
}
