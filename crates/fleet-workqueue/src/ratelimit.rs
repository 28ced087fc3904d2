//! Rate limiters deciding how long a failed item waits before it is retried.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use fleet_core::RateLimitConfig;
use tokio::time::Instant;

/// Decides the delay before an item is re-added.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next retry of `item`. Records one failure.
    fn when(&self, item: &K) -> Duration;
    /// Stop tracking `item` (it succeeded).
    fn forget(&self, item: &K);
    /// Failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &K) -> u32;
}

// ── Per-item exponential ──────────────────────────────────────────

/// `base * 2^failures`, capped at `max`.
pub struct ItemExponentialRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ItemExponentialRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ItemExponentialRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        let delay = self.base.as_secs_f64() * 2f64.powi(exp.min(62) as i32);
        if !delay.is_finite() || delay >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(delay)
    }

    fn forget(&self, item: &K) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(item)
            .copied()
            .unwrap_or(0)
    }
}

// ── Token bucket ──────────────────────────────────────────────────

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every item. Each call reserves one token;
/// once the bucket is empty the reservation is paid back at `qps`.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

// ── Combinator ────────────────────────────────────────────────────

/// Waits as long as the slowest of its limiters.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-item exponential backoff combined with the shared bucket. Non-positive
/// settings fall back to the defaults.
pub fn default_controller_rate_limiter<K>(config: &RateLimitConfig) -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    let cfg = config.effective();
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialRateLimiter::new(cfg.base_delay(), cfg.max_delay())),
        Box::new(BucketRateLimiter::new(cfg.qps, cfg.bucket_size)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_cap() {
        let rl = ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_millis(30));
        assert_eq!(rl.when(&"a"), Duration::from_millis(5));
        assert_eq!(rl.when(&"a"), Duration::from_millis(10));
        assert_eq!(rl.when(&"a"), Duration::from_millis(20));
        assert_eq!(rl.when(&"a"), Duration::from_millis(30));
        assert_eq!(rl.when(&"a"), Duration::from_millis(30));
        assert_eq!(rl.num_requeues(&"a"), 5);

        // Other items are independent.
        assert_eq!(rl.when(&"b"), Duration::from_millis(5));
    }

    #[test]
    fn exponential_forget_resets() {
        let rl = ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_secs(60));
        rl.when(&"a");
        rl.when(&"a");
        rl.forget(&"a");
        assert_eq!(rl.num_requeues(&"a"), 0);
        assert_eq!(rl.when(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn exponential_survives_many_failures() {
        let rl = ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_secs(60));
        for _ in 0..200 {
            rl.when(&"a");
        }
        assert_eq!(rl.when(&"a"), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn bucket_allows_burst_then_delays() {
        let rl = BucketRateLimiter::new(10.0, 2);
        assert_eq!(RateLimiter::<&str>::when(&rl, &"a"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&rl, &"b"), Duration::ZERO);
        let third = RateLimiter::<&str>::when(&rl, &"c");
        assert!(third > Duration::from_millis(50), "got {third:?}");
        assert!(third <= Duration::from_millis(100), "got {third:?}");
    }

    #[tokio::test]
    async fn max_of_takes_slowest() {
        let rl: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialRateLimiter::new(
                Duration::from_millis(5),
                Duration::from_secs(1),
            )),
            Box::new(BucketRateLimiter::new(1.0, 1)),
        ]);
        assert_eq!(rl.when(&"a"), Duration::from_millis(5));
        // Bucket now empty: one second until the next token.
        assert!(rl.when(&"a") > Duration::from_millis(900));
        assert_eq!(rl.num_requeues(&"a"), 2);
        rl.forget(&"a");
        assert_eq!(rl.num_requeues(&"a"), 0);
    }

    #[tokio::test]
    async fn default_limiter_uses_config() {
        let rl = default_controller_rate_limiter::<String>(&RateLimitConfig::default());
        assert_eq!(rl.when(&"x".to_string()), Duration::from_millis(5));
    }
}
