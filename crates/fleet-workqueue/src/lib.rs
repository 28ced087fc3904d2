//! fleet-workqueue — rate-limited work queue for fleet controllers.
//!
//! # Components
//!
//! - **RateLimiter**: per-item exponential backoff, a shared token bucket, and
//!   a max-of combinator.
//! - **WorkQueue**: deduplicating FIFO; an item is processed by at most one
//!   worker at a time and re-queued on `done` if it was added meanwhile.
//! - **run_workers**: bounded worker pool driving a `Reconciler`.

pub mod queue;
pub mod ratelimit;
pub mod worker;

pub use queue::WorkQueue;
pub use ratelimit::{
    BucketRateLimiter, ItemExponentialRateLimiter, MaxOfRateLimiter, RateLimiter,
    default_controller_rate_limiter,
};
pub use worker::{BoxFuture, Reconciler, Requeue, run_workers};
