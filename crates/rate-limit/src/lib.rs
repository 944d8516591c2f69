//! Rate-limiting algorithms for ratewarden.
//!
//! Four interchangeable algorithms sit behind the [`RateLimiter`] facade:
//!
//! - **Token bucket** -- smooth, burst-tolerant limiting. A bucket refills
//!   continuously and each request takes one token.
//!
//! - **Sliding window** -- exact count of requests over the trailing window,
//!   no boundary artifacts.
//!
//! - **Fixed window** -- one counter per discrete window. Cheap, with the
//!   usual trade-off that bursts on either side of a boundary can together
//!   admit up to twice the limit in a short span. That behaviour is accepted.
//!
//! - **Leaky bucket** -- a queue that drains at a constant rate; requests
//!   that would overflow it are refused, never delayed.
//!
//! Each algorithm is a stateless function of (key, limit, now) that performs
//! exactly one atomic step against an [`AtomicCounter`]. All state lives in
//! the store, so every gateway instance sharing a store enforces the same
//! limit.

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_window;
pub mod token_bucket;

use std::sync::Arc;

use ratewarden_common::{RateLimitAlgorithm, TimeWindow};
use ratewarden_store::{AtomicCounter, StoreResult};

/// The limit applied to one window of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    /// Requests admitted per window.
    pub limit: u64,
    pub window_ms: u64,
    /// Overrides the bucket capacity for the bucket algorithms.
    pub burst: Option<u64>,
}

impl WindowLimit {
    pub fn new(limit: u64, window: TimeWindow) -> Self {
        Self {
            limit,
            window_ms: window.millis(),
            burst: None,
        }
    }

    pub fn with_burst(mut self, burst: Option<u64>) -> Self {
        self.burst = burst;
        self
    }
}

/// Result of one algorithm step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmOutcome {
    pub allowed: bool,
    /// Algorithm-specific reading after the step: tokens left, requests in
    /// the window, or queued volume.
    pub metric: u64,
    /// The quota the caller is measured against.
    pub limit: u64,
    pub remaining: u64,
    /// Until the quota is fully restored.
    pub reset_after_ms: u64,
    /// Until a denied caller could next be admitted.
    pub retry_after_ms: Option<u64>,
}

/// A unified rate limiter that delegates to one of the supported algorithms.
///
/// The limiter holds no counter state of its own and is cheaply cloneable.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn AtomicCounter>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn AtomicCounter>) -> Self {
        Self { store }
    }

    /// Check whether a request counted under `key` is allowed.
    pub async fn check(
        &self,
        algorithm: RateLimitAlgorithm,
        key: &str,
        limit: WindowLimit,
        now_ms: u64,
    ) -> StoreResult<AlgorithmOutcome> {
        let store = self.store.as_ref();
        let outcome = match algorithm {
            RateLimitAlgorithm::TokenBucket => token_bucket::check(store, key, limit, now_ms).await,
            RateLimitAlgorithm::SlidingWindow => {
                sliding_window::check(store, key, limit, now_ms).await
            }
            RateLimitAlgorithm::FixedWindow => fixed_window::check(store, key, limit, now_ms).await,
            RateLimitAlgorithm::LeakyBucket => leaky_bucket::check(store, key, limit, now_ms).await,
        }?;

        tracing::trace!(
            %algorithm,
            key,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            "rate limit step"
        );

        Ok(outcome)
    }

    pub fn store(&self) -> &Arc<dyn AtomicCounter> {
        &self.store
    }
}

/// `amount` units at `limit` per `window_ms`, in whole milliseconds.
pub(crate) fn duration_for(amount: f64, limit: u64, window_ms: u64) -> u64 {
    if amount <= 0.0 {
        return 0;
    }
    (amount * window_ms as f64 / limit as f64).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratewarden_store::MemoryCounter;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryCounter::new()))
    }

    #[tokio::test]
    async fn every_algorithm_through_facade() {
        let limiter = limiter();
        let limit = WindowLimit::new(3, TimeWindow::Second).with_burst(Some(3));

        for algorithm in [
            RateLimitAlgorithm::TokenBucket,
            RateLimitAlgorithm::SlidingWindow,
            RateLimitAlgorithm::FixedWindow,
            RateLimitAlgorithm::LeakyBucket,
        ] {
            let key = format!("facade:{}", algorithm);
            for i in 0..3 {
                let outcome = limiter.check(algorithm, &key, limit, 5_000).await.unwrap();
                assert!(outcome.allowed, "{} request {} should pass", algorithm, i);
            }
            let outcome = limiter.check(algorithm, &key, limit, 5_000).await.unwrap();
            assert!(!outcome.allowed, "{} should deny the 4th request", algorithm);
            assert_eq!(outcome.remaining, 0);
            assert!(outcome.retry_after_ms.is_some());
        }
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = limiter();
        let limit = WindowLimit::new(1, TimeWindow::Minute);

        let a = limiter
            .check(RateLimitAlgorithm::SlidingWindow, "a", limit, 0)
            .await
            .unwrap();
        let b = limiter
            .check(RateLimitAlgorithm::SlidingWindow, "b", limit, 0)
            .await
            .unwrap();
        assert!(a.allowed && b.allowed);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let limiter = limiter();
        let limiter2 = limiter.clone();
        let limit = WindowLimit::new(2, TimeWindow::Second).with_burst(Some(2));

        assert!(limiter.check(RateLimitAlgorithm::TokenBucket, "shared", limit, 0).await.unwrap().allowed);
        assert!(limiter2.check(RateLimitAlgorithm::TokenBucket, "shared", limit, 0).await.unwrap().allowed);

        // Both clones consumed from the same bucket.
        assert!(!limiter.check(RateLimitAlgorithm::TokenBucket, "shared", limit, 0).await.unwrap().allowed);
    }

    #[test]
    fn duration_rounds_up() {
        assert_eq!(duration_for(1.0, 10, 1_000), 100);
        assert_eq!(duration_for(0.5, 3, 1_000), 167);
        assert_eq!(duration_for(0.0, 3, 1_000), 0);
    }
}
