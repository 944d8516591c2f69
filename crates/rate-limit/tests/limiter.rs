use std::sync::Arc;

use ratewarden_common::{RateLimitAlgorithm, TimeWindow};
use ratewarden_rate_limit::{RateLimiter, WindowLimit};
use ratewarden_store::{AtomicCounter, MemoryCounter};

const NOW: u64 = 1_700_000_000_000;

fn limiter() -> RateLimiter {
    RateLimiter::new(Arc::new(MemoryCounter::new()))
}

#[tokio::test]
async fn test_token_bucket_basic() {
    let limiter = limiter();
    let limit = WindowLimit::new(10, TimeWindow::Second).with_burst(Some(5));

    for _ in 0..5 {
        let outcome = limiter
            .check(RateLimitAlgorithm::TokenBucket, "client", limit, NOW)
            .await
            .unwrap();
        assert!(outcome.allowed);
    }

    let denied = limiter
        .check(RateLimitAlgorithm::TokenBucket, "client", limit, NOW)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
}

#[tokio::test]
async fn test_keys_are_independent() {
    let limiter = limiter();
    let limit = WindowLimit::new(2, TimeWindow::Minute);

    for key in ["client-a", "client-b"] {
        for _ in 0..2 {
            assert!(limiter
                .check(RateLimitAlgorithm::FixedWindow, key, limit, NOW)
                .await
                .unwrap()
                .allowed);
        }
        assert!(!limiter
            .check(RateLimitAlgorithm::FixedWindow, key, limit, NOW)
            .await
            .unwrap()
            .allowed);
    }
}

#[tokio::test]
async fn test_instances_sharing_a_store_share_the_limit() {
    let store: Arc<dyn AtomicCounter> = Arc::new(MemoryCounter::new());
    let first = RateLimiter::new(store.clone());
    let second = RateLimiter::new(store);
    let limit = WindowLimit::new(4, TimeWindow::Minute);

    let mut admitted = 0;
    for i in 0..8 {
        let limiter = if i % 2 == 0 { &first } else { &second };
        if limiter
            .check(RateLimitAlgorithm::SlidingWindow, "shared", limit, NOW + i)
            .await
            .unwrap()
            .allowed
        {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 4);
}

#[tokio::test]
async fn test_sliding_window_recovers_after_window() {
    let limiter = limiter();
    let limit = WindowLimit::new(3, TimeWindow::Minute);

    for _ in 0..3 {
        assert!(limiter
            .check(RateLimitAlgorithm::SlidingWindow, "sw", limit, NOW)
            .await
            .unwrap()
            .allowed);
    }
    let denied = limiter
        .check(RateLimitAlgorithm::SlidingWindow, "sw", limit, NOW + 1_000)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after_ms.unwrap() <= 60_000);

    let later = limiter
        .check(RateLimitAlgorithm::SlidingWindow, "sw", limit, NOW + 60_001)
        .await
        .unwrap();
    assert!(later.allowed);
}

#[tokio::test]
async fn test_leaky_bucket_drains_at_constant_rate() {
    let limiter = limiter();
    let limit = WindowLimit::new(2, TimeWindow::Second);

    for _ in 0..2 {
        assert!(limiter
            .check(RateLimitAlgorithm::LeakyBucket, "lb", limit, NOW)
            .await
            .unwrap()
            .allowed);
    }
    assert!(!limiter
        .check(RateLimitAlgorithm::LeakyBucket, "lb", limit, NOW)
        .await
        .unwrap()
        .allowed);

    // One unit leaks every 500ms.
    assert!(limiter
        .check(RateLimitAlgorithm::LeakyBucket, "lb", limit, NOW + 500)
        .await
        .unwrap()
        .allowed);
}

/// Tasks standing in for separate gateway instances hammer one key at the
/// same instant; every algorithm must admit exactly its limit.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checks_never_exceed_the_limit() {
    const TASKS: u64 = 8;
    const CHECKS_PER_TASK: u64 = 25;
    const LIMIT: u64 = 50;

    for algorithm in [
        RateLimitAlgorithm::TokenBucket,
        RateLimitAlgorithm::SlidingWindow,
        RateLimitAlgorithm::FixedWindow,
        RateLimitAlgorithm::LeakyBucket,
    ] {
        let store: Arc<dyn AtomicCounter> = Arc::new(MemoryCounter::new());
        let limit = WindowLimit::new(LIMIT, TimeWindow::Minute).with_burst(Some(LIMIT));

        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let limiter = RateLimiter::new(store.clone());
                tokio::spawn(async move {
                    let mut admitted = 0u64;
                    for _ in 0..CHECKS_PER_TASK {
                        let outcome = limiter
                            .check(algorithm, "contended", limit, NOW)
                            .await
                            .unwrap();
                        if outcome.allowed {
                            admitted += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            admitted += handle.await.unwrap();
        }
        assert_eq!(admitted, LIMIT, "{} admitted {} of {}", algorithm, admitted, TASKS * CHECKS_PER_TASK);
    }
}
