use ratewarden_store::{AtomicCounter, StoreResult};

use crate::{AlgorithmOutcome, WindowLimit};

/// One sliding window step: exact count over the trailing window.
///
/// A request is admitted when fewer than `limit` requests were admitted in
/// the last `window_ms`. Denied requests are not recorded.
pub async fn check(
    store: &dyn AtomicCounter,
    key: &str,
    limit: WindowLimit,
    now_ms: u64,
) -> StoreResult<AlgorithmOutcome> {
    let step = store
        .sliding_window_step(key, limit.limit, limit.window_ms, now_ms)
        .await?;

    // The quota frees up when the oldest surviving entry ages out.
    let reset_after_ms = step
        .oldest_ms
        .map(|oldest| (oldest + limit.window_ms).saturating_sub(now_ms))
        .unwrap_or(limit.window_ms);

    Ok(AlgorithmOutcome {
        allowed: step.allowed,
        metric: step.count,
        limit: limit.limit,
        remaining: limit.limit.saturating_sub(step.count),
        reset_after_ms,
        retry_after_ms: (!step.allowed).then_some(reset_after_ms.max(1)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratewarden_common::TimeWindow;
    use ratewarden_store::MemoryCounter;

    #[tokio::test]
    async fn allows_up_to_limit() {
        let store = MemoryCounter::new();
        let limit = WindowLimit::new(10, TimeWindow::Second);

        for i in 0..10 {
            let outcome = check(&store, "sw", limit, 0).await.unwrap();
            assert!(outcome.allowed, "request {} should be allowed", i);
            assert_eq!(outcome.remaining, 9 - i);
        }

        assert!(!check(&store, "sw", limit, 0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn exact_over_any_span() {
        // N = 4 over W = 10s, requests spread unevenly.
        let store = MemoryCounter::new();
        let limit = WindowLimit::new(4, TimeWindow::Second);
        let limit = WindowLimit {
            window_ms: 10_000,
            ..limit
        };

        for at in [0, 1_000, 7_000, 9_999] {
            assert!(check(&store, "sw", limit, at).await.unwrap().allowed);
        }
        // Still inside the span that began at 0.
        let denied = check(&store, "sw", limit, 9_999).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, Some(1));

        // At 10_000 only the request from t=0 has aged out.
        assert!(check(&store, "sw", limit, 10_000).await.unwrap().allowed);
        assert!(!check(&store, "sw", limit, 10_500).await.unwrap().allowed);

        // At 11_000 the request from t=1000 leaves too.
        assert!(check(&store, "sw", limit, 11_000).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn no_boundary_burst() {
        let store = MemoryCounter::new();
        let limit = WindowLimit::new(5, TimeWindow::Second);

        for _ in 0..5 {
            assert!(check(&store, "sw", limit, 900).await.unwrap().allowed);
        }
        // Unlike a fixed window, crossing the second boundary frees nothing.
        assert!(!check(&store, "sw", limit, 1_100).await.unwrap().allowed);
        assert!(check(&store, "sw", limit, 1_900).await.unwrap().allowed);
    }
}
