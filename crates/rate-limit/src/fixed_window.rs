use ratewarden_store::{AtomicCounter, StoreResult};

use crate::{AlgorithmOutcome, WindowLimit};

/// One fixed window step.
///
/// Requests are counted per discrete window `floor(now / window)`. Every
/// request increments the counter, and it is admitted while the count stays
/// within `limit`.
///
/// Two bursts on either side of a window boundary can together admit up to
/// `2 * limit` requests in a short span. This is the standard fixed-window
/// trade-off and is accepted behaviour.
pub async fn check(
    store: &dyn AtomicCounter,
    key: &str,
    limit: WindowLimit,
    now_ms: u64,
) -> StoreResult<AlgorithmOutcome> {
    let step = store
        .fixed_window_step(key, limit.limit, limit.window_ms, now_ms)
        .await?;

    let window_end = (now_ms / limit.window_ms + 1) * limit.window_ms;
    let reset_after_ms = window_end - now_ms;

    Ok(AlgorithmOutcome {
        allowed: step.allowed,
        metric: step.count,
        limit: limit.limit,
        remaining: limit.limit.saturating_sub(step.count),
        reset_after_ms,
        retry_after_ms: (!step.allowed).then_some(reset_after_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratewarden_common::TimeWindow;
    use ratewarden_store::MemoryCounter;

    #[tokio::test]
    async fn counts_within_window() {
        let store = MemoryCounter::new();
        let limit = WindowLimit::new(3, TimeWindow::Minute);

        for _ in 0..3 {
            assert!(check(&store, "fw", limit, 61_000).await.unwrap().allowed);
        }
        let denied = check(&store, "fw", limit, 90_000).await.unwrap();
        assert!(!denied.allowed);
        // Window [60s, 120s) resets at 120s.
        assert_eq!(denied.retry_after_ms, Some(30_000));
    }

    #[tokio::test]
    async fn boundary_admits_twice_the_limit() {
        // Expected fixed-window behaviour: N at the end of one window plus N
        // at the start of the next all succeed.
        let store = MemoryCounter::new();
        let limit = WindowLimit::new(5, TimeWindow::Second);

        for _ in 0..5 {
            assert!(check(&store, "fw", limit, 999).await.unwrap().allowed);
        }
        for _ in 0..5 {
            assert!(check(&store, "fw", limit, 1_000).await.unwrap().allowed);
        }
        assert!(!check(&store, "fw", limit, 1_001).await.unwrap().allowed);
    }
}
