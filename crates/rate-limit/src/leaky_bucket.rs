use ratewarden_store::{AtomicCounter, BucketParams, StoreResult};

use crate::{duration_for, AlgorithmOutcome, WindowLimit};

/// One leaky bucket step.
///
/// The bucket drains at `limit` units per window and holds `burst` units
/// (the limit itself when unset). A request adds one unit if it fits and is
/// refused otherwise; admitted requests are never delayed.
pub async fn check(
    store: &dyn AtomicCounter,
    key: &str,
    limit: WindowLimit,
    now_ms: u64,
) -> StoreResult<AlgorithmOutcome> {
    let capacity = limit.burst.unwrap_or(limit.limit);
    let params = BucketParams {
        capacity: capacity as f64,
        refill: limit.limit as f64,
        window_ms: limit.window_ms,
        cost: 1.0,
    };

    let step = store.leaky_bucket_step(key, params, now_ms).await?;
    let volume = step.level.max(0.0);
    let remaining = (params.capacity - volume).max(0.0).floor() as u64;

    let retry_after_ms = if step.allowed {
        None
    } else {
        let overflow = volume + params.cost - params.capacity;
        Some(duration_for(overflow, limit.limit, limit.window_ms).max(1))
    };

    Ok(AlgorithmOutcome {
        allowed: step.allowed,
        metric: volume.ceil() as u64,
        limit: capacity,
        remaining,
        reset_after_ms: duration_for(volume, limit.limit, limit.window_ms),
        retry_after_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratewarden_common::TimeWindow;
    use ratewarden_store::MemoryCounter;

    #[tokio::test]
    async fn saturates_then_waits_for_a_full_unit() {
        // Capacity 4, leaking 2 units per second.
        let store = MemoryCounter::new();
        let limit = WindowLimit::new(2, TimeWindow::Second).with_burst(Some(4));

        for _ in 0..4 {
            assert!(check(&store, "lb", limit, 0).await.unwrap().allowed);
        }

        let full = check(&store, "lb", limit, 0).await.unwrap();
        assert!(!full.allowed);
        assert_eq!(full.metric, 4);
        assert_eq!(full.retry_after_ms, Some(500));

        // A quarter second leaks half a unit: still no room.
        assert!(!check(&store, "lb", limit, 250).await.unwrap().allowed);
        // Half a second leaks one unit.
        assert!(check(&store, "lb", limit, 500).await.unwrap().allowed);
        assert!(!check(&store, "lb", limit, 500).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn drains_to_empty() {
        let store = MemoryCounter::new();
        let limit = WindowLimit::new(10, TimeWindow::Second);

        for _ in 0..10 {
            check(&store, "lb", limit, 0).await.unwrap();
        }
        let outcome = check(&store, "lb", limit, 5_000).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.metric, 1);
        assert_eq!(outcome.remaining, 9);
    }
}
