use ratewarden_store::{AtomicCounter, BucketParams, StoreResult};

use crate::{duration_for, AlgorithmOutcome, WindowLimit};

/// Capacity used when a rule sets no burst size: twice the window's limit.
pub fn default_capacity(limit: &WindowLimit) -> u64 {
    limit.burst.unwrap_or(limit.limit.saturating_mul(2))
}

/// One token bucket step.
///
/// The bucket holds up to `burst` tokens (twice the limit when unset) and
/// refills at `limit` tokens per window. A request takes one token.
pub async fn check(
    store: &dyn AtomicCounter,
    key: &str,
    limit: WindowLimit,
    now_ms: u64,
) -> StoreResult<AlgorithmOutcome> {
    let capacity = default_capacity(&limit);
    let params = BucketParams {
        capacity: capacity as f64,
        refill: limit.limit as f64,
        window_ms: limit.window_ms,
        cost: 1.0,
    };

    let step = store.token_bucket_step(key, params, now_ms).await?;
    let tokens = step.level.max(0.0);
    let remaining = tokens.floor() as u64;

    let retry_after_ms = if step.allowed {
        None
    } else {
        Some(duration_for(params.cost - tokens, limit.limit, limit.window_ms).max(1))
    };

    Ok(AlgorithmOutcome {
        allowed: step.allowed,
        metric: remaining,
        limit: capacity,
        remaining,
        reset_after_ms: duration_for(params.capacity - tokens, limit.limit, limit.window_ms),
        retry_after_ms,
    })
}
