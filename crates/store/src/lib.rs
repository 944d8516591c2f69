//! Client side of the shared counter store.
//!
//! Every rate-limit decision reads and rewrites some counter state. When many
//! gateway instances enforce the same limits, that state lives in a shared
//! store and each read-check-write must happen inside the store in a single
//! round trip; otherwise two concurrent requests can both see "under limit".
//!
//! [`AtomicCounter`] captures exactly the operations the engine needs, one
//! method per atomic step:
//!
//! - [`MemoryCounter`] keeps state in a [`DashMap`](dashmap::DashMap) and
//!   performs each step while holding the key's shard lock. It is the
//!   single-instance backend and the one tests run against.
//! - `RedisCounter` (feature `redis`) runs each step as a Lua script, so the
//!   same guarantee holds across processes and machines.
//! - [`TimeoutCounter`] wraps either and bounds every call, turning a slow
//!   store into [`StoreError::Timeout`] instead of a stalled request.
//!
//! All timestamps are epoch milliseconds supplied by the caller.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_backend;
pub mod timeout;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryCounter;
#[cfg(feature = "redis")]
pub use redis_backend::RedisCounter;
pub use timeout::TimeoutCounter;

/// Extra lifetime given to algorithm state beyond the point where it would
/// be indistinguishable from fresh state.
pub const EXPIRY_SLACK_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected value at key {key}: {message}")]
    Corrupt { key: String, message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Parameters for a bucket-shaped algorithm (token or leaky bucket).
///
/// `refill` units flow in (token bucket) or drain out (leaky bucket) every
/// `window_ms` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    pub capacity: f64,
    pub refill: f64,
    pub window_ms: u64,
    pub cost: f64,
}

impl BucketParams {
    /// Units added or drained over `elapsed_ms`.
    ///
    /// Multiplies before dividing so whole-unit intervals come out exact.
    pub fn flow(&self, elapsed_ms: u64) -> f64 {
        elapsed_ms as f64 * self.refill / self.window_ms as f64
    }

    /// How long state must live before an empty/full bucket is the same as
    /// no bucket at all.
    pub fn ttl_ms(&self) -> u64 {
        let span = self.capacity * self.window_ms as f64 / self.refill;
        (span.ceil() as u64).saturating_add(EXPIRY_SLACK_MS)
    }
}

/// Outcome of one bucket step. `level` is the token count (token bucket) or
/// the queued volume (leaky bucket) after the step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStep {
    pub allowed: bool,
    pub level: f64,
}

/// Outcome of one window step. `count` is the number of requests recorded in
/// the window after the step; `oldest_ms` is the earliest surviving entry of
/// a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStep {
    pub allowed: bool,
    pub count: u64,
    pub oldest_ms: Option<u64>,
}

/// Atomic operations against the shared counter store.
///
/// Each method is one round trip and performs its read-modify-write inside
/// the store. Keys are plain strings; backends may namespace them.
#[async_trait]
pub trait AtomicCounter: Send + Sync {
    /// Refill by elapsed time, capped at capacity, then take `cost` tokens
    /// if available.
    async fn token_bucket_step(
        &self,
        key: &str,
        params: BucketParams,
        now_ms: u64,
    ) -> StoreResult<BucketStep>;

    /// Drain by elapsed time, floored at zero, then add `cost` if it fits.
    async fn leaky_bucket_step(
        &self,
        key: &str,
        params: BucketParams,
        now_ms: u64,
    ) -> StoreResult<BucketStep>;

    /// Drop timestamps older than the window, then record `now_ms` if fewer
    /// than `limit` remain.
    async fn sliding_window_step(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> StoreResult<WindowStep>;

    /// Increment the counter of the window containing `now_ms`.
    async fn fixed_window_step(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> StoreResult<WindowStep>;

    /// Increment an integer. The expiry is set only when the key is created.
    async fn increment(&self, key: &str, ttl_ms: Option<u64>, now_ms: u64) -> StoreResult<u64>;

    /// Set a value unless the key exists. Returns whether it was written.
    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) -> StoreResult<bool>;

    /// Add a member to a set and return the set's size. The expiry is set
    /// only when the set is created.
    async fn add_member(
        &self,
        key: &str,
        member: &str,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) -> StoreResult<u64>;

    async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>, now_ms: u64)
        -> StoreResult<()>;

    async fn get(&self, key: &str, now_ms: u64) -> StoreResult<Option<String>>;

    /// Size of a set, zero if absent.
    async fn cardinality(&self, key: &str, now_ms: u64) -> StoreResult<u64>;

    /// Remaining lifetime. `None` if the key is absent or never expires.
    async fn ttl_ms(&self, key: &str, now_ms: u64) -> StoreResult<Option<u64>>;

    /// Returns whether the key existed.
    async fn remove(&self, key: &str) -> StoreResult<bool>;

    async fn keys_with_prefix(&self, prefix: &str, now_ms: u64) -> StoreResult<Vec<String>>;

    async fn ping(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_is_exact_for_whole_intervals() {
        let params = BucketParams {
            capacity: 20.0,
            refill: 10.0,
            window_ms: 1_000,
            cost: 1.0,
        };
        assert_eq!(params.flow(100), 1.0);
        assert_eq!(params.flow(1_000), 10.0);
        assert_eq!(params.ttl_ms(), 2_000 + EXPIRY_SLACK_MS);
    }
}
