use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{AtomicCounter, BucketParams, BucketStep, StoreError, StoreResult, WindowStep};

/// Bounds every call to the wrapped store.
///
/// The request path must never wait on a sick store longer than a few tens
/// of milliseconds; a call that overruns becomes [`StoreError::Timeout`] and
/// the engine's failure policy takes over.
pub struct TimeoutCounter {
    inner: Arc<dyn AtomicCounter>,
    timeout: Duration,
}

impl TimeoutCounter {
    pub fn new(inner: Arc<dyn AtomicCounter>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = StoreResult<T>> + Send,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(op, timeout_ms = self.timeout.as_millis() as u64, "counter store call timed out");
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl AtomicCounter for TimeoutCounter {
    async fn token_bucket_step(
        &self,
        key: &str,
        params: BucketParams,
        now_ms: u64,
    ) -> StoreResult<BucketStep> {
        self.bounded("token_bucket_step", self.inner.token_bucket_step(key, params, now_ms))
            .await
    }

    async fn leaky_bucket_step(
        &self,
        key: &str,
        params: BucketParams,
        now_ms: u64,
    ) -> StoreResult<BucketStep> {
        self.bounded("leaky_bucket_step", self.inner.leaky_bucket_step(key, params, now_ms))
            .await
    }

    async fn sliding_window_step(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> StoreResult<WindowStep> {
        self.bounded(
            "sliding_window_step",
            self.inner.sliding_window_step(key, limit, window_ms, now_ms),
        )
        .await
    }

    async fn fixed_window_step(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> StoreResult<WindowStep> {
        self.bounded(
            "fixed_window_step",
            self.inner.fixed_window_step(key, limit, window_ms, now_ms),
        )
        .await
    }

    async fn increment(&self, key: &str, ttl_ms: Option<u64>, now_ms: u64) -> StoreResult<u64> {
        self.bounded("increment", self.inner.increment(key, ttl_ms, now_ms))
            .await
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) -> StoreResult<bool> {
        self.bounded(
            "insert_if_absent",
            self.inner.insert_if_absent(key, value, ttl_ms, now_ms),
        )
        .await
    }

    async fn add_member(
        &self,
        key: &str,
        member: &str,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) -> StoreResult<u64> {
        self.bounded("add_member", self.inner.add_member(key, member, ttl_ms, now_ms))
            .await
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) -> StoreResult<()> {
        self.bounded("set", self.inner.set(key, value, ttl_ms, now_ms))
            .await
    }

    async fn get(&self, key: &str, now_ms: u64) -> StoreResult<Option<String>> {
        self.bounded("get", self.inner.get(key, now_ms)).await
    }

    async fn cardinality(&self, key: &str, now_ms: u64) -> StoreResult<u64> {
        self.bounded("cardinality", self.inner.cardinality(key, now_ms))
            .await
    }

    async fn ttl_ms(&self, key: &str, now_ms: u64) -> StoreResult<Option<u64>> {
        self.bounded("ttl_ms", self.inner.ttl_ms(key, now_ms)).await
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        self.bounded("remove", self.inner.remove(key)).await
    }

    async fn keys_with_prefix(&self, prefix: &str, now_ms: u64) -> StoreResult<Vec<String>> {
        self.bounded("keys_with_prefix", self.inner.keys_with_prefix(prefix, now_ms))
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.bounded("ping", self.inner.ping()).await
    }
}
