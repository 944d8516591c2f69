use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ratewarden_common::Clock;

use crate::{
    AtomicCounter, BucketParams, BucketStep, StoreError, StoreResult, WindowStep, EXPIRY_SLACK_MS,
};

/// The value held under one key.
enum Slot {
    Counter(u64),
    Text(String),
    Bucket { level: f64, last_ms: u64 },
    Log(VecDeque<u64>),
    Members(HashSet<String>),
}

impl Slot {
    fn kind(&self) -> &'static str {
        match self {
            Slot::Counter(_) => "counter",
            Slot::Text(_) => "text",
            Slot::Bucket { .. } => "bucket",
            Slot::Log(_) => "log",
            Slot::Members(_) => "set",
        }
    }
}

struct Stored {
    slot: Slot,
    expires_at_ms: Option<u64>,
}

impl Stored {
    fn fresh(slot: Slot) -> Self {
        Self {
            slot,
            expires_at_ms: None,
        }
    }

    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(true, |at| at > now_ms)
    }
}

fn wrong_kind(key: &str, expected: &str, found: &str) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        message: format!("expected {}, found {}", expected, found),
    }
}

/// In-process counter store.
///
/// Each step runs while holding the DashMap shard lock for its key, which
/// makes it atomic with respect to every other step on that key. Expired
/// entries are treated as absent and swept by [`cleanup`](Self::cleanup).
pub struct MemoryCounter {
    entries: DashMap<String, Stored>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of stored keys, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `step` on the live entry for `key`, creating it from `init` when
    /// absent or expired. `step` learns whether the entry was just created.
    fn with_entry<T>(
        &self,
        key: &str,
        now_ms: u64,
        init: impl FnOnce() -> Slot,
        step: impl FnOnce(&mut Stored, bool) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let (mut entry, created) = match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let mut entry = occupied.into_ref();
                if entry.is_live(now_ms) {
                    (entry, false)
                } else {
                    *entry = Stored::fresh(init());
                    (entry, true)
                }
            }
            Entry::Vacant(vacant) => (vacant.insert(Stored::fresh(init())), true),
        };

        step(entry.value_mut(), created)
    }

    /// Drop every expired entry.
    pub fn cleanup(&self, now_ms: u64) {
        self.entries.retain(|_key, stored| stored.is_live(now_ms));

        tracing::debug!(remaining = self.entries.len(), "memory counter cleanup complete");
    }

    /// Spawn a background thread that sweeps expired entries every 60 seconds
    /// for as long as the process runs.
    pub fn start_cleanup_task(self: &Arc<Self>, clock: Arc<dyn Clock>) -> std::io::Result<()> {
        let store = Arc::clone(self);

        std::thread::Builder::new()
            .name("counter-cleanup".into())
            .spawn(move || loop {
                std::thread::sleep(std::time::Duration::from_secs(60));
                store.cleanup(clock.now_ms());
                tracing::trace!("counter cleanup tick completed");
            })?;

        Ok(())
    }
}

impl Default for MemoryCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AtomicCounter for MemoryCounter {
    async fn token_bucket_step(
        &self,
        key: &str,
        params: BucketParams,
        now_ms: u64,
    ) -> StoreResult<BucketStep> {
        self.with_entry(
            key,
            now_ms,
            || Slot::Bucket {
                level: params.capacity,
                last_ms: now_ms,
            },
            |stored, _| {
                let kind = stored.slot.kind();
                let Slot::Bucket { level, last_ms } = &mut stored.slot else {
                    return Err(wrong_kind(key, "bucket", kind));
                };

                let elapsed = now_ms.saturating_sub(*last_ms);
                let mut tokens = (*level + params.flow(elapsed)).min(params.capacity);
                let allowed = tokens >= params.cost;
                if allowed {
                    tokens -= params.cost;
                }

                *level = tokens;
                *last_ms = (*last_ms).max(now_ms);
                stored.expires_at_ms = Some(now_ms.saturating_add(params.ttl_ms()));

                Ok(BucketStep {
                    allowed,
                    level: tokens,
                })
            },
        )
    }

    async fn leaky_bucket_step(
        &self,
        key: &str,
        params: BucketParams,
        now_ms: u64,
    ) -> StoreResult<BucketStep> {
        self.with_entry(
            key,
            now_ms,
            || Slot::Bucket {
                level: 0.0,
                last_ms: now_ms,
            },
            |stored, _| {
                let kind = stored.slot.kind();
                let Slot::Bucket { level, last_ms } = &mut stored.slot else {
                    return Err(wrong_kind(key, "bucket", kind));
                };

                let elapsed = now_ms.saturating_sub(*last_ms);
                let mut volume = (*level - params.flow(elapsed)).max(0.0);
                let allowed = volume + params.cost <= params.capacity;
                if allowed {
                    volume += params.cost;
                }

                *level = volume;
                *last_ms = (*last_ms).max(now_ms);
                stored.expires_at_ms = Some(now_ms.saturating_add(params.ttl_ms()));

                Ok(BucketStep {
                    allowed,
                    level: volume,
                })
            },
        )
    }

    async fn sliding_window_step(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> StoreResult<WindowStep> {
        self.with_entry(
            key,
            now_ms,
            || Slot::Log(VecDeque::new()),
            |stored, _| {
                let kind = stored.slot.kind();
                let Slot::Log(log) = &mut stored.slot else {
                    return Err(wrong_kind(key, "log", kind));
                };

                log.retain(|&ts| ts + window_ms > now_ms);

                let allowed = (log.len() as u64) < limit;
                if allowed {
                    log.push_back(now_ms);
                }

                let count = log.len() as u64;
                let oldest_ms = log.iter().min().copied();
                stored.expires_at_ms = Some(now_ms + window_ms + EXPIRY_SLACK_MS);

                Ok(WindowStep {
                    allowed,
                    count,
                    oldest_ms,
                })
            },
        )
    }

    async fn fixed_window_step(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> StoreResult<WindowStep> {
        let window_key = format!("{}:{}", key, now_ms / window_ms);
        let count = self
            .increment(&window_key, Some(window_ms + EXPIRY_SLACK_MS), now_ms)
            .await?;

        Ok(WindowStep {
            allowed: count <= limit,
            count,
            oldest_ms: None,
        })
    }

    async fn increment(&self, key: &str, ttl_ms: Option<u64>, now_ms: u64) -> StoreResult<u64> {
        self.with_entry(
            key,
            now_ms,
            || Slot::Counter(0),
            |stored, created| {
                let kind = stored.slot.kind();
                let Slot::Counter(value) = &mut stored.slot else {
                    return Err(wrong_kind(key, "counter", kind));
                };

                *value += 1;
                let value = *value;
                if created {
                    stored.expires_at_ms = ttl_ms.map(|ttl| now_ms.saturating_add(ttl));
                }
                Ok(value)
            },
        )
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) -> StoreResult<bool> {
        let fresh = || Stored {
            slot: Slot::Text(value.to_string()),
            expires_at_ms: ttl_ms.map(|ttl| now_ms.saturating_add(ttl)),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now_ms) {
                    Ok(false)
                } else {
                    occupied.insert(fresh());
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh());
                Ok(true)
            }
        }
    }

    async fn add_member(
        &self,
        key: &str,
        member: &str,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) -> StoreResult<u64> {
        self.with_entry(
            key,
            now_ms,
            || Slot::Members(HashSet::new()),
            |stored, created| {
                let kind = stored.slot.kind();
                let Slot::Members(members) = &mut stored.slot else {
                    return Err(wrong_kind(key, "set", kind));
                };

                members.insert(member.to_string());
                let size = members.len() as u64;
                if created {
                    stored.expires_at_ms = ttl_ms.map(|ttl| now_ms.saturating_add(ttl));
                }
                Ok(size)
            },
        )
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) -> StoreResult<()> {
        self.entries.insert(
            key.to_string(),
            Stored {
                slot: Slot::Text(value.to_string()),
                expires_at_ms: ttl_ms.map(|ttl| now_ms.saturating_add(ttl)),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str, now_ms: u64) -> StoreResult<Option<String>> {
        let Some(stored) = self.entries.get(key) else {
            return Ok(None);
        };
        if !stored.is_live(now_ms) {
            return Ok(None);
        }

        match &stored.slot {
            Slot::Text(text) => Ok(Some(text.clone())),
            Slot::Counter(value) => Ok(Some(value.to_string())),
            other => Err(wrong_kind(key, "text", other.kind())),
        }
    }

    async fn cardinality(&self, key: &str, now_ms: u64) -> StoreResult<u64> {
        let Some(stored) = self.entries.get(key) else {
            return Ok(0);
        };
        if !stored.is_live(now_ms) {
            return Ok(0);
        }

        match &stored.slot {
            Slot::Members(members) => Ok(members.len() as u64),
            other => Err(wrong_kind(key, "set", other.kind())),
        }
    }

    async fn ttl_ms(&self, key: &str, now_ms: u64) -> StoreResult<Option<u64>> {
        Ok(self
            .entries
            .get(key)
            .filter(|stored| stored.is_live(now_ms))
            .and_then(|stored| stored.expires_at_ms)
            .map(|at| at - now_ms))
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str, now_ms: u64) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now_ms))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(capacity: f64, refill: f64) -> BucketParams {
        BucketParams {
            capacity,
            refill,
            window_ms: 1_000,
            cost: 1.0,
        }
    }

    #[tokio::test]
    async fn token_bucket_starts_full_and_refills() {
        let store = MemoryCounter::new();
        let params = bucket(3.0, 10.0);

        for _ in 0..3 {
            assert!(store.token_bucket_step("tb", params, 0).await.unwrap().allowed);
        }
        let step = store.token_bucket_step("tb", params, 0).await.unwrap();
        assert!(!step.allowed);
        assert_eq!(step.level, 0.0);

        // 100ms at 10/s is exactly one token.
        let step = store.token_bucket_step("tb", params, 100).await.unwrap();
        assert!(step.allowed);
        assert!(!store.token_bucket_step("tb", params, 100).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn token_bucket_never_exceeds_capacity() {
        let store = MemoryCounter::new();
        let params = bucket(2.0, 10.0);

        store.token_bucket_step("tb", params, 0).await.unwrap();
        // Long idle period; refill caps at capacity (2), minus the one taken.
        let step = store.token_bucket_step("tb", params, 1_500).await.unwrap();
        assert!(step.allowed);
        assert_eq!(step.level, 1.0);
    }

    #[tokio::test]
    async fn leaky_bucket_fills_then_drains() {
        let store = MemoryCounter::new();
        let params = bucket(2.0, 1.0);

        assert!(store.leaky_bucket_step("lb", params, 0).await.unwrap().allowed);
        assert!(store.leaky_bucket_step("lb", params, 0).await.unwrap().allowed);
        let full = store.leaky_bucket_step("lb", params, 0).await.unwrap();
        assert!(!full.allowed);
        assert_eq!(full.level, 2.0);

        // Half a unit leaked is not enough room.
        assert!(!store.leaky_bucket_step("lb", params, 500).await.unwrap().allowed);
        assert!(store.leaky_bucket_step("lb", params, 1_000).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn sliding_window_tracks_oldest() {
        let store = MemoryCounter::new();

        let first = store.sliding_window_step("sw", 2, 1_000, 100).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.oldest_ms, Some(100));

        store.sliding_window_step("sw", 2, 1_000, 400).await.unwrap();
        let denied = store.sliding_window_step("sw", 2, 1_000, 900).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 2);

        // The entry at 100 leaves the window at exactly 1100.
        let step = store.sliding_window_step("sw", 2, 1_000, 1_100).await.unwrap();
        assert!(step.allowed);
        assert_eq!(step.oldest_ms, Some(400));
    }

    #[tokio::test]
    async fn fixed_window_counts_per_generation() {
        let store = MemoryCounter::new();

        assert_eq!(store.fixed_window_step("fw", 1, 1_000, 10).await.unwrap().count, 1);
        assert!(!store.fixed_window_step("fw", 1, 1_000, 999).await.unwrap().allowed);
        assert!(store.fixed_window_step("fw", 1, 1_000, 1_000).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn increment_sets_expiry_once() {
        let store = MemoryCounter::new();

        assert_eq!(store.increment("v", Some(1_000), 0).await.unwrap(), 1);
        assert_eq!(store.increment("v", Some(1_000), 900).await.unwrap(), 2);
        assert_eq!(store.ttl_ms("v", 900).await.unwrap(), Some(100));

        // Expired: starts over.
        assert_eq!(store.increment("v", Some(1_000), 1_000).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_if_absent_respects_expiry() {
        let store = MemoryCounter::new();

        assert!(store.insert_if_absent("seen", "1", Some(500), 0).await.unwrap());
        assert!(!store.insert_if_absent("seen", "1", Some(500), 100).await.unwrap());
        assert!(store.insert_if_absent("seen", "1", Some(500), 500).await.unwrap());
    }

    #[tokio::test]
    async fn members_are_distinct() {
        let store = MemoryCounter::new();

        assert_eq!(store.add_member("s", "/a", Some(60_000), 0).await.unwrap(), 1);
        assert_eq!(store.add_member("s", "/a", Some(60_000), 1).await.unwrap(), 1);
        assert_eq!(store.add_member("s", "/b", Some(60_000), 2).await.unwrap(), 2);
        assert_eq!(store.cardinality("s", 3).await.unwrap(), 2);
        assert_eq!(store.cardinality("missing", 3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn wrong_kind_is_reported() {
        let store = MemoryCounter::new();
        store.set("text", "hello", None, 0).await.unwrap();

        let err = store.increment("text", None, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn prefix_listing_skips_expired() {
        let store = MemoryCounter::new();
        store.set("block:1.1.1.1", "{}", Some(100), 0).await.unwrap();
        store.set("block:2.2.2.2", "{}", Some(1_000), 0).await.unwrap();
        store.set("other", "x", None, 0).await.unwrap();

        let mut keys = store.keys_with_prefix("block:", 500).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["block:2.2.2.2".to_string()]);

        store.cleanup(500);
        assert_eq!(store.len(), 2);
        assert!(store.remove("other").await.unwrap());
        assert!(!store.remove("other").await.unwrap());
    }
}
