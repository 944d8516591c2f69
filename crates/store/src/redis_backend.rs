use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::{
    AtomicCounter, BucketParams, BucketStep, StoreError, StoreResult, WindowStep, EXPIRY_SLACK_MS,
};

// Lua numbers come back from Redis truncated to integers, so fractional
// levels are returned as strings.
const TOKEN_BUCKET: &str = r#"
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local window_ms = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local now = tonumber(ARGV[5])
local ttl = tonumber(ARGV[6])

local state = redis.call('HMGET', KEYS[1], 'level', 'last')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end

local elapsed = math.max(0, now - last)
tokens = math.min(capacity, tokens + elapsed * refill / window_ms)

local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end

redis.call('HSET', KEYS[1], 'level', tostring(tokens), 'last', tostring(math.max(now, last)))
redis.call('PEXPIRE', KEYS[1], ttl)
return {allowed, tostring(tokens)}
"#;

const LEAKY_BUCKET: &str = r#"
local capacity = tonumber(ARGV[1])
local leak = tonumber(ARGV[2])
local window_ms = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local now = tonumber(ARGV[5])
local ttl = tonumber(ARGV[6])

local state = redis.call('HMGET', KEYS[1], 'level', 'last')
local volume = tonumber(state[1]) or 0
local last = tonumber(state[2]) or now

local elapsed = math.max(0, now - last)
volume = math.max(0, volume - elapsed * leak / window_ms)

local allowed = 0
if volume + cost <= capacity then
  volume = volume + cost
  allowed = 1
end

redis.call('HSET', KEYS[1], 'level', tostring(volume), 'last', tostring(math.max(now, last)))
redis.call('PEXPIRE', KEYS[1], ttl)
return {allowed, tostring(volume)}
"#;

const SLIDING_WINDOW: &str = r#"
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]
local ttl = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window_ms)
local count = redis.call('ZCARD', KEYS[1])

local allowed = 0
if count < limit then
  redis.call('ZADD', KEYS[1], now, member)
  count = count + 1
  allowed = 1
end
redis.call('PEXPIRE', KEYS[1], ttl)

local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local oldest_ts = -1
if oldest[2] then
  oldest_ts = tonumber(oldest[2])
end
return {allowed, count, oldest_ts}
"#;

const INCREMENT: &str = r#"
local value = redis.call('INCR', KEYS[1])
local ttl = tonumber(ARGV[1])
if value == 1 and ttl > 0 then
  redis.call('PEXPIRE', KEYS[1], ttl)
end
return value
"#;

const ADD_MEMBER: &str = r#"
redis.call('SADD', KEYS[1], ARGV[1])
local ttl = tonumber(ARGV[2])
if ttl > 0 and redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ttl)
end
return redis.call('SCARD', KEYS[1])
"#;

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Counter store backed by a shared Redis instance.
///
/// Every algorithm step is one `EVALSHA` of a Lua script, so the
/// read-check-write happens inside Redis and holds across any number of
/// gateway processes. Keys are namespaced with `prefix`.
pub struct RedisCounter {
    conn: ConnectionManager,
    prefix: String,
    token_bucket: Script,
    leaky_bucket: Script,
    sliding_window: Script,
    increment: Script,
    add_member: Script,
}

impl RedisCounter {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let prefix = prefix.into();
        tracing::info!(prefix = %prefix, "connected to redis counter store");

        Ok(Self {
            conn,
            prefix,
            token_bucket: Script::new(TOKEN_BUCKET),
            leaky_bucket: Script::new(LEAKY_BUCKET),
            sliding_window: Script::new(SLIDING_WINDOW),
            increment: Script::new(INCREMENT),
            add_member: Script::new(ADD_MEMBER),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn bucket_step(
        &self,
        script: &Script,
        key: &str,
        params: BucketParams,
        now_ms: u64,
    ) -> StoreResult<BucketStep> {
        let mut conn = self.conn.clone();
        let (allowed, level): (i64, String) = script
            .key(self.namespaced(key))
            .arg(params.capacity)
            .arg(params.refill)
            .arg(params.window_ms)
            .arg(params.cost)
            .arg(now_ms)
            .arg(params.ttl_ms())
            .invoke_async(&mut conn)
            .await?;

        let level = level.parse::<f64>().map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            message: format!("bucket level '{}': {}", level, e),
        })?;

        Ok(BucketStep {
            allowed: allowed == 1,
            level,
        })
    }
}

#[async_trait]
impl AtomicCounter for RedisCounter {
    async fn token_bucket_step(
        &self,
        key: &str,
        params: BucketParams,
        now_ms: u64,
    ) -> StoreResult<BucketStep> {
        self.bucket_step(&self.token_bucket, key, params, now_ms).await
    }

    async fn leaky_bucket_step(
        &self,
        key: &str,
        params: BucketParams,
        now_ms: u64,
    ) -> StoreResult<BucketStep> {
        self.bucket_step(&self.leaky_bucket, key, params, now_ms).await
    }

    async fn sliding_window_step(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> StoreResult<WindowStep> {
        let mut conn = self.conn.clone();
        // Members must be unique even when two requests share a millisecond.
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());
        let (allowed, count, oldest): (i64, u64, i64) = self
            .sliding_window
            .key(self.namespaced(key))
            .arg(limit)
            .arg(window_ms)
            .arg(now_ms)
            .arg(member)
            .arg(window_ms + EXPIRY_SLACK_MS)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowStep {
            allowed: allowed == 1,
            count,
            oldest_ms: u64::try_from(oldest).ok(),
        })
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

    async fn increment(&self, key: &str, ttl_ms: Option<u64>, _now_ms: u64) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let value: u64 = self
            .increment
            .key(self.namespaced(key))
            .arg(ttl_ms.unwrap_or(0))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_ms: Option<u64>,
        _now_ms: u64,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.namespaced(key)).arg(value).arg("NX");
        if let Some(ttl) = ttl_ms {
            cmd.arg("PX").arg(ttl);
        }
        let written: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(written.is_some())
    }

    async fn add_member(
        &self,
        key: &str,
        member: &str,
        ttl_ms: Option<u64>,
        _now_ms: u64,
    ) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let size: u64 = self
            .add_member
            .key(self.namespaced(key))
            .arg(member)
            .arg(ttl_ms.unwrap_or(0))
            .invoke_async(&mut conn)
            .await?;
        Ok(size)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_ms: Option<u64>,
        _now_ms: u64,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.namespaced(key)).arg(value);
        if let Some(ttl) = ttl_ms {
            cmd.arg("PX").arg(ttl);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str, _now_ms: u64) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn cardinality(&self, key: &str, _now_ms: u64) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let size: u64 = redis::cmd("SCARD")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await?;
        Ok(size)
    }

    async fn ttl_ms(&self, key: &str, _now_ms: u64) -> StoreResult<Option<u64>> {
        let mut conn = self.conn.clone();
        // -2: no such key, -1: no expiry.
        let ttl: i64 = redis::cmd("PTTL")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await?;
        Ok(u64::try_from(ttl).ok())
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str, _now_ms: u64) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.namespaced(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;

            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string)),
            );

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
