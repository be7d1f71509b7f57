// =============================================================================
// State Store — Redis-backed KV abstraction, single source of truth
// =============================================================================
//
// Every component reads and writes through this type. One pool-backed
// connection manager is shared process-wide; pub/sub subscribers get their
// own dedicated connections. Writes go through a bounded retry ladder
// (3 retries at 2 s * 2^n); reads may fall back to the in-memory cache only
// when the caller explicitly allows a degraded result.
// =============================================================================

pub mod cache;
pub mod keys;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, FromRedisValue};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use cache::{CacheClass, MemoryCache};

/// Write retry ladder: attempts at 2 s, 4 s, 8 s after the initial failure.
const WRITE_RETRIES: u32 = 3;
const WRITE_BACKOFF_BASE_SECS: u64 = 2;

/// Shared handle to the state store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    client: redis::Client,
    conn: ConnectionManager,
    cache: Arc<MemoryCache>,
}

impl Store {
    /// Connect to the store. Called once at startup; the handle is then
    /// injected into every component.
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| EngineError::Config(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!("state store connected");
        Ok(Self {
            client,
            conn,
            cache: Arc::new(MemoryCache::new()),
        })
    }

    pub fn cache(&self) -> Arc<MemoryCache> {
        self.cache.clone()
    }

    /// Liveness probe used by the monitor health check.
    pub async fn ping(&self) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Retry plumbing
    // -------------------------------------------------------------------------

    /// Run a mutating command through the retry ladder.
    async fn write_cmd<T: FromRedisValue>(&self, cmd: redis::Cmd) -> EngineResult<T> {
        let mut attempt: u32 = 0;
        loop {
            let mut conn = self.conn.clone();
            let result: redis::RedisResult<T> = cmd.query_async(&mut conn).await;
            match result {
                Ok(v) => return Ok(v),
                Err(e) if attempt < WRITE_RETRIES => {
                    let delay = WRITE_BACKOFF_BASE_SECS * 2u64.pow(attempt);
                    warn!(error = %e, attempt, delay_secs = delay, "store write failed — retrying");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn read_cmd<T: FromRedisValue>(&self, cmd: redis::Cmd) -> EngineResult<T> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<T> = cmd.query_async(&mut conn).await;
        Ok(result?)
    }

    // -------------------------------------------------------------------------
    // Strings
    // -------------------------------------------------------------------------

    pub async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        self.read_cmd(redis::Cmd::get(key)).await
    }

    /// Read with cache-aside. When the store is unreachable and `allow_stale`
    /// is set, the last cached value (expired or not) is returned instead of
    /// the error.
    pub async fn get_cached(
        &self,
        key: &str,
        class: CacheClass,
        allow_stale: bool,
    ) -> EngineResult<Option<String>> {
        if let Some(hit) = self.cache.get(key) {
            return Ok(Some(hit));
        }
        match self.get(key).await {
            Ok(Some(value)) => {
                self.cache.put(key, &value, class);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) if allow_stale => {
                warn!(key, error = %e, "store read failed — serving stale cache entry");
                Ok(self.cache.get_stale(key))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        self.cache.invalidate(key);
        self.write_cmd(redis::Cmd::set(key, value)).await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> EngineResult<()> {
        self.cache.invalidate(key);
        self.write_cmd(redis::Cmd::set_ex(key, value, ttl_secs)).await
    }

    /// SET NX with TTL — the single-flight lock primitive.
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> EngineResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("EX").arg(ttl_secs);
        let reply: Option<String> = self.write_cmd(cmd).await?;
        Ok(reply.is_some())
    }

    pub async fn del(&self, key: &str) -> EngineResult<()> {
        self.cache.invalidate(key);
        let _: i64 = self.write_cmd(redis::Cmd::del(key)).await?;
        Ok(())
    }

    pub async fn expire(&self, key: &str, ttl_secs: i64) -> EngineResult<()> {
        let _: i64 = self.write_cmd(redis::Cmd::expire(key, ttl_secs)).await?;
        Ok(())
    }

    pub async fn ttl(&self, key: &str) -> EngineResult<i64> {
        self.read_cmd(redis::Cmd::ttl(key)).await
    }

    pub async fn exists(&self, key: &str) -> EngineResult<bool> {
        self.read_cmd(redis::Cmd::exists(key)).await
    }

    // -------------------------------------------------------------------------
    // Hashes
    // -------------------------------------------------------------------------

    pub async fn hget(&self, key: &str, field: &str) -> EngineResult<Option<String>> {
        self.read_cmd(redis::Cmd::hget(key, field)).await
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> EngineResult<()> {
        self.cache.invalidate(key);
        let _: i64 = self.write_cmd(redis::Cmd::hset(key, field, value)).await?;
        Ok(())
    }

    pub async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> EngineResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.cache.invalidate(key);
        let pairs: Vec<(&str, &str)> = fields
            .iter()
            .map(|(f, v)| (f.as_str(), v.as_str()))
            .collect();
        self.write_cmd(redis::Cmd::hset_multiple(key, &pairs)).await
    }

    pub async fn hgetall(&self, key: &str) -> EngineResult<HashMap<String, String>> {
        self.read_cmd(redis::Cmd::hgetall(key)).await
    }

    /// Hash read with the 60 s cache class (frequently-read hashes).
    pub async fn hgetall_cached(
        &self,
        key: &str,
        allow_stale: bool,
    ) -> EngineResult<HashMap<String, String>> {
        if let Some(hit) = self.cache.get(key) {
            if let Ok(map) = serde_json::from_str(&hit) {
                return Ok(map);
            }
        }
        match self.hgetall(key).await {
            Ok(map) => {
                if let Ok(encoded) = serde_json::to_string(&map) {
                    self.cache.put(key, &encoded, CacheClass::Hash);
                }
                Ok(map)
            }
            Err(e) if allow_stale => {
                warn!(key, error = %e, "hash read failed — serving stale cache entry");
                let stale = self
                    .cache
                    .get_stale(key)
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                    .unwrap_or_default();
                Ok(stale)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn hdel(&self, key: &str, fields: &[&str]) -> EngineResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.cache.invalidate(key);
        let _: i64 = self.write_cmd(redis::Cmd::hdel(key, fields)).await?;
        Ok(())
    }

    /// HSETNX — returns true when this call created the field. The win/lose
    /// result is what makes fill processing exactly-once.
    pub async fn hsetnx(&self, key: &str, field: &str, value: &str) -> EngineResult<bool> {
        self.cache.invalidate(key);
        let created: i64 = self
            .write_cmd(redis::Cmd::hset_nx(key, field, value))
            .await?;
        Ok(created == 1)
    }

    pub async fn hincr(&self, key: &str, field: &str, by: i64) -> EngineResult<i64> {
        self.cache.invalidate(key);
        self.write_cmd(redis::Cmd::hincr(key, field, by)).await
    }

    // -------------------------------------------------------------------------
    // Sorted sets (timestamp-scored)
    // -------------------------------------------------------------------------

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> EngineResult<()> {
        let _: i64 = self.write_cmd(redis::Cmd::zadd(key, member, score)).await?;
        Ok(())
    }

    /// Newest-first page of members.
    pub async fn zrevrange(
        &self,
        key: &str,
        offset: isize,
        count: isize,
    ) -> EngineResult<Vec<String>> {
        let stop = if count <= 0 { -1 } else { offset + count - 1 };
        self.read_cmd(redis::Cmd::zrevrange(key, offset, stop)).await
    }

    pub async fn zcard(&self, key: &str) -> EngineResult<u64> {
        self.read_cmd(redis::Cmd::zcard(key)).await
    }

    // -------------------------------------------------------------------------
    // Lists (FIFO queues)
    // -------------------------------------------------------------------------

    pub async fn rpush(&self, key: &str, value: &str) -> EngineResult<i64> {
        self.write_cmd(redis::Cmd::rpush(key, value)).await
    }

    pub async fn lpop(&self, key: &str) -> EngineResult<Option<String>> {
        self.write_cmd(redis::Cmd::lpop(key, None)).await
    }

    pub async fn llen(&self, key: &str) -> EngineResult<u64> {
        self.read_cmd(redis::Cmd::llen(key)).await
    }

    // -------------------------------------------------------------------------
    // Sets
    // -------------------------------------------------------------------------

    pub async fn sadd(&self, key: &str, member: &str) -> EngineResult<()> {
        let _: i64 = self.write_cmd(redis::Cmd::sadd(key, member)).await?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> EngineResult<()> {
        let _: i64 = self.write_cmd(redis::Cmd::srem(key, member)).await?;
        Ok(())
    }

    pub async fn smembers(&self, key: &str) -> EngineResult<Vec<String>> {
        self.read_cmd(redis::Cmd::smembers(key)).await
    }

    // -------------------------------------------------------------------------
    // Cursor scan
    // -------------------------------------------------------------------------

    /// Cursor-based pattern scan. Never issues a blocking KEYS enumeration.
    pub async fn scan_match(&self, pattern: &str) -> EngineResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut out = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> = conn.scan_match(pattern).await?;
        while let Some(key) = iter.next_item().await {
            out.push(key);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Pipelines
    // -------------------------------------------------------------------------

    /// Execute a pre-built pipeline atomically (MULTI/EXEC) through the write
    /// retry ladder.
    pub async fn run_pipeline(&self, pipe: redis::Pipeline) -> EngineResult<()> {
        let mut attempt: u32 = 0;
        loop {
            let mut conn = self.conn.clone();
            let result: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < WRITE_RETRIES => {
                    let delay = WRITE_BACKOFF_BASE_SECS * 2u64.pow(attempt);
                    warn!(error = %e, attempt, delay_secs = delay, "pipeline failed — retrying");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Pub/sub
    // -------------------------------------------------------------------------

    pub async fn publish(&self, channel: &str, payload: &str) -> EngineResult<()> {
        let _: i64 = self.write_cmd(redis::Cmd::publish(channel, payload)).await?;
        Ok(())
    }

    /// Open a dedicated pub/sub connection subscribed to `channel`. The
    /// returned handle owns its connection; dropping it unsubscribes.
    pub async fn subscribe(&self, channel: &str) -> EngineResult<redis::aio::PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(pubsub)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("cache_entries", &self.cache.len())
            .finish()
    }
}
