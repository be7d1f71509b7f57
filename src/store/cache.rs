// =============================================================================
// In-memory read cache — short-TTL coalescing layer in front of the store
// =============================================================================
//
// TTL classes:
//   settings       30 s
//   hashes         60 s
//   order status    2 s   (coalesces poll bursts)
//   counts         10 min
//
// A background sweeper evicts expired entries every 60 s. The sweeper task is
// cancellable and joined on shutdown so it cannot leak.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// TTL class for a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    Settings,
    Hash,
    OrderStatus,
    Count,
}

impl CacheClass {
    pub fn ttl(self) -> Duration {
        match self {
            Self::Settings => Duration::from_secs(30),
            Self::Hash => Duration::from_secs(60),
            Self::OrderStatus => Duration::from_secs(2),
            Self::Count => Duration::from_secs(600),
        }
    }
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-wide read cache shared by all store handles.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a non-expired value.
    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        trace!(key, "cache hit");
        Some(entry.value.clone())
    }

    /// Fetch a value even if its TTL has lapsed. Used only on the degraded
    /// read path when the caller explicitly tolerates staleness.
    pub fn get_stale(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    pub fn put(&self, key: &str, value: &str, class: CacheClass) {
        let entry = Entry {
            value: value.to_string(),
            expires_at: Instant::now() + class.ttl(),
        };
        self.entries.write().insert(key.to_string(), entry);
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        self.entries.write().retain(|k, _| !k.starts_with(prefix));
    }

    /// Remove expired entries; returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Handle to the background sweeper. Aborts the task on shutdown.
pub struct CacheSweeper {
    handle: JoinHandle<()>,
}

impl CacheSweeper {
    /// Spawn the 60 s eviction loop.
    pub fn spawn(cache: Arc<MemoryCache>) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = cache.sweep();
                if evicted > 0 {
                    debug!(evicted, remaining = cache.len(), "cache sweep");
                }
            }
        });
        Self { handle }
    }

    /// Cancel the sweeper. Idempotent; called from graceful shutdown.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_within_ttl() {
        let cache = MemoryCache::new();
        cache.put("user:1:settings", "{}", CacheClass::Settings);
        assert_eq!(cache.get("user:1:settings").as_deref(), Some("{}"));
        assert!(cache.get("user:2:settings").is_none());
    }

    #[test]
    fn stale_read_survives_expiry() {
        let cache = MemoryCache::new();
        cache.put("k", "v", CacheClass::OrderStatus);
        // Force expiry by rewriting the entry with an already-past deadline.
        {
            let mut entries = cache.entries.write();
            entries.get_mut("k").unwrap().expires_at =
                Instant::now() - Duration::from_secs(1);
        }
        assert!(cache.get("k").is_none());
        assert_eq!(cache.get_stale("k").as_deref(), Some("v"));
    }

    #[test]
    fn sweep_evicts_only_expired() {
        let cache = MemoryCache::new();
        cache.put("live", "1", CacheClass::Hash);
        cache.put("dead", "2", CacheClass::Hash);
        {
            let mut entries = cache.entries.write();
            entries.get_mut("dead").unwrap().expires_at =
                Instant::now() - Duration::from_secs(1);
        }
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("live").is_some());
    }

    #[test]
    fn invalidate_prefix_clears_related_keys() {
        let cache = MemoryCache::new();
        cache.put("user:1:settings", "a", CacheClass::Settings);
        cache.put("user:1:stats", "b", CacheClass::Hash);
        cache.put("user:2:settings", "c", CacheClass::Settings);
        cache.invalidate_prefix("user:1:");
        assert!(cache.get("user:1:settings").is_none());
        assert!(cache.get("user:1:stats").is_none());
        assert!(cache.get("user:2:settings").is_some());
    }

    #[tokio::test]
    async fn sweeper_shutdown_does_not_leak() {
        let cache = Arc::new(MemoryCache::new());
        let sweeper = CacheSweeper::spawn(cache.clone());
        sweeper.shutdown();
        // Aborted task settles without blocking shutdown.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sweeper.handle.is_finished());
    }
}
