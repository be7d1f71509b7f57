// =============================================================================
// Journal — append-only, time-ordered log stream per user
// =============================================================================
//
// Entries land on the sorted set `telegram:logs:by_okx_uid:{uid}` scored by
// unix time, and are simultaneously published on the matching pub/sub
// channel so WebSocket clients see them live.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineResult;
use crate::store::cache::CacheClass;
use crate::store::{keys, Store};
use crate::types::EventCategory;

/// One journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub event_type: String,
    pub status: String,
    pub category: String,
    #[serde(default)]
    pub strategy_type: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl LogEntry {
    pub fn new(uid: &str, event_type: &str, category: EventCategory, content: &str) -> Self {
        Self {
            timestamp: Utc::now().timestamp(),
            user_id: uid.to_string(),
            symbol: None,
            event_type: event_type.to_string(),
            status: "ok".to_string(),
            category: category.as_str().to_string(),
            strategy_type: "rsi".to_string(),
            content: content.to_string(),
            message_id: None,
            error_message: None,
        }
    }

    pub fn with_symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.status = "error".to_string();
        self.error_message = Some(error.to_string());
        self
    }
}

/// Writes entries to the stream and fans them out live.
#[derive(Clone)]
pub struct Journal {
    store: Store,
}

impl Journal {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append one entry and publish it. Failures are logged, never raised:
    /// journalling must not break the flow that produced the event.
    pub async fn record(&self, entry: LogEntry) {
        let uid = entry.user_id.clone();
        let payload = match serde_json::to_string(&entry) {
            Ok(p) => p,
            Err(e) => {
                warn!(uid, error = %e, "journal entry failed to serialize");
                return;
            }
        };
        if let Err(e) = self
            .store
            .zadd(&keys::logs(&uid), &payload, entry.timestamp as f64)
            .await
        {
            warn!(uid, error = %e, "journal append failed");
        }
        if let Err(e) = self.store.publish(&keys::log_channel(&uid), &payload).await {
            warn!(uid, error = %e, "journal publish failed");
        }
    }

    /// Newest-first page of entries with optional category / strategy
    /// filters applied after the range read.
    pub async fn query(
        &self,
        uid: &str,
        limit: usize,
        offset: usize,
        category: Option<&str>,
        strategy_type: Option<&str>,
    ) -> EngineResult<Vec<LogEntry>> {
        // Over-fetch when filtering so a filtered page can still fill up.
        let fetch = if category.is_some() || strategy_type.is_some() {
            (limit + offset) * 4
        } else {
            limit + offset
        };
        let raw = self
            .store
            .zrevrange(&keys::logs(uid), 0, fetch.max(1) as isize)
            .await?;

        let entries = raw
            .iter()
            .filter_map(|r| serde_json::from_str::<LogEntry>(r).ok())
            .filter(|e| category.map(|c| e.category == c).unwrap_or(true))
            .filter(|e| strategy_type.map(|s| e.strategy_type == s).unwrap_or(true))
            .skip(offset)
            .take(limit)
            .collect();
        Ok(entries)
    }

    /// Entry count with a long-TTL cache; exact freshness is not needed for
    /// the pagination header it feeds.
    pub async fn count(&self, uid: &str) -> EngineResult<u64> {
        let cache_key = format!("count:{}", keys::logs(uid));
        if let Some(hit) = self.store.cache().get(&cache_key) {
            if let Ok(n) = hit.parse() {
                return Ok(n);
            }
        }
        let n = self.store.zcard(&keys::logs(uid)).await?;
        self.store
            .cache()
            .put(&cache_key, &n.to_string(), CacheClass::Count);
        Ok(n)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_builder_sets_fields() {
        let entry = LogEntry::new("123", "tp1_execution", EventCategory::Tp, "TP1 filled")
            .with_symbol("BTC-USDT-SWAP");
        assert_eq!(entry.user_id, "123");
        assert_eq!(entry.category, "tp");
        assert_eq!(entry.symbol.as_deref(), Some("BTC-USDT-SWAP"));
        assert_eq!(entry.status, "ok");
        assert!(entry.error_message.is_none());
    }

    #[test]
    fn error_builder_flips_status() {
        let entry =
            LogEntry::new("123", "cycle_error", EventCategory::Error, "boom").with_error("boom");
        assert_eq!(entry.status, "error");
        assert_eq!(entry.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn entry_roundtrips_through_json() {
        let entry = LogEntry::new("42", "entry", EventCategory::Entry, "opened");
        let raw = serde_json::to_string(&entry).unwrap();
        let back: LogEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.event_type, "entry");
        assert_eq!(back.user_id, "42");
    }
}
