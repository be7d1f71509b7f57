// =============================================================================
// Position Repository — per-side position rows and their TP/SL metadata
// =============================================================================
//
// Rows live in redis hashes keyed (uid, symbol, side). All mutation goes
// through narrow helpers; full-row replacement is deliberately not offered.
// The exactly-once `get_tpN` flip is implemented with HSETNX so concurrent
// monitor paths cannot double-process a fill.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::journal::{Journal, LogEntry};
use crate::okx::types::LivePosition;
use crate::okx::OkxClient;
use crate::store::{keys, Store};
use crate::types::{EventCategory, PosSide};

/// Lifecycle state of one TP level in the order graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TpStatus {
    Active,
    Inactive,
    Filled,
}

/// Structured per-level TP record stored under the `tp_data` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpEntry {
    pub level: u8,
    pub price: f64,
    pub status: TpStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

/// One placed TP leg, as produced by the TP/SL engine.
#[derive(Debug, Clone)]
pub struct TpLeg {
    pub level: u8,
    pub price: f64,
    pub contracts: f64,
    pub order_id: Option<String>,
    pub active: bool,
}

/// A position row with numeric fields coerced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub uid: String,
    pub symbol: String,
    pub side: PosSide,
    pub entry_price: f64,
    pub contracts_amount: f64,
    pub position_qty: f64,
    pub leverage: f64,
    pub last_entry_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sl_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sl_order_id: Option<String>,
    #[serde(default)]
    pub sl_contracts_amount: f64,
    #[serde(default)]
    pub tp_prices: Vec<f64>,
    #[serde(default)]
    pub tp_order_ids: Vec<String>,
    #[serde(default)]
    pub tp_contracts_amounts: Vec<f64>,
    #[serde(default)]
    pub tp_data: Vec<TpEntry>,
    #[serde(default)]
    pub get_tp1: bool,
    #[serde(default)]
    pub get_tp2: bool,
    #[serde(default)]
    pub get_tp3: bool,
    #[serde(default)]
    pub trailing_stop_active: bool,
    #[serde(default)]
    pub is_hedge: bool,
    #[serde(default)]
    pub dca_count: u32,
    /// Highest filled TP level so far; monotonic until the position closes.
    #[serde(default)]
    pub tp_state: u8,
    pub main_direction: PosSide,
    #[serde(default)]
    pub created_at_ms: i64,
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl Position {
    pub fn tp_filled(&self, level: u8) -> bool {
        match level {
            1 => self.get_tp1,
            2 => self.get_tp2,
            _ => self.get_tp3,
        }
    }

    /// Levels that still have a live order out.
    pub fn open_tp_levels(&self) -> Vec<u8> {
        self.tp_data
            .iter()
            .filter(|e| e.status == TpStatus::Active)
            .map(|e| e.level)
            .collect()
    }

    /// All enabled TPs filled means the graph ran to completion.
    pub fn all_tps_filled(&self) -> bool {
        !self.tp_data.is_empty()
            && self
                .tp_data
                .iter()
                .filter(|e| e.status != TpStatus::Inactive)
                .all(|e| e.status == TpStatus::Filled)
    }
}

/// Result of a live reconciliation against the exchange.
#[derive(Debug, Clone)]
pub struct LiveCheck {
    pub position: Position,
    pub live: Option<LivePosition>,
    /// Exchange shows a position whose creation time postdates our row by
    /// more than a minute: the position was silently replaced out-of-band.
    pub silently_replaced: bool,
}

// -----------------------------------------------------------------------------
// Hash codec
// -----------------------------------------------------------------------------

fn f(map: &HashMap<String, String>, field: &str) -> f64 {
    map.get(field).and_then(|v| v.parse().ok()).unwrap_or(0.0)
}

fn i(map: &HashMap<String, String>, field: &str) -> i64 {
    map.get(field).and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn b(map: &HashMap<String, String>, field: &str) -> bool {
    matches!(map.get(field).map(String::as_str), Some("true") | Some("1"))
}

fn json_vec<T: for<'de> Deserialize<'de>>(map: &HashMap<String, String>, field: &str) -> Vec<T> {
    map.get(field)
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default()
}

fn decode(
    uid: &str,
    symbol: &str,
    side: PosSide,
    map: &HashMap<String, String>,
) -> Option<Position> {
    if map.is_empty() {
        return None;
    }
    Some(Position {
        uid: uid.to_string(),
        symbol: symbol.to_string(),
        side,
        entry_price: f(map, "entry_price"),
        contracts_amount: f(map, "contracts_amount"),
        position_qty: f(map, "position_qty"),
        leverage: f(map, "leverage"),
        last_entry_price: f(map, "last_entry_price"),
        sl_price: map.get("sl_price").and_then(|v| v.parse().ok()),
        sl_order_id: map.get("sl_order_id").filter(|v| !v.is_empty()).cloned(),
        sl_contracts_amount: f(map, "sl_contracts_amount"),
        tp_prices: json_vec(map, "tp_prices"),
        tp_order_ids: json_vec(map, "tp_order_ids"),
        tp_contracts_amounts: json_vec(map, "tp_contracts_amounts"),
        tp_data: json_vec(map, "tp_data"),
        get_tp1: b(map, "get_tp1"),
        get_tp2: b(map, "get_tp2"),
        get_tp3: b(map, "get_tp3"),
        trailing_stop_active: b(map, "trailing_stop_active"),
        is_hedge: b(map, "is_hedge"),
        dca_count: i(map, "dca_count") as u32,
        tp_state: i(map, "tp_state") as u8,
        main_direction: map
            .get("main_direction")
            .and_then(|v| PosSide::parse(v))
            .unwrap_or(side),
        created_at_ms: i(map, "created_at_ms"),
        updated_at_ms: i(map, "updated_at_ms"),
    })
}

// -----------------------------------------------------------------------------
// Repository
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub struct PositionRepo {
    store: Store,
    journal: Journal,
}

impl PositionRepo {
    pub fn new(store: Store, journal: Journal) -> Self {
        Self { store, journal }
    }

    pub async fn fetch(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
    ) -> EngineResult<Option<Position>> {
        let map = self.store.hgetall(&keys::position(uid, symbol, side)).await?;
        Ok(decode(uid, symbol, side, &map))
    }

    /// Fetch the stored row and reconcile it against the exchange's live
    /// positions: quantity and average price are refreshed, and a creation
    /// time newer than our row flags a silent replacement.
    pub async fn fetch_live(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
        client: &OkxClient,
    ) -> EngineResult<Option<LiveCheck>> {
        let Some(mut position) = self.fetch(uid, symbol, side).await? else {
            return Ok(None);
        };

        let live = client
            .fetch_positions(&[symbol])
            .await?
            .into_iter()
            .find(|p| p.pos_side == side);

        let mut silently_replaced = false;
        if let Some(live_pos) = &live {
            silently_replaced = position.created_at_ms > 0
                && live_pos.created_at_ms > position.created_at_ms + 60_000;

            if (live_pos.contracts - position.contracts_amount).abs() > f64::EPSILON
                || (live_pos.avg_entry_price - position.entry_price).abs() > f64::EPSILON
            {
                position.contracts_amount = live_pos.contracts;
                position.entry_price = live_pos.avg_entry_price;
                position.updated_at_ms = live_pos.updated_at_ms;
                self.store
                    .hset_multiple(
                        &keys::position(uid, symbol, side),
                        &[
                            ("contracts_amount".into(), live_pos.contracts.to_string()),
                            ("entry_price".into(), live_pos.avg_entry_price.to_string()),
                            ("updated_at_ms".into(), live_pos.updated_at_ms.to_string()),
                        ],
                    )
                    .await?;
            }
        }

        Ok(Some(LiveCheck {
            position,
            live,
            silently_replaced,
        }))
    }

    /// Create a fresh position row on first entry.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
        entry_price: f64,
        contracts_amount: f64,
        position_qty: f64,
        leverage: f64,
        is_hedge: bool,
        main_direction: PosSide,
    ) -> EngineResult<Position> {
        let now_ms = Utc::now().timestamp_millis();
        // get_tpN fields are intentionally absent until a fill flips them:
        // HSETNX on first write is what makes the flip exactly-once.
        let fields: Vec<(String, String)> = vec![
            ("entry_price".into(), entry_price.to_string()),
            ("last_entry_price".into(), entry_price.to_string()),
            ("contracts_amount".into(), contracts_amount.to_string()),
            ("position_qty".into(), position_qty.to_string()),
            ("leverage".into(), leverage.to_string()),
            ("trailing_stop_active".into(), "false".into()),
            ("is_hedge".into(), is_hedge.to_string()),
            ("dca_count".into(), "1".into()),
            ("tp_state".into(), "0".into()),
            ("main_direction".into(), main_direction.as_str().into()),
            ("created_at_ms".into(), now_ms.to_string()),
            ("updated_at_ms".into(), now_ms.to_string()),
        ];
        self.store
            .hset_multiple(&keys::position(uid, symbol, side), &fields)
            .await?;

        info!(uid, symbol, %side, entry_price, contracts_amount, is_hedge, "position row created");
        self.fetch(uid, symbol, side)
            .await?
            .ok_or_else(|| EngineError::Store("position row vanished after create".into()))
    }

    /// Record a DCA entry: new average entry, new size, bumped dca_count.
    pub async fn record_dca(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
        new_entry_price: f64,
        fill_price: f64,
        new_contracts: f64,
        new_qty: f64,
    ) -> EngineResult<u32> {
        let key = keys::position(uid, symbol, side);
        let dca_count = self.store.hincr(&key, "dca_count", 1).await? as u32;
        self.store
            .hset_multiple(
                &key,
                &[
                    ("entry_price".into(), new_entry_price.to_string()),
                    ("last_entry_price".into(), fill_price.to_string()),
                    ("contracts_amount".into(), new_contracts.to_string()),
                    ("position_qty".into(), new_qty.to_string()),
                    (
                        "updated_at_ms".into(),
                        Utc::now().timestamp_millis().to_string(),
                    ),
                ],
            )
            .await?;
        Ok(dca_count)
    }

    /// Write the freshly-placed TP graph. The parallel arrays must agree in
    /// length, carry at most three active levels, and never oversell the
    /// position.
    pub async fn set_tp_graph(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
        legs: &[TpLeg],
    ) -> EngineResult<()> {
        let active: Vec<&TpLeg> = legs.iter().filter(|l| l.active).collect();
        if active.len() > 3 {
            return Err(EngineError::Invariant(format!(
                "{} active TP legs, maximum is 3",
                active.len()
            )));
        }
        let placed_without_order = active.iter().any(|l| l.order_id.is_none());
        if placed_without_order {
            return Err(EngineError::Invariant(
                "active TP leg without an order id".into(),
            ));
        }

        let position = self
            .fetch(uid, symbol, side)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("position {uid}/{symbol}/{side}")))?;
        let total: f64 = active.iter().map(|l| l.contracts).sum();
        if total > position.contracts_amount + 1e-9 {
            return Err(EngineError::Invariant(format!(
                "TP legs total {total} contracts exceeds position size {}",
                position.contracts_amount
            )));
        }

        let tp_prices: Vec<f64> = active.iter().map(|l| l.price).collect();
        let tp_order_ids: Vec<String> =
            active.iter().filter_map(|l| l.order_id.clone()).collect();
        let tp_contracts: Vec<f64> = active.iter().map(|l| l.contracts).collect();
        let tp_data: Vec<TpEntry> = legs
            .iter()
            .map(|l| TpEntry {
                level: l.level,
                price: l.price,
                status: if l.active {
                    TpStatus::Active
                } else {
                    TpStatus::Inactive
                },
                order_id: l.order_id.clone(),
            })
            .collect();

        self.store
            .hset_multiple(
                &keys::position(uid, symbol, side),
                &[
                    ("tp_prices".into(), serde_json::to_string(&tp_prices)?),
                    ("tp_order_ids".into(), serde_json::to_string(&tp_order_ids)?),
                    (
                        "tp_contracts_amounts".into(),
                        serde_json::to_string(&tp_contracts)?,
                    ),
                    ("tp_data".into(), serde_json::to_string(&tp_data)?),
                    (
                        "updated_at_ms".into(),
                        Utc::now().timestamp_millis().to_string(),
                    ),
                ],
            )
            .await?;
        debug!(uid, symbol, %side, legs = active.len(), "TP graph stored");
        Ok(())
    }

    /// Record a newly placed SL. The previous SL must already have been
    /// cancelled and cleared; a lingering id is an invariant violation.
    pub async fn set_sl(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
        sl_price: f64,
        sl_order_id: &str,
        contracts: f64,
    ) -> EngineResult<()> {
        let key = keys::position(uid, symbol, side);
        if let Some(existing) = self.store.hget(&key, "sl_order_id").await? {
            if !existing.is_empty() && existing != sl_order_id {
                return Err(EngineError::Invariant(format!(
                    "SL {existing} still recorded — cancel before replacing"
                )));
            }
        }
        self.store
            .hset_multiple(
                &key,
                &[
                    ("sl_price".into(), sl_price.to_string()),
                    ("sl_order_id".into(), sl_order_id.to_string()),
                    ("sl_contracts_amount".into(), contracts.to_string()),
                ],
            )
            .await?;
        debug!(uid, symbol, %side, sl_price, sl_order_id, "SL recorded");
        Ok(())
    }

    /// Forget the SL columns after a confirmed cancel.
    pub async fn clear_sl(&self, uid: &str, symbol: &str, side: PosSide) -> EngineResult<()> {
        self.store
            .hdel(
                &keys::position(uid, symbol, side),
                &["sl_price", "sl_order_id", "sl_contracts_amount"],
            )
            .await
    }

    /// Drop every TP/SL column ahead of a DCA re-placement.
    pub async fn clear_tp_sl_fields(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
    ) -> EngineResult<()> {
        self.store
            .hdel(
                &keys::position(uid, symbol, side),
                &[
                    "tp_prices",
                    "tp_order_ids",
                    "tp_sizes",
                    "tp_contracts_amounts",
                    "tp_data",
                    "sl_price",
                    "sl_order_id",
                    "sl_contracts_amount",
                ],
            )
            .await
    }

    /// Flip `get_tpN` exactly once. Returns `true` only for the caller that
    /// won the flip; duplicates are no-ops so downstream side effects cannot
    /// run twice. The numeric `tp_state` is raised in the same mutation.
    pub async fn mark_tp_filled(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
        level: u8,
    ) -> EngineResult<bool> {
        let key = keys::position(uid, symbol, side);
        let field = format!("get_tp{level}");
        // The field does not exist until the first fill, so HSETNX is an
        // atomic first-writer-wins gate across concurrent monitor paths.
        let won = self.store.hsetnx(&key, &field, "true").await?;
        if !won {
            debug!(uid, symbol, %side, level, "duplicate TP fill ignored");
            return Ok(false);
        }

        // Keep tp_state in sync with the boolean flags.
        let state = self
            .store
            .hget(&key, "tp_state")
            .await?
            .and_then(|v| v.parse::<u8>().ok())
            .unwrap_or(0);
        if level > state {
            self.store
                .hset(&key, "tp_state", &level.to_string())
                .await?;
        }

        // Mark the tp_data entry filled.
        if let Some(raw) = self.store.hget(&key, "tp_data").await? {
            if let Ok(mut data) = serde_json::from_str::<Vec<TpEntry>>(&raw) {
                if let Some(entry) = data.iter_mut().find(|e| e.level == level) {
                    entry.status = TpStatus::Filled;
                }
                self.store
                    .hset(&key, "tp_data", &serde_json::to_string(&data)?)
                    .await?;
            }
        }
        Ok(true)
    }

    pub async fn set_trailing_active(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
        active: bool,
    ) -> EngineResult<()> {
        self.store
            .hset(
                &keys::position(uid, symbol, side),
                "trailing_stop_active",
                if active { "true" } else { "false" },
            )
            .await
    }

    /// Arm the re-entry cooldown after a close.
    pub async fn set_cooldown(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
        secs: u64,
    ) -> EngineResult<()> {
        if secs == 0 {
            return Ok(());
        }
        self.store
            .set_ex(&keys::cooldown(uid, symbol, side), "1", secs)
            .await
    }

    pub async fn in_cooldown(&self, uid: &str, symbol: &str, side: PosSide) -> EngineResult<bool> {
        self.store.exists(&keys::cooldown(uid, symbol, side)).await
    }

    /// Delete the position row together with its dependent artefacts
    /// (trailing record, cooldown, side locks) and emit the close event.
    pub async fn clear_side(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
        reason: &str,
    ) -> EngineResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(keys::position(uid, symbol, side)).ignore();
        pipe.del(keys::trailing(uid, symbol, side)).ignore();
        pipe.del(keys::cooldown(uid, symbol, side)).ignore();
        self.store.run_pipeline(pipe).await?;

        // Side locks carry the timeframe in the key, so sweep by pattern.
        match self
            .store
            .scan_match(&format!("lock:user:{uid}:{symbol}:*"))
            .await
        {
            Ok(locks) => {
                for lock in locks {
                    if let Err(e) = self.store.del(&lock).await {
                        warn!(uid, symbol, lock, error = %e, "lock cleanup failed");
                    }
                }
            }
            Err(e) => warn!(uid, symbol, error = %e, "lock scan failed during clear_side"),
        }

        self.journal
            .record(
                LogEntry::new(
                    uid,
                    "position_closed",
                    EventCategory::Exit,
                    &format!("{symbol} {side} position closed ({reason})"),
                )
                .with_symbol(symbol),
            )
            .await;

        info!(uid, symbol, %side, reason, "position cleared");
        Ok(())
    }

    /// Update the aggregate user stats after a closed trade.
    pub async fn record_trade_result(&self, uid: &str, pnl_pct: f64) -> EngineResult<()> {
        let key = keys::stats(uid);
        self.store.hincr(&key, "total_trades", 1).await?;
        if pnl_pct > 0.0 {
            self.store.hincr(&key, "wins", 1).await?;
        }
        let prior: f64 = self
            .store
            .hget(&key, "pnl_pct")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        self.store
            .hset_multiple(
                &key,
                &[
                    ("pnl_pct".into(), (prior + pnl_pct).to_string()),
                    (
                        "last_trade_at".into(),
                        Utc::now().timestamp().to_string(),
                    ),
                ],
            )
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hash() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("entry_price".into(), "100".into());
        map.insert("contracts_amount".into(), "10".into());
        map.insert("position_qty".into(), "10".into());
        map.insert("leverage".into(), "10".into());
        map.insert("sl_price".into(), "95".into());
        map.insert("sl_order_id".into(), "sl-1".into());
        map.insert("tp_prices".into(), "[102.0,103.0,104.0]".into());
        map.insert(
            "tp_order_ids".into(),
            r#"["tp-1","tp-2","tp-3"]"#.into(),
        );
        map.insert("tp_contracts_amounts".into(), "[3.0,3.0,4.0]".into());
        map.insert(
            "tp_data".into(),
            r#"[{"level":1,"price":102.0,"status":"active","order_id":"tp-1"},
                {"level":2,"price":103.0,"status":"active","order_id":"tp-2"},
                {"level":3,"price":104.0,"status":"active","order_id":"tp-3"}]"#
                .into(),
        );
        map.insert("get_tp1".into(), "true".into());
        map.insert("dca_count".into(), "2".into());
        map.insert("tp_state".into(), "1".into());
        map.insert("main_direction".into(), "long".into());
        map
    }

    #[test]
    fn decode_coerces_numeric_fields() {
        let pos = decode("u1", "BTC-USDT-SWAP", PosSide::Long, &sample_hash()).unwrap();
        assert!((pos.entry_price - 100.0).abs() < f64::EPSILON);
        assert_eq!(pos.tp_prices, vec![102.0, 103.0, 104.0]);
        assert_eq!(pos.tp_order_ids.len(), 3);
        assert_eq!(pos.sl_order_id.as_deref(), Some("sl-1"));
        assert!(pos.get_tp1);
        assert!(!pos.get_tp2);
        assert_eq!(pos.dca_count, 2);
        assert_eq!(pos.tp_state, 1);
    }

    #[test]
    fn decode_empty_hash_is_none() {
        assert!(decode("u1", "BTC-USDT-SWAP", PosSide::Long, &HashMap::new()).is_none());
    }

    #[test]
    fn open_levels_and_completion() {
        let pos = decode("u1", "BTC-USDT-SWAP", PosSide::Long, &sample_hash()).unwrap();
        assert_eq!(pos.open_tp_levels(), vec![1, 2, 3]);
        assert!(!pos.all_tps_filled());

        let mut map = sample_hash();
        map.insert(
            "tp_data".into(),
            r#"[{"level":1,"price":102.0,"status":"filled"},
                {"level":2,"price":103.0,"status":"filled"},
                {"level":3,"price":104.0,"status":"inactive"}]"#
                .into(),
        );
        let pos = decode("u1", "BTC-USDT-SWAP", PosSide::Long, &map).unwrap();
        assert!(pos.all_tps_filled());
        assert!(pos.open_tp_levels().is_empty());
    }

    #[test]
    fn missing_sl_fields_decode_as_absent() {
        let mut map = sample_hash();
        map.remove("sl_price");
        map.remove("sl_order_id");
        let pos = decode("u1", "BTC-USDT-SWAP", PosSide::Long, &map).unwrap();
        assert!(pos.sl_price.is_none());
        assert!(pos.sl_order_id.is_none());
    }
}
