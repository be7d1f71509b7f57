// =============================================================================
// MonitoredOrder rows — the monitor's view of every order it tracks
// =============================================================================
//
// Live rows sit under `monitor:user:{uid}:{sym}:order:{id}`. On reaching a
// terminal state the row moves to `completed:user:...` with a 14-day TTL and
// the live row is deleted in the same pipeline.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineResult;
use crate::store::{keys, Store};
use crate::types::{OrderKind, OrderState, PosSide};

/// Archive TTL for completed orders.
pub const COMPLETED_TTL_SECS: i64 = 14 * 24 * 3600;

/// One tracked order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredOrder {
    pub uid: String,
    pub symbol: String,
    pub order_id: String,
    pub status: OrderState,
    pub price: f64,
    pub position_side: PosSide,
    pub contracts_amount: f64,
    pub filled_contracts_amount: f64,
    pub remain_contracts_amount: f64,
    /// Role in the order graph; disambiguates TP limits from entry limits.
    pub order_type: OrderKind,
    pub position_qty: f64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub is_hedge: bool,
}

impl MonitoredOrder {
    pub fn new(
        uid: &str,
        symbol: &str,
        order_id: &str,
        order_type: OrderKind,
        position_side: PosSide,
        price: f64,
        contracts_amount: f64,
        position_qty: f64,
        is_hedge: bool,
    ) -> Self {
        let now_ms = Utc::now().timestamp_millis();
        Self {
            uid: uid.to_string(),
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
            status: OrderState::Open,
            price,
            position_side,
            contracts_amount,
            filled_contracts_amount: 0.0,
            remain_contracts_amount: contracts_amount,
            order_type,
            position_qty,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            is_hedge,
        }
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("order_id".into(), self.order_id.clone()),
            ("symbol".into(), self.symbol.clone()),
            ("status".into(), self.status.as_str().into()),
            ("price".into(), self.price.to_string()),
            ("position_side".into(), self.position_side.as_str().into()),
            ("contracts_amount".into(), self.contracts_amount.to_string()),
            (
                "filled_contracts_amount".into(),
                self.filled_contracts_amount.to_string(),
            ),
            (
                "remain_contracts_amount".into(),
                self.remain_contracts_amount.to_string(),
            ),
            ("order_name".into(), self.order_type.as_str().into()),
            ("position_qty".into(), self.position_qty.to_string()),
            ("created_at_ms".into(), self.created_at_ms.to_string()),
            ("updated_at_ms".into(), self.updated_at_ms.to_string()),
            ("is_hedge".into(), self.is_hedge.to_string()),
        ]
    }

    pub fn from_hash(uid: &str, map: &HashMap<String, String>) -> Option<Self> {
        if map.is_empty() {
            return None;
        }
        let num = |field: &str| -> f64 {
            map.get(field).and_then(|v| v.parse().ok()).unwrap_or(0.0)
        };
        Some(Self {
            uid: uid.to_string(),
            symbol: map.get("symbol")?.clone(),
            order_id: map.get("order_id")?.clone(),
            status: map
                .get("status")
                .and_then(|v| OrderState::parse(v))
                .unwrap_or(OrderState::Open),
            price: num("price"),
            position_side: map
                .get("position_side")
                .and_then(|v| PosSide::parse(v))
                .unwrap_or(PosSide::Long),
            contracts_amount: num("contracts_amount"),
            filled_contracts_amount: num("filled_contracts_amount"),
            remain_contracts_amount: num("remain_contracts_amount"),
            order_type: map
                .get("order_name")
                .and_then(|v| OrderKind::parse(v))
                .unwrap_or(OrderKind::Limit),
            position_qty: num("position_qty"),
            created_at_ms: map
                .get("created_at_ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            updated_at_ms: map
                .get("updated_at_ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            is_hedge: matches!(map.get("is_hedge").map(String::as_str), Some("true")),
        })
    }
}

/// Store operations for monitored rows.
#[derive(Clone)]
pub struct OrderRows {
    store: Store,
}

impl OrderRows {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, order: &MonitoredOrder) -> EngineResult<()> {
        let key = keys::monitor_order(&order.uid, &order.symbol, &order.order_id);
        self.store.hset_multiple(&key, &order.to_fields()).await
    }

    pub async fn fetch(
        &self,
        uid: &str,
        symbol: &str,
        order_id: &str,
    ) -> EngineResult<Option<MonitoredOrder>> {
        let map = self
            .store
            .hgetall(&keys::monitor_order(uid, symbol, order_id))
            .await?;
        Ok(MonitoredOrder::from_hash(uid, &map))
    }

    /// All live rows for one user, via cursor scan.
    pub async fn fetch_all(&self, uid: &str) -> EngineResult<Vec<MonitoredOrder>> {
        let mut rows = Vec::new();
        for key in self
            .store
            .scan_match(&keys::monitor_order_pattern(uid))
            .await?
        {
            let map = self.store.hgetall(&key).await?;
            if let Some(order) = MonitoredOrder::from_hash(uid, &map) {
                rows.push(order);
            }
        }
        Ok(rows)
    }

    /// Update status and fill amounts in place.
    pub async fn update_fill(
        &self,
        order: &MonitoredOrder,
        status: OrderState,
        filled: f64,
    ) -> EngineResult<()> {
        let key = keys::monitor_order(&order.uid, &order.symbol, &order.order_id);
        self.store
            .hset_multiple(
                &key,
                &[
                    ("status".into(), status.as_str().into()),
                    ("filled_contracts_amount".into(), filled.to_string()),
                    (
                        "remain_contracts_amount".into(),
                        (order.contracts_amount - filled).max(0.0).to_string(),
                    ),
                    (
                        "updated_at_ms".into(),
                        Utc::now().timestamp_millis().to_string(),
                    ),
                ],
            )
            .await
    }

    /// Move a terminal row to the archive key (14-day TTL) and delete the
    /// live row, in one atomic pipeline.
    pub async fn archive(&self, order: &MonitoredOrder, status: OrderState) -> EngineResult<()> {
        let live_key = keys::monitor_order(&order.uid, &order.symbol, &order.order_id);
        let archive_key = keys::completed_order(&order.uid, &order.symbol, &order.order_id);

        let mut archived = order.clone();
        archived.status = status;
        archived.updated_at_ms = Utc::now().timestamp_millis();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, value) in archived.to_fields() {
            pipe.hset(&archive_key, field, value).ignore();
        }
        pipe.expire(&archive_key, COMPLETED_TTL_SECS).ignore();
        pipe.del(&live_key).ignore();
        self.store.run_pipeline(pipe).await?;

        debug!(
            uid = %order.uid,
            symbol = %order.symbol,
            order_id = %order.order_id,
            status = %status,
            "order archived"
        );
        Ok(())
    }

    pub async fn delete(&self, uid: &str, symbol: &str, order_id: &str) -> EngineResult<()> {
        self.store
            .del(&keys::monitor_order(uid, symbol, order_id))
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_roundtrip() {
        let order = MonitoredOrder::new(
            "u1",
            "BTC-USDT-SWAP",
            "oid-1",
            OrderKind::Tp2,
            PosSide::Long,
            103.0,
            3.0,
            10.0,
            false,
        );
        let map: HashMap<String, String> = order.to_fields().into_iter().collect();
        let back = MonitoredOrder::from_hash("u1", &map).unwrap();
        assert_eq!(back.order_id, "oid-1");
        assert_eq!(back.order_type, OrderKind::Tp2);
        assert_eq!(back.status, OrderState::Open);
        assert!((back.remain_contracts_amount - 3.0).abs() < f64::EPSILON);
        assert!(!back.is_hedge);
    }

    #[test]
    fn new_row_starts_open_with_full_remainder() {
        let order = MonitoredOrder::new(
            "u1",
            "ETH-USDT-SWAP",
            "oid-2",
            OrderKind::Sl,
            PosSide::Short,
            95.0,
            10.0,
            10.0,
            true,
        );
        assert_eq!(order.status, OrderState::Open);
        assert!((order.filled_contracts_amount - 0.0).abs() < f64::EPSILON);
        assert!((order.remain_contracts_amount - 10.0).abs() < f64::EPSILON);
        assert!(order.is_hedge);
    }

    #[test]
    fn from_hash_empty_is_none() {
        assert!(MonitoredOrder::from_hash("u1", &HashMap::new()).is_none());
    }
}
