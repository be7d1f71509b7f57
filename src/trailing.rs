// =============================================================================
// Trailing-Stop Handler — watermark records with throttled SL pushes
// =============================================================================
//
// Each record lives in its own hash (independent of the position row) with a
// 7-day TTL as a safety bound. Watermark moves are applied locally on every
// tick; the derived SL is pushed to the exchange at most once per hour.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::monitor::notify::Notifier;
use crate::monitor::orders::{MonitoredOrder, OrderRows};
use crate::okx::types::OrderRequest;
use crate::okx::OkxClient;
use crate::position::{Position, PositionRepo};
use crate::settings::{Settings, TrailingOffsetMode};
use crate::store::{keys, Store};
use crate::types::{EventCategory, OrderKind, PosSide};

/// Record TTL: stale trailing state must not outlive a week.
pub const TRAILING_TTL_SECS: i64 = 7 * 24 * 3600;
/// Minimum interval between SL pushes to the exchange.
const SL_PUSH_INTERVAL_MS: i64 = 3600 * 1000;

/// What one price observation did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingAction {
    None,
    /// Watermark advanced; stop price moved with it.
    WatermarkMoved,
    /// Price crossed the stop: close the side.
    Triggered,
}

/// One trailing-stop record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingRecord {
    pub active: bool,
    pub side: PosSide,
    pub entry_price: f64,
    pub contracts_amount: f64,
    pub trailing_offset: f64,
    /// Highest price seen (long) or lowest price seen (short).
    pub watermark: f64,
    pub trailing_stop_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sl_order_id: Option<String>,
    pub leverage: f64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub last_sl_push_ms: i64,
}

impl TrailingRecord {
    /// Apply one price observation. Pure; persistence happens at the caller.
    pub fn on_price(&mut self, price: f64) -> TrailingAction {
        match self.side {
            PosSide::Long => {
                if price <= self.trailing_stop_price {
                    return TrailingAction::Triggered;
                }
                if price > self.watermark {
                    self.watermark = price;
                    self.trailing_stop_price = price - self.trailing_offset;
                    return TrailingAction::WatermarkMoved;
                }
            }
            PosSide::Short => {
                if price >= self.trailing_stop_price {
                    return TrailingAction::Triggered;
                }
                if price < self.watermark {
                    self.watermark = price;
                    self.trailing_stop_price = price + self.trailing_offset;
                    return TrailingAction::WatermarkMoved;
                }
            }
        }
        TrailingAction::None
    }
}

/// Compute the trailing offset from settings at activation time.
pub fn compute_offset(
    settings: &Settings,
    current_price: f64,
    tp_prices: &[f64],
) -> EngineResult<f64> {
    match settings.trailing_offset_mode() {
        TrailingOffsetMode::FixedPercent => {
            Ok(current_price * settings.trailing_stop_offset_value / 100.0)
        }
        TrailingOffsetMode::Tp2Tp3Gap => {
            let (tp2, tp3) = match (tp_prices.get(1), tp_prices.get(2)) {
                (Some(tp2), Some(tp3)) if *tp2 > 0.0 && *tp3 > 0.0 => (*tp2, *tp3),
                _ => {
                    return Err(EngineError::Invariant(
                        "tp2/tp3 gap mode needs both TP prices".into(),
                    ))
                }
            };
            Ok((tp3 - tp2).abs())
        }
    }
}

// -----------------------------------------------------------------------------
// Handler
// -----------------------------------------------------------------------------

pub struct TrailingStopHandler {
    store: Store,
    positions: PositionRepo,
    orders: OrderRows,
    notifier: Arc<Notifier>,
}

impl TrailingStopHandler {
    pub fn new(
        store: Store,
        positions: PositionRepo,
        orders: OrderRows,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            positions,
            orders,
            notifier,
        }
    }

    /// Create and persist a trailing record for a side.
    pub async fn activate(
        &self,
        uid: &str,
        symbol: &str,
        position: &Position,
        settings: &Settings,
        current_price: f64,
    ) -> EngineResult<TrailingRecord> {
        let side = position.side;
        let offset = compute_offset(settings, current_price, &position.tp_prices)?;
        let stop = match side {
            PosSide::Long => current_price - offset,
            PosSide::Short => current_price + offset,
        };
        let now_ms = Utc::now().timestamp_millis();

        let record = TrailingRecord {
            active: true,
            side,
            entry_price: position.entry_price,
            contracts_amount: position.contracts_amount,
            trailing_offset: offset,
            watermark: current_price,
            trailing_stop_price: stop,
            sl_order_id: None,
            leverage: position.leverage,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            last_sl_push_ms: 0,
        };
        self.persist(uid, symbol, side, &record).await?;
        self.positions
            .set_trailing_active(uid, symbol, side, true)
            .await?;

        self.notifier
            .notify_deduped(
                &format!("trailing_activated:{uid}:{symbol}:{side}"),
                uid,
                Some(symbol),
                "trailing_stop_activated",
                EventCategory::Info,
                &format!(
                    "{symbol} {side} trailing stop armed: offset {offset:.4}, stop {stop:.4}"
                ),
            )
            .await;

        info!(uid, symbol, %side, offset, stop, "trailing stop activated");
        Ok(record)
    }

    pub async fn get(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
    ) -> EngineResult<Option<TrailingRecord>> {
        let map = self.store.hgetall(&keys::trailing(uid, symbol, side)).await?;
        Ok(Self::decode(side, &map))
    }

    /// One monitor-driven tick for an active record.
    pub async fn tick(
        &self,
        client: &OkxClient,
        uid: &str,
        symbol: &str,
        side: PosSide,
        current_price: f64,
    ) -> EngineResult<TrailingAction> {
        let Some(mut record) = self.get(uid, symbol, side).await? else {
            return Ok(TrailingAction::None);
        };
        if !record.active {
            return Ok(TrailingAction::None);
        }

        let action = record.on_price(current_price);
        match action {
            TrailingAction::Triggered => {
                self.trigger(client, uid, symbol, side, &record, current_price)
                    .await?;
            }
            TrailingAction::WatermarkMoved => {
                record.updated_at_ms = Utc::now().timestamp_millis();
                self.maybe_push_sl(client, uid, symbol, side, &mut record)
                    .await;
                self.persist(uid, symbol, side, &record).await?;
                debug!(
                    uid, symbol, %side,
                    watermark = record.watermark,
                    stop = record.trailing_stop_price,
                    "trailing watermark advanced"
                );
            }
            TrailingAction::None => {}
        }
        Ok(action)
    }

    /// Push the moved stop to the exchange, at most once per hour.
    async fn maybe_push_sl(
        &self,
        client: &OkxClient,
        uid: &str,
        symbol: &str,
        side: PosSide,
        record: &mut TrailingRecord,
    ) {
        let now_ms = Utc::now().timestamp_millis();
        if now_ms - record.last_sl_push_ms < SL_PUSH_INTERVAL_MS {
            return;
        }

        if let Some(old_id) = record.sl_order_id.take() {
            match client
                .cancel_algo_orders(std::slice::from_ref(&old_id), symbol)
                .await
            {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(e) => {
                    warn!(uid, symbol, old_id, error = %e, "trailing SL cancel failed");
                    record.sl_order_id = Some(old_id);
                    return;
                }
            }
        }

        let request = OrderRequest::stop_loss(
            symbol,
            side,
            record.trailing_stop_price,
            record.contracts_amount,
        );
        match client.create_order(&request).await {
            Ok(ack) => {
                let row = MonitoredOrder::new(
                    uid,
                    symbol,
                    &ack.order_id,
                    OrderKind::Sl,
                    side,
                    record.trailing_stop_price,
                    record.contracts_amount,
                    record.contracts_amount,
                    false,
                );
                if let Err(e) = self.orders.upsert(&row).await {
                    warn!(uid, symbol, error = %e, "trailing SL row write failed");
                }
                record.sl_order_id = Some(ack.order_id);
                record.last_sl_push_ms = now_ms;
                debug!(uid, symbol, %side, stop = record.trailing_stop_price, "trailing SL pushed");
            }
            Err(e) => {
                warn!(uid, symbol, %side, error = %e, "trailing SL push failed");
            }
        }
    }

    /// Close the side at market if it still holds size; purge the record
    /// either way.
    async fn trigger(
        &self,
        client: &OkxClient,
        uid: &str,
        symbol: &str,
        side: PosSide,
        record: &TrailingRecord,
        current_price: f64,
    ) -> EngineResult<()> {
        let live = client
            .fetch_positions(&[symbol])
            .await?
            .into_iter()
            .find(|p| p.pos_side == side);

        match live {
            Some(live_pos) if live_pos.contracts > 0.0 => {
                let request = OrderRequest::market_close(symbol, side, live_pos.contracts);
                match client.create_order(&request).await {
                    Ok(ack) => {
                        info!(
                            uid, symbol, %side,
                            contracts = live_pos.contracts,
                            order_id = %ack.order_id,
                            trailing_stop_price = record.trailing_stop_price,
                            "trailing stop triggered — market close sent"
                        );
                    }
                    Err(e) => {
                        warn!(uid, symbol, %side, error = %e, "trailing close failed");
                        return Err(e);
                    }
                }
            }
            _ => {
                debug!(uid, symbol, %side, "trailing triggered but side already flat");
            }
        }

        // Leftover trailing SL algo must not survive the close.
        if let Some(sl_id) = &record.sl_order_id {
            match client
                .cancel_algo_orders(std::slice::from_ref(sl_id), symbol)
                .await
            {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(e) => warn!(uid, symbol, sl_id, error = %e, "trailing SL cleanup failed"),
            }
        }

        self.clear(uid, symbol, side).await?;
        self.notifier
            .notify_deduped(
                &format!("trailing_exec:{uid}:{symbol}:{side}"),
                uid,
                Some(symbol),
                "trailing_stop_execution",
                EventCategory::Exit,
                &format!(
                    "{symbol} {side} trailing stop executed at {current_price} (trailing_stop_price={:.4})",
                    record.trailing_stop_price
                ),
            )
            .await;
        Ok(())
    }

    pub async fn clear(&self, uid: &str, symbol: &str, side: PosSide) -> EngineResult<()> {
        self.store.del(&keys::trailing(uid, symbol, side)).await?;
        self.positions
            .set_trailing_active(uid, symbol, side, false)
            .await
    }

    // -------------------------------------------------------------------------
    // Hash codec
    // -------------------------------------------------------------------------

    async fn persist(
        &self,
        uid: &str,
        symbol: &str,
        side: PosSide,
        record: &TrailingRecord,
    ) -> EngineResult<()> {
        let key = keys::trailing(uid, symbol, side);
        let watermark_field = match side {
            PosSide::Long => "highest_price",
            PosSide::Short => "lowest_price",
        };
        let fields: Vec<(String, String)> = vec![
            ("active".into(), record.active.to_string()),
            ("side".into(), side.as_str().into()),
            ("entry_price".into(), record.entry_price.to_string()),
            (
                "contracts_amount".into(),
                record.contracts_amount.to_string(),
            ),
            ("trailing_offset".into(), record.trailing_offset.to_string()),
            (watermark_field.into(), record.watermark.to_string()),
            (
                "trailing_stop_price".into(),
                record.trailing_stop_price.to_string(),
            ),
            (
                "sl_order_id".into(),
                record.sl_order_id.clone().unwrap_or_default(),
            ),
            ("leverage".into(), record.leverage.to_string()),
            ("created_at_ms".into(), record.created_at_ms.to_string()),
            ("updated_at_ms".into(), record.updated_at_ms.to_string()),
            ("last_sl_push_ms".into(), record.last_sl_push_ms.to_string()),
        ];
        self.store.hset_multiple(&key, &fields).await?;
        self.store.expire(&key, TRAILING_TTL_SECS).await
    }

    fn decode(side: PosSide, map: &HashMap<String, String>) -> Option<TrailingRecord> {
        if map.is_empty() {
            return None;
        }
        let num = |field: &str| -> f64 {
            map.get(field).and_then(|v| v.parse().ok()).unwrap_or(0.0)
        };
        let int = |field: &str| -> i64 {
            map.get(field).and_then(|v| v.parse().ok()).unwrap_or(0)
        };
        let watermark = match side {
            PosSide::Long => num("highest_price"),
            PosSide::Short => num("lowest_price"),
        };
        Some(TrailingRecord {
            active: matches!(map.get("active").map(String::as_str), Some("true")),
            side,
            entry_price: num("entry_price"),
            contracts_amount: num("contracts_amount"),
            trailing_offset: num("trailing_offset"),
            watermark,
            trailing_stop_price: num("trailing_stop_price"),
            sl_order_id: map.get("sl_order_id").filter(|v| !v.is_empty()).cloned(),
            leverage: num("leverage"),
            created_at_ms: int("created_at_ms"),
            updated_at_ms: int("updated_at_ms"),
            last_sl_push_ms: int("last_sl_push_ms"),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn short_record(current: f64, offset: f64) -> TrailingRecord {
        TrailingRecord {
            active: true,
            side: PosSide::Short,
            entry_price: 200.0,
            contracts_amount: 4.0,
            trailing_offset: offset,
            watermark: current,
            trailing_stop_price: current + offset,
            sl_order_id: None,
            leverage: 10.0,
            created_at_ms: 0,
            updated_at_ms: 0,
            last_sl_push_ms: 0,
        }
    }

    #[test]
    fn short_activation_then_trigger_sequence() {
        // TP3 filled for a short at entry 200, current 196, fixed 0.5 %.
        let offset: f64 = 196.0 * 0.5 / 100.0;
        assert!((offset - 0.98).abs() < 1e-9);
        let mut record = short_record(196.0, offset);
        assert!((record.trailing_stop_price - 196.98).abs() < 1e-9);

        // Price drops: watermark and stop follow.
        assert_eq!(record.on_price(195.0), TrailingAction::WatermarkMoved);
        assert!((record.watermark - 195.0).abs() < 1e-9);
        assert!((record.trailing_stop_price - 195.98).abs() < 1e-9);

        // Bounce below the stop: no action.
        assert_eq!(record.on_price(196.5), TrailingAction::None);
        assert!((record.trailing_stop_price - 195.98).abs() < 1e-9);

        // Crossing the stop triggers the close.
        assert_eq!(record.on_price(196.99), TrailingAction::Triggered);
        assert!((record.trailing_stop_price - 195.98).abs() < 1e-9);
    }

    #[test]
    fn long_watermark_moves_up_only() {
        let mut record = TrailingRecord {
            active: true,
            side: PosSide::Long,
            entry_price: 100.0,
            contracts_amount: 10.0,
            trailing_offset: 1.0,
            watermark: 104.0,
            trailing_stop_price: 103.0,
            sl_order_id: None,
            leverage: 10.0,
            created_at_ms: 0,
            updated_at_ms: 0,
            last_sl_push_ms: 0,
        };
        assert_eq!(record.on_price(105.0), TrailingAction::WatermarkMoved);
        assert!((record.trailing_stop_price - 104.0).abs() < 1e-9);
        assert_eq!(record.on_price(104.5), TrailingAction::None);
        assert_eq!(record.on_price(104.0), TrailingAction::Triggered);
    }

    #[test]
    fn fixed_percent_offset() {
        let settings = Settings::default(); // 0.5 % fixed
        let offset = compute_offset(&settings, 196.0, &[]).unwrap();
        assert!((offset - 0.98).abs() < 1e-9);
    }

    #[test]
    fn gap_mode_uses_tp_distance() {
        let mut settings = Settings::default();
        settings.use_trailing_stop_value_with_tp2_tp3_difference = true;
        let offset = compute_offset(&settings, 100.0, &[102.0, 103.0, 104.0]).unwrap();
        assert!((offset - 1.0).abs() < 1e-9);
    }

    #[test]
    fn gap_mode_without_tps_is_an_error() {
        let mut settings = Settings::default();
        settings.use_trailing_stop_value_with_tp2_tp3_difference = true;
        assert!(compute_offset(&settings, 100.0, &[102.0]).is_err());
    }

    #[test]
    fn decode_roundtrip_short() {
        let mut map = HashMap::new();
        map.insert("active".to_string(), "true".to_string());
        map.insert("entry_price".to_string(), "200".to_string());
        map.insert("contracts_amount".to_string(), "4".to_string());
        map.insert("trailing_offset".to_string(), "0.98".to_string());
        map.insert("lowest_price".to_string(), "195".to_string());
        map.insert("trailing_stop_price".to_string(), "195.98".to_string());
        map.insert("sl_order_id".to_string(), String::new());
        map.insert("leverage".to_string(), "10".to_string());
        let record = TrailingStopHandler::decode(PosSide::Short, &map).unwrap();
        assert!(record.active);
        assert!((record.watermark - 195.0).abs() < 1e-9);
        assert!(record.sl_order_id.is_none());
    }
}
