// =============================================================================
// TP/SL Engine — keeps the derived order graph consistent with the position
// =============================================================================
//
// One reconcile call owns the whole graph transition: initial placement, the
// cancel-then-replace DCA path, and the single-TP hedge path. A short-TTL
// store lock serialises concurrent reconciliations for the same side so two
// callers can never double-place. On DCA, every cancellation is preceded by
// a just-in-time exchange query: an order that filled inside the race window
// is processed as a normal fill exactly once, not reported as a cancel.
// =============================================================================

pub mod pricing;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::monitor::notify::Notifier;
use crate::monitor::orders::{MonitoredOrder, OrderRows};
use crate::okx::types::OrderRequest;
use crate::okx::OkxClient;
use crate::position::{Position, PositionRepo, TpLeg};
use crate::settings::{DualSideSettings, Settings};
use crate::store::{keys, Store};
use crate::types::{EventCategory, OrderKind, OrderState, PosSide};

/// TTL of the per-side reconcile lock.
const RECONCILE_LOCK_TTL_SECS: u64 = 30;
/// Algo order type used for stop losses.
pub const SL_ALGO_TYPE: &str = "trigger";

/// Inputs beyond the position snapshot itself.
#[derive(Debug, Clone, Default)]
pub struct ReconcileContext {
    pub is_dca: bool,
    pub is_hedge: bool,
    pub atr: Option<f64>,
    pub current_price: Option<f64>,
    pub hedge_tp: Option<f64>,
    pub hedge_sl: Option<f64>,
    /// Exchange lot step for the instrument; sizes are floored to this.
    pub lot_size: f64,
}

impl ReconcileContext {
    pub fn initial(lot_size: f64, atr: Option<f64>) -> Self {
        Self {
            lot_size,
            atr,
            ..Self::default()
        }
    }

    pub fn dca(lot_size: f64, atr: Option<f64>) -> Self {
        Self {
            is_dca: true,
            lot_size,
            atr,
            ..Self::default()
        }
    }
}

/// What a reconcile pass actually did.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Another reconcile held the lock; nothing was done.
    pub skipped: bool,
    pub tp_order_ids: Vec<String>,
    pub sl_order_id: Option<String>,
    /// TP levels that turned out to be filled during the DCA race window.
    pub race_fills: Vec<u8>,
}

pub struct TpSlEngine {
    store: Store,
    positions: PositionRepo,
    orders: OrderRows,
    notifier: Arc<Notifier>,
}

impl TpSlEngine {
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

    /// Reconcile the TP/SL order graph for one side.
    pub async fn reconcile(
        &self,
        client: &OkxClient,
        uid: &str,
        symbol: &str,
        side: PosSide,
        settings: &Settings,
        dual: &DualSideSettings,
        ctx: &ReconcileContext,
    ) -> EngineResult<ReconcileOutcome> {
        let lock_key = keys::reconcile_lock(uid, symbol);
        if !self
            .store
            .set_nx_ex(&lock_key, "1", RECONCILE_LOCK_TTL_SECS)
            .await?
        {
            debug!(uid, symbol, %side, "reconcile already in flight — skipping");
            return Ok(ReconcileOutcome {
                skipped: true,
                ..Default::default()
            });
        }

        let result = self
            .reconcile_locked(client, uid, symbol, side, settings, dual, ctx)
            .await;

        if let Err(e) = self.store.del(&lock_key).await {
            warn!(uid, symbol, error = %e, "reconcile lock release failed (TTL will clear it)");
        }
        result
    }

    async fn reconcile_locked(
        &self,
        client: &OkxClient,
        uid: &str,
        symbol: &str,
        side: PosSide,
        settings: &Settings,
        dual: &DualSideSettings,
        ctx: &ReconcileContext,
    ) -> EngineResult<ReconcileOutcome> {
        let mut position = self
            .positions
            .fetch(uid, symbol, side)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("position {uid}/{symbol}/{side}")))?;

        if ctx.is_hedge {
            return self.place_hedge_graph(client, &position, dual, ctx).await;
        }

        let mut race_fills = Vec::new();

        if ctx.is_dca {
            race_fills = self.teardown_existing(client, &position).await?;
            self.positions.clear_tp_sl_fields(uid, symbol, side).await?;

            // Fresh average entry and size after the DCA fill.
            if let Some(check) = self.positions.fetch_live(uid, symbol, side, client).await? {
                position = check.position;
            }
        } else if !position.tp_order_ids.is_empty() {
            // Graph already placed; a repeated call must not duplicate it.
            debug!(uid, symbol, %side, "TP graph already present — reconcile is a no-op");
            return Ok(ReconcileOutcome {
                skipped: false,
                tp_order_ids: position.tp_order_ids.clone(),
                sl_order_id: position.sl_order_id.clone(),
                race_fills,
            });
        }

        let mut outcome = self
            .place_graph(client, &position, settings, ctx)
            .await?;
        outcome.race_fills = race_fills;
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // DCA teardown
    // -------------------------------------------------------------------------

    /// Cancel the existing TP and SL orders, checking each for a fill that
    /// landed inside the race window first. Returns the TP levels that were
    /// actually filled.
    async fn teardown_existing(
        &self,
        client: &OkxClient,
        position: &Position,
    ) -> EngineResult<Vec<u8>> {
        let uid = &position.uid;
        let symbol = &position.symbol;
        let side = position.side;
        let mut race_fills = Vec::new();

        for order_id in &position.tp_order_ids {
            let level = position
                .tp_data
                .iter()
                .find(|e| e.order_id.as_deref() == Some(order_id))
                .map(|e| e.level)
                .unwrap_or(0);

            let fill = match client.fetch_order(order_id, symbol, false).await {
                Ok(details) => OrderState::parse(&details.state)
                    .map(|s| (s, details.update_time_ms, details.avg_fill_price))
                    .filter(|(s, _, _)| *s == OrderState::Filled),
                Err(EngineError::NotFound(_)) => None,
                Err(e) => {
                    warn!(uid, symbol, order_id, error = %e, "pre-cancel fetch failed");
                    None
                }
            };

            let row = self.orders.fetch(uid, symbol, order_id).await?;

            if let Some((_, fill_time_ms, fill_price)) = fill {
                // The cancel raced a real fill: process it exactly once.
                let first = self
                    .positions
                    .mark_tp_filled(uid, symbol, side, level)
                    .await?;
                if first && level > 0 {
                    race_fills.push(level);
                    self.notifier
                        .notify_tp_fill(
                            uid,
                            symbol,
                            side,
                            level,
                            &format!("{symbol} tp{level} filled at {fill_price}"),
                            fill_time_ms,
                        )
                        .await;
                }
                if let Some(row) = row {
                    self.orders.archive(&row, OrderState::Filled).await?;
                }
                continue;
            }

            match client.cancel_order(order_id, symbol).await {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(e) => {
                    warn!(uid, symbol, order_id, error = %e, "TP cancel failed — monitor will repair");
                }
            }
            if let Some(row) = row {
                self.orders.archive(&row, OrderState::Canceled).await?;
            }
        }

        if let Some(sl_id) = &position.sl_order_id {
            let row = self.orders.fetch(uid, symbol, sl_id).await?;
            let filled = match client.fetch_order(sl_id, symbol, true).await {
                Ok(details) => {
                    OrderState::parse(&details.state) == Some(OrderState::Filled)
                }
                Err(EngineError::NotFound(_)) => false,
                Err(e) => {
                    warn!(uid, symbol, sl_id, error = %e, "pre-cancel SL fetch failed");
                    false
                }
            };

            if filled {
                self.notifier
                    .notify(
                        uid,
                        Some(symbol),
                        "sl_execution",
                        EventCategory::Sl,
                        &format!("{symbol} {side} stop loss filled during replacement"),
                    )
                    .await;
                if let Some(row) = row {
                    self.orders.archive(&row, OrderState::Filled).await?;
                }
            } else {
                match client
                    .cancel_algo_orders(std::slice::from_ref(sl_id), symbol)
                    .await
                {
                    Ok(()) | Err(EngineError::NotFound(_)) => {}
                    Err(e) => {
                        warn!(uid, symbol, sl_id, error = %e, "SL cancel failed — monitor will repair");
                    }
                }
                if let Some(row) = row {
                    self.orders.archive(&row, OrderState::Canceled).await?;
                }
            }
        }

        Ok(race_fills)
    }

    // -------------------------------------------------------------------------
    // Initial placement
    // -------------------------------------------------------------------------

    async fn place_graph(
        &self,
        client: &OkxClient,
        position: &Position,
        settings: &Settings,
        ctx: &ReconcileContext,
    ) -> EngineResult<ReconcileOutcome> {
        let uid = &position.uid;
        let symbol = &position.symbol;
        let side = position.side;
        let lot = if ctx.lot_size > 0.0 { ctx.lot_size } else { 1.0 };

        let prices = pricing::compute_tp_prices(position.entry_price, settings, side, ctx.atr);

        // Trailing activation caps how many TPs go live: once the trailing
        // stop takes over at tpK, later levels stay inactive in tp_data.
        let cap = if settings.trailing_stop_active {
            settings.trailing_start_point.level()
        } else {
            3
        };

        let active_levels: Vec<(u8, f64)> = (1..=3u8)
            .filter(|l| settings.tp_enabled(*l) && *l <= cap)
            .map(|l| (l, settings.tp_ratio(l)))
            .collect();

        let slices = pricing::split_tp_sizes(position.contracts_amount, &active_levels, lot);

        let mut legs: Vec<TpLeg> = Vec::with_capacity(3);
        let mut tp_order_ids = Vec::with_capacity(slices.len());
        let mut placed: std::collections::HashSet<u8> = Default::default();

        for (level, contracts) in &slices {
            let price = prices[(*level - 1) as usize];
            let request = OrderRequest::take_profit(symbol, side, price, *contracts);
            match client.create_order(&request).await {
                Ok(ack) => {
                    let kind = OrderKind::tp(*level).unwrap_or(OrderKind::Limit);
                    let row = MonitoredOrder::new(
                        uid,
                        symbol,
                        &ack.order_id,
                        kind,
                        side,
                        price,
                        *contracts,
                        position.position_qty,
                        position.is_hedge,
                    );
                    self.orders.upsert(&row).await?;
                    tp_order_ids.push(ack.order_id.clone());
                    legs.push(TpLeg {
                        level: *level,
                        price,
                        contracts: *contracts,
                        order_id: Some(ack.order_id),
                        active: true,
                    });
                    placed.insert(*level);
                    info!(uid, symbol, %side, level, price, contracts, "TP placed");
                }
                Err(e) => {
                    // Partial graph is fine: what is stored can be repaired
                    // by the next monitor tick or reconcile call.
                    warn!(uid, symbol, %side, level, error = %e, "TP placement failed — stopping graph build");
                    break;
                }
            }
        }

        // Inactive entries for levels the trailing cap or dust excluded.
        for level in 1..=3u8 {
            if placed.contains(&level) {
                continue;
            }
            legs.push(TpLeg {
                level,
                price: prices[(level - 1) as usize],
                contracts: 0.0,
                order_id: None,
                active: false,
            });
        }
        legs.sort_by_key(|l| l.level);

        self.positions
            .set_tp_graph(uid, symbol, side, &legs)
            .await?;

        // Stop loss.
        let mut sl_order_id = None;
        if settings.use_sl {
            let skip_for_last_dca = settings.use_sl_on_last
                && position.dca_count + 1 < settings.pyramiding_limit;
            if skip_for_last_dca {
                debug!(
                    uid, symbol, %side,
                    dca_count = position.dca_count,
                    "SL deferred until last DCA entry"
                );
            } else {
                let sl_price =
                    pricing::compute_sl_price(position.entry_price, settings, side, ctx.atr);
                let request =
                    OrderRequest::stop_loss(symbol, side, sl_price, position.contracts_amount);
                match client.create_order(&request).await {
                    Ok(ack) => {
                        self.positions
                            .set_sl(uid, symbol, side, sl_price, &ack.order_id, position.contracts_amount)
                            .await?;
                        let row = MonitoredOrder::new(
                            uid,
                            symbol,
                            &ack.order_id,
                            OrderKind::Sl,
                            side,
                            sl_price,
                            position.contracts_amount,
                            position.position_qty,
                            position.is_hedge,
                        );
                        self.orders.upsert(&row).await?;
                        info!(uid, symbol, %side, sl_price, "SL placed");
                        sl_order_id = Some(ack.order_id);
                    }
                    Err(e) => {
                        warn!(uid, symbol, %side, error = %e, "SL placement failed");
                    }
                }
            }
        }

        Ok(ReconcileOutcome {
            skipped: false,
            tp_order_ids,
            sl_order_id,
            race_fills: Vec::new(),
        })
    }

    // -------------------------------------------------------------------------
    // Hedge placement
    // -------------------------------------------------------------------------

    /// Hedge side gets exactly one TP for the full contracts amount, and an
    /// SL only when dual-side SL is enabled.
    async fn place_hedge_graph(
        &self,
        client: &OkxClient,
        position: &Position,
        dual: &DualSideSettings,
        ctx: &ReconcileContext,
    ) -> EngineResult<ReconcileOutcome> {
        let uid = &position.uid;
        let symbol = &position.symbol;
        let side = position.side;

        // A repeated hedge reconcile must not double-place the single TP.
        if !position.tp_order_ids.is_empty() {
            debug!(uid, symbol, %side, "hedge graph already present — no-op");
            return Ok(ReconcileOutcome {
                skipped: false,
                tp_order_ids: position.tp_order_ids.clone(),
                sl_order_id: position.sl_order_id.clone(),
                race_fills: Vec::new(),
            });
        }

        let tp_price = ctx.hedge_tp.ok_or_else(|| {
            EngineError::Invariant("hedge reconcile requires hedge_tp".into())
        })?;

        let request =
            OrderRequest::take_profit(symbol, side, tp_price, position.contracts_amount);
        let ack = client.create_order(&request).await?;
        let row = MonitoredOrder::new(
            uid,
            symbol,
            &ack.order_id,
            OrderKind::Tp1,
            side,
            tp_price,
            position.contracts_amount,
            position.position_qty,
            true,
        );
        self.orders.upsert(&row).await?;
        let legs = vec![TpLeg {
            level: 1,
            price: tp_price,
            contracts: position.contracts_amount,
            order_id: Some(ack.order_id.clone()),
            active: true,
        }];
        self.positions
            .set_tp_graph(uid, symbol, side, &legs)
            .await?;

        let mut sl_order_id = None;
        if dual.sl_enabled() {
            if let Some(sl_price) = ctx.hedge_sl {
                let request =
                    OrderRequest::stop_loss(symbol, side, sl_price, position.contracts_amount);
                match client.create_order(&request).await {
                    Ok(sl_ack) => {
                        self.positions
                            .set_sl(
                                uid,
                                symbol,
                                side,
                                sl_price,
                                &sl_ack.order_id,
                                position.contracts_amount,
                            )
                            .await?;
                        let sl_row = MonitoredOrder::new(
                            uid,
                            symbol,
                            &sl_ack.order_id,
                            OrderKind::Sl,
                            side,
                            sl_price,
                            position.contracts_amount,
                            position.position_qty,
                            true,
                        );
                        self.orders.upsert(&sl_row).await?;
                        sl_order_id = Some(sl_ack.order_id);
                    }
                    Err(e) => warn!(uid, symbol, %side, error = %e, "hedge SL placement failed"),
                }
            }
        }

        info!(uid, symbol, %side, tp_price, "hedge TP graph placed");
        Ok(ReconcileOutcome {
            skipped: false,
            tp_order_ids: vec![ack.order_id],
            sl_order_id,
            race_fills: Vec::new(),
        })
    }
}

impl std::fmt::Debug for TpSlEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpSlEngine").finish()
    }
}
