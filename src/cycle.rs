// =============================================================================
// Trading Cycle — one strategy pass per (user, symbol) on a fixed cadence
// =============================================================================
//
// The scheduler spawns one cycle task per started (user, symbol). Each pass
// takes the single-flight cycle lock, pulls market data, asks the strategy
// for a decision, executes it through the gateway, and hands the TP/SL graph
// to the reconcile engine. The stop signal is checked between steps; task
// revocation aborts at any await point, and teardown always releases the
// pooled client and the cycle lock.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::indicators::atr::calculate_atr;
use crate::monitor::notify::Notifier;
use crate::okx::types::OrderRequest;
use crate::okx::{ClientPool, OkxClient};
use crate::position::{Position, PositionRepo};
use crate::settings::{DualSideSettings, Settings, SettingsRepo};
use crate::store::{keys, Store};
use crate::strategy::{self, Decision};
use crate::tpsl::{ReconcileContext, TpSlEngine};
use crate::types::{EventCategory, PosSide};

/// Seconds between strategy passes.
const CYCLE_INTERVAL_SECS: u64 = 30;
/// Single-flight lock TTL; must outlive one pass.
const CYCLE_LOCK_TTL_SECS: u64 = 55;
/// Candle history pulled per pass.
const CANDLE_LIMIT: u32 = 100;
/// Contract lot step assumed for sizing (linear USDT swaps).
const LOT_SIZE: f64 = 1.0;

/// Everything one cycle task needs, injected by the scheduler.
#[derive(Clone)]
pub struct CycleDeps {
    pub store: Store,
    pub pool: Arc<ClientPool>,
    pub settings: SettingsRepo,
    pub positions: PositionRepo,
    pub tpsl: Arc<TpSlEngine>,
    pub notifier: Arc<Notifier>,
}

/// Long-running cycle body. Returns when the stop signal is observed.
pub async fn run_cycle(deps: CycleDeps, uid: String, symbol: String, timeframe: String) {
    info!(uid, symbol, timeframe, "cycle task started");
    let mut ticker = tokio::time::interval(Duration::from_secs(CYCLE_INTERVAL_SECS));

    loop {
        ticker.tick().await;

        match stop_requested(&deps.store, &uid).await {
            Ok(true) => {
                info!(uid, symbol, "stop signal observed — cycle exiting");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(uid, symbol, error = %e, "stop-signal read failed — continuing");
            }
        }

        if let Err(e) = run_pass(&deps, &uid, &symbol, &timeframe).await {
            match e {
                // Fatal kinds stop the cycle and flip the status to error.
                EngineError::Auth(_) | EngineError::Config(_) => {
                    warn!(uid, symbol, error = %e, "fatal cycle error — stopping");
                    let _ = deps
                        .store
                        .set(&keys::symbol_status(&uid, &symbol), "error")
                        .await;
                    deps.notifier
                        .notify(
                            &uid,
                            Some(&symbol),
                            "cycle_fatal",
                            EventCategory::Error,
                            &format!("{symbol} trading stopped: {e}"),
                        )
                        .await;
                    return;
                }
                other => {
                    warn!(uid, symbol, error = %other, "cycle pass failed — next tick retries");
                }
            }
        }
    }
}

async fn stop_requested(store: &Store, uid: &str) -> EngineResult<bool> {
    // The scheduler writes the stop signal under both key forms; the uid
    // form is authoritative here.
    Ok(matches!(
        store.get(&keys::stop_signal(uid)).await?.as_deref(),
        Some("true")
    ))
}

async fn run_pass(
    deps: &CycleDeps,
    uid: &str,
    symbol: &str,
    timeframe: &str,
) -> EngineResult<()> {
    // Single-flight: one concurrent cycle body per (uid, symbol, timeframe).
    let lock_key = keys::cycle_lock(uid, symbol, timeframe);
    if !deps
        .store
        .set_nx_ex(&lock_key, "1", CYCLE_LOCK_TTL_SECS)
        .await?
    {
        debug!(uid, symbol, "cycle lock held — skipping pass");
        return Ok(());
    }

    let handle = deps.pool.acquire(uid).await?;
    let result = run_pass_locked(deps, uid, symbol, timeframe, &handle.client).await;

    // Teardown runs even when the pass failed: the client returns to the
    // pool and the lock is released.
    deps.pool.release(handle).await;
    if let Err(e) = deps.store.del(&lock_key).await {
        warn!(uid, symbol, error = %e, "cycle lock release failed (TTL will clear it)");
    }
    result
}

async fn run_pass_locked(
    deps: &CycleDeps,
    uid: &str,
    symbol: &str,
    timeframe: &str,
    client: &OkxClient,
) -> EngineResult<()> {
    let settings = deps.settings.get(uid).await?;
    let dual = deps.settings.get_dual_side(uid).await?;

    let mut candles = client.get_candles(symbol, timeframe, CANDLE_LIMIT).await?;
    candles.reverse(); // wire order is newest first
    let mut trend_candles = if settings.use_trend_logic || settings.use_trend_close {
        client
            .get_candles(symbol, &settings.trend_timeframe, CANDLE_LIMIT)
            .await?
    } else {
        Vec::new()
    };
    trend_candles.reverse();

    let current_price = client.get_ticker(symbol).await?;
    let atr = calculate_atr(&candles, settings.rsi_length as usize);

    let position_long = deps.positions.fetch(uid, symbol, PosSide::Long).await?;
    let position_short = deps.positions.fetch(uid, symbol, PosSide::Short).await?;

    let decision = strategy::evaluate(
        &settings,
        &candles,
        &trend_candles,
        position_long.as_ref(),
        position_short.as_ref(),
        current_price,
        atr,
    );

    match decision {
        Decision::Hold => Ok(()),
        Decision::Enter(side) => {
            open_entry(deps, uid, symbol, side, &settings, &dual, client, current_price, atr)
                .await
        }
        Decision::AddEntry(side) => {
            let position = match side {
                PosSide::Long => position_long,
                PosSide::Short => position_short,
            };
            let Some(position) = position else {
                return Ok(());
            };
            add_entry(
                deps, uid, symbol, &position, &settings, &dual, client, current_price, atr,
            )
            .await
        }
        Decision::TrendClose(side) => {
            close_side(deps, uid, symbol, side, client, "trend_close").await
        }
    }
}

/// Contracts bought for one entry, derived from the investment settings.
fn entry_contracts(settings: &Settings, symbol: &str, price: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    let investment = settings.investment_for(symbol) * settings.entry_multiplier;
    let notional = match settings.entry_amount_option.as_str() {
        "contracts" => return (investment / LOT_SIZE).floor() * LOT_SIZE,
        _ => investment * settings.leverage as f64,
    };
    ((notional / price) / LOT_SIZE).floor() * LOT_SIZE
}

#[allow(clippy::too_many_arguments)]
async fn open_entry(
    deps: &CycleDeps,
    uid: &str,
    symbol: &str,
    side: PosSide,
    settings: &Settings,
    dual: &DualSideSettings,
    client: &OkxClient,
    current_price: f64,
    atr: Option<f64>,
) -> EngineResult<()> {
    if deps.positions.in_cooldown(uid, symbol, side).await? {
        debug!(uid, symbol, %side, "re-entry suppressed by cooldown");
        return Ok(());
    }

    let contracts = entry_contracts(settings, symbol, current_price);
    if contracts < LOT_SIZE {
        warn!(uid, symbol, %side, "investment too small for one contract — skipping entry");
        return Ok(());
    }

    if let Err(e) = client.set_leverage(symbol, settings.leverage, side).await {
        // Leverage rejection is non-fatal; the account keeps its prior value.
        warn!(uid, symbol, error = %e, "set-leverage failed");
    }

    let request = OrderRequest::market_open(symbol, side, contracts);
    let ack = client.create_order(&request).await?;
    info!(uid, symbol, %side, contracts, order_id = %ack.order_id, "entry order placed");

    // Use the exchange's own numbers for the row: avg fill price and size.
    let live = client
        .fetch_positions(&[symbol])
        .await?
        .into_iter()
        .find(|p| p.pos_side == side);
    let (entry_price, live_contracts, leverage) = match live {
        Some(p) => (p.avg_entry_price, p.contracts, p.leverage),
        None => (current_price, contracts, settings.leverage as f64),
    };

    deps.positions
        .create(
            uid,
            symbol,
            side,
            entry_price,
            live_contracts,
            live_contracts * LOT_SIZE,
            leverage,
            false,
            side,
        )
        .await?;

    deps.notifier
        .notify(
            uid,
            Some(symbol),
            "entry_execution",
            EventCategory::Entry,
            &format!("{symbol} {side} entry: {live_contracts} contracts at {entry_price}"),
        )
        .await;

    let ctx = ReconcileContext::initial(LOT_SIZE, atr);
    deps.tpsl
        .reconcile(client, uid, symbol, side, settings, dual, &ctx)
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn add_entry(
    deps: &CycleDeps,
    uid: &str,
    symbol: &str,
    position: &Position,
    settings: &Settings,
    dual: &DualSideSettings,
    client: &OkxClient,
    current_price: f64,
    atr: Option<f64>,
) -> EngineResult<()> {
    let side = position.side;
    let contracts = entry_contracts(settings, symbol, current_price);
    if contracts < LOT_SIZE {
        return Ok(());
    }

    let request = OrderRequest::market_open(symbol, side, contracts);
    let ack = client.create_order(&request).await?;
    info!(uid, symbol, %side, contracts, order_id = %ack.order_id, "DCA order placed");

    let live = client
        .fetch_positions(&[symbol])
        .await?
        .into_iter()
        .find(|p| p.pos_side == side);
    let (new_entry, new_contracts) = match live {
        Some(p) => (p.avg_entry_price, p.contracts),
        None => (position.entry_price, position.contracts_amount + contracts),
    };

    let dca_count = deps
        .positions
        .record_dca(
            uid,
            symbol,
            side,
            new_entry,
            current_price,
            new_contracts,
            new_contracts * LOT_SIZE,
        )
        .await?;

    deps.notifier
        .notify(
            uid,
            Some(symbol),
            "dca_execution",
            EventCategory::Entry,
            &format!(
                "{symbol} {side} DCA #{dca_count}: +{contracts} contracts, new avg {new_entry}"
            ),
        )
        .await;

    // Replace the TP/SL graph against the new average.
    let ctx = ReconcileContext::dca(LOT_SIZE, atr);
    deps.tpsl
        .reconcile(client, uid, symbol, side, settings, dual, &ctx)
        .await?;

    // Dual-side hedge arms once the DCA count reaches its trigger.
    if dual.use_dual_side_entry && dca_count >= dual.dual_side_entry_trigger {
        if let Err(e) = open_hedge(
            deps, uid, symbol, side, dual, settings, client, current_price, new_contracts,
        )
        .await
        {
            warn!(uid, symbol, error = %e, "hedge entry failed");
        }
    }
    Ok(())
}

/// Open the opposite-side hedge and place its one-TP graph.
#[allow(clippy::too_many_arguments)]
async fn open_hedge(
    deps: &CycleDeps,
    uid: &str,
    symbol: &str,
    main_side: PosSide,
    dual: &DualSideSettings,
    settings: &Settings,
    client: &OkxClient,
    current_price: f64,
    main_contracts: f64,
) -> EngineResult<()> {
    let hedge_side = main_side.flip();

    // Only one hedge at a time.
    if deps.positions.fetch(uid, symbol, hedge_side).await?.is_some() {
        return Ok(());
    }

    let contracts = match dual.dual_side_entry_ratio_type.as_str() {
        "percent_of_position" => {
            ((main_contracts * dual.dual_side_entry_ratio_value / 100.0) / LOT_SIZE).floor()
                * LOT_SIZE
        }
        _ => (dual.dual_side_entry_ratio_value / LOT_SIZE).floor() * LOT_SIZE,
    };
    if contracts < LOT_SIZE {
        debug!(uid, symbol, "hedge size below one lot — skipped");
        return Ok(());
    }

    let request = OrderRequest::market_open(symbol, hedge_side, contracts);
    client.create_order(&request).await?;

    let live = client
        .fetch_positions(&[symbol])
        .await?
        .into_iter()
        .find(|p| p.pos_side == hedge_side);
    let (entry_price, live_contracts) = match live {
        Some(p) => (p.avg_entry_price, p.contracts),
        None => (current_price, contracts),
    };

    deps.positions
        .create(
            uid,
            symbol,
            hedge_side,
            entry_price,
            live_contracts,
            live_contracts * LOT_SIZE,
            settings.leverage as f64,
            true,
            main_side,
        )
        .await?;

    // Hedge TP/SL prices are percent offsets from the hedge entry.
    let tp_distance = entry_price * dual.dual_side_entry_tp_value / 100.0;
    let sl_distance = entry_price * dual.dual_side_entry_sl_value / 100.0;
    let (hedge_tp, hedge_sl) = match hedge_side {
        PosSide::Long => (entry_price + tp_distance, entry_price - sl_distance),
        PosSide::Short => (entry_price - tp_distance, entry_price + sl_distance),
    };

    let ctx = ReconcileContext {
        is_hedge: true,
        hedge_tp: Some(hedge_tp),
        hedge_sl: Some(hedge_sl),
        lot_size: LOT_SIZE,
        ..Default::default()
    };
    deps.tpsl
        .reconcile(client, uid, symbol, hedge_side, settings, dual, &ctx)
        .await?;

    deps.notifier
        .notify(
            uid,
            Some(symbol),
            "hedge_entry",
            EventCategory::Entry,
            &format!("{symbol} {hedge_side} hedge opened: {live_contracts} contracts at {entry_price}"),
        )
        .await;
    Ok(())
}

/// Market-close a side and tear down its artefacts.
async fn close_side(
    deps: &CycleDeps,
    uid: &str,
    symbol: &str,
    side: PosSide,
    client: &OkxClient,
    reason: &str,
) -> EngineResult<()> {
    let Some(position) = deps.positions.fetch(uid, symbol, side).await? else {
        return Ok(());
    };

    // Cancel exits before the close so nothing re-fires on the flat side.
    for order_id in &position.tp_order_ids {
        match client.cancel_order(order_id, symbol).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => warn!(uid, symbol, order_id, error = %e, "TP cancel on close failed"),
        }
    }
    match client
        .cancel_all_algo(symbol, Some(side), crate::tpsl::SL_ALGO_TYPE)
        .await
    {
        Ok(_) | Err(EngineError::NotFound(_)) => {}
        Err(e) => warn!(uid, symbol, error = %e, "SL cancel on close failed"),
    }

    let live = client
        .fetch_positions(&[symbol])
        .await?
        .into_iter()
        .find(|p| p.pos_side == side);
    if let Some(live_pos) = live {
        let request = OrderRequest::market_close(symbol, side, live_pos.contracts);
        client.create_order(&request).await?;
    }

    let settings = deps.settings.get(uid).await?;
    deps.notifier.clear_side(uid, symbol, side);
    deps.positions.clear_side(uid, symbol, side, reason).await?;
    if settings.use_cooldown {
        deps.positions
            .set_cooldown(uid, symbol, side, settings.cooldown_time)
            .await?;
    }

    deps.notifier
        .notify(
            uid,
            Some(symbol),
            "position_close",
            EventCategory::Exit,
            &format!("{symbol} {side} closed ({reason})"),
        )
        .await;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_contracts_usdt_mode() {
        let settings = Settings::default(); // 20 USDT, 10x leverage
        // 20 * 10 / 100 = 2 contracts.
        assert!((entry_contracts(&settings, "BTC-USDT-SWAP", 100.0) - 2.0).abs() < 1e-9);
        // Price too high for one contract: zero.
        assert!((entry_contracts(&settings, "BTC-USDT-SWAP", 500.0) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn entry_contracts_contract_mode() {
        let mut settings = Settings::default();
        settings.entry_amount_option = "contracts".into();
        settings.btc_investment = 7.0;
        assert!((entry_contracts(&settings, "BTC-USDT-SWAP", 123.0) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn entry_contracts_guards_zero_price() {
        let settings = Settings::default();
        assert!((entry_contracts(&settings, "BTC-USDT-SWAP", 0.0) - 0.0).abs() < 1e-9);
    }
}
