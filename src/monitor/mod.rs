// =============================================================================
// Monitor Loop — reconciles local order state against the exchange
// =============================================================================
//
// One process-wide loop ticking every 2 seconds. Poll pressure is shaped by
// cadence rules (full sweep every 15 s, open-order heartbeat every 5th
// iteration, TP sweep every 2nd iteration, price-proximity and SL-cross
// triggers in between) so the exchange sees the minimum number of fetches
// that still catches every transition quickly.
//
// Every per-user and per-symbol section is isolated: a failure there logs
// and advances to the next. The outer supervisor restarts the whole loop
// with exponential backoff, giving up after 10 attempts.
// =============================================================================

pub mod notify;
pub mod orders;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::identity::IdentityResolver;
use crate::journal::{Journal, LogEntry};
use crate::okx::types::OrderRequest;
use crate::okx::{ClientPool, OkxClient};
use crate::position::PositionRepo;
use crate::settings::SettingsRepo;
use crate::store::cache::CacheClass;
use crate::store::{keys, Store};
use crate::tpsl::{ReconcileContext, TpSlEngine, SL_ALGO_TYPE};
use crate::trailing::TrailingStopHandler;
use crate::types::{EventCategory, OrderKind, OrderState, PosSide, TradingStatus};

use notify::Notifier;
use orders::{MonitoredOrder, OrderRows};

/// Base loop iteration.
const TICK_SECS: u64 = 2;
/// Full poll sweep cadence.
const FULL_SWEEP_SECS: u64 = 15;
/// Open-order heartbeat: every 5th iteration.
const OPEN_HEARTBEAT_ITERS: u64 = 5;
/// TP sweep: every 2nd iteration.
const TP_SWEEP_ITERS: u64 = 2;
/// Store health ping interval.
const STORE_PING_SECS: u64 = 30;
/// Memory sample interval and default RSS ceiling.
const MEMORY_CHECK_SECS: u64 = 60;
const DEFAULT_MEMORY_LIMIT_MB: u64 = 512;
/// Orphan / cardinality sweeps.
const SWEEP_INTERVAL_SECS: u64 = 300;
/// Missing-order reconciliation looks this far back.
const MISSING_ORDER_WINDOW_MS: i64 = 3600 * 1000;
/// Delay before a post-fill closure verification.
const CLOSURE_VERIFY_DELAY_SECS: u64 = 2;
/// Supervisor restart ladder.
const SUPERVISOR_MAX_RESTARTS: u32 = 10;
const SUPERVISOR_BACKOFF_BASE_SECS: u64 = 5;
const SUPERVISOR_BACKOFF_CAP_SECS: u64 = 300;

#[derive(Default)]
struct MonitorState {
    iteration: u64,
    last_full_sweep: Option<Instant>,
    /// Whether the current tick is a 15 s full poll sweep.
    full_sweep_tick: bool,
    last_store_ping: Option<Instant>,
    last_memory_check: Option<Instant>,
    /// Previous open-order count per (uid, symbol).
    open_counts: HashMap<(String, String), usize>,
    /// Last observed status per order id.
    order_statuses: HashMap<String, OrderState>,
    /// Last orphan/cardinality sweep per uid.
    last_orphan_sweep: HashMap<String, Instant>,
}

/// Collaborators the monitor drives. Everything is injected; the loop owns
/// no state beyond its own bookkeeping.
pub struct MonitorLoop {
    store: Store,
    identity: Arc<IdentityResolver>,
    pool: Arc<ClientPool>,
    settings: SettingsRepo,
    positions: PositionRepo,
    orders: OrderRows,
    tpsl: Arc<TpSlEngine>,
    trailing: Arc<TrailingStopHandler>,
    notifier: Arc<Notifier>,
    journal: Journal,
    state: Mutex<MonitorState>,
    memory_limit_mb: u64,
}

impl MonitorLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        identity: Arc<IdentityResolver>,
        pool: Arc<ClientPool>,
        settings: SettingsRepo,
        positions: PositionRepo,
        orders: OrderRows,
        tpsl: Arc<TpSlEngine>,
        trailing: Arc<TrailingStopHandler>,
        notifier: Arc<Notifier>,
        journal: Journal,
    ) -> Arc<Self> {
        let memory_limit_mb = std::env::var("HELIOS_MEMORY_LIMIT_MB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MEMORY_LIMIT_MB);
        Arc::new(Self {
            store,
            identity,
            pool,
            settings,
            positions,
            orders,
            tpsl,
            trailing,
            notifier,
            journal,
            state: Mutex::new(MonitorState::default()),
            memory_limit_mb,
        })
    }

    /// Supervised entry point. Runs forever; exits the process only after
    /// the restart budget is exhausted.
    pub async fn run_supervised(self: Arc<Self>) {
        let mut restarts: u32 = 0;
        loop {
            info!("monitor loop starting");
            match tokio::spawn(self.clone().run_inner()).await {
                Ok(()) => {
                    // run_inner never returns normally.
                    warn!("monitor loop returned unexpectedly");
                }
                Err(e) => {
                    error!(error = %e, "monitor loop panicked");
                }
            }

            restarts += 1;
            if restarts > SUPERVISOR_MAX_RESTARTS {
                error!(restarts, "monitor restart budget exhausted — exiting");
                self.journal
                    .record(LogEntry::new(
                        "system",
                        "monitor_terminated",
                        EventCategory::Error,
                        "monitor loop exceeded max restarts",
                    ))
                    .await;
                std::process::exit(1);
            }
            let delay = (SUPERVISOR_BACKOFF_BASE_SECS * 2u64.pow(restarts.saturating_sub(1)))
                .min(SUPERVISOR_BACKOFF_CAP_SECS);
            warn!(restarts, delay_secs = delay, "restarting monitor loop");
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
    }

    async fn run_inner(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(TICK_SECS));
        loop {
            ticker.tick().await;
            self.health_checks().await;

            // The 15 s full sweep applies to every symbol in this tick.
            {
                let mut state = self.state.lock();
                let due = state
                    .last_full_sweep
                    .map(|t| t.elapsed().as_secs() >= FULL_SWEEP_SECS)
                    .unwrap_or(true);
                if due {
                    state.last_full_sweep = Some(Instant::now());
                }
                state.full_sweep_tick = due;
            }

            let users = match self.running_users().await {
                Ok(users) => users,
                Err(e) => {
                    warn!(error = %e, "running-user scan failed — skipping tick");
                    continue;
                }
            };

            for uid in users {
                if let Err(e) = self.process_user(&uid).await {
                    warn!(uid, error = %e, "user monitor section failed — continuing");
                }
            }

            self.notifier.advance_tick().await;
            self.state.lock().iteration += 1;
        }
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    async fn health_checks(&self) {
        let (ping_due, memory_due) = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let ping_due = state
                .last_store_ping
                .map(|t| now.duration_since(t).as_secs() >= STORE_PING_SECS)
                .unwrap_or(true);
            if ping_due {
                state.last_store_ping = Some(now);
            }
            let memory_due = state
                .last_memory_check
                .map(|t| now.duration_since(t).as_secs() >= MEMORY_CHECK_SECS)
                .unwrap_or(true);
            if memory_due {
                state.last_memory_check = Some(now);
            }
            (ping_due, memory_due)
        };

        if ping_due {
            if let Err(e) = self.store.ping().await {
                warn!(error = %e, "store ping failed — connection manager will re-dial");
            }
        }

        if memory_due {
            let rss_mb = resident_memory_mb();
            if rss_mb > self.memory_limit_mb {
                warn!(
                    rss_mb,
                    limit_mb = self.memory_limit_mb,
                    "resident memory above threshold — dropping caches"
                );
                self.store.cache().sweep();
                self.store.cache().invalidate_prefix("");
                if let Err(e) = self.store.ping().await {
                    warn!(error = %e, "store reconnect ping failed");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // User enumeration
    // -------------------------------------------------------------------------

    async fn running_users(&self) -> EngineResult<Vec<String>> {
        let mut users = HashSet::new();
        for key in self.store.scan_match(keys::symbol_status_pattern()).await? {
            let Some((id, _symbol)) = keys::parse_symbol_status_key(&key) else {
                continue;
            };
            let Some(status) = self.store.get(&key).await? else {
                continue;
            };
            if TradingStatus::parse(&status) != Some(TradingStatus::Running) {
                continue;
            }
            // Chat-id-keyed twins resolve to the uid form during migration.
            let uid = self.identity.resolve_to_uid(&id).await?;
            users.insert(uid);
        }
        Ok(users.into_iter().collect())
    }

    // -------------------------------------------------------------------------
    // Per-user processing
    // -------------------------------------------------------------------------

    async fn process_user(self: &Arc<Self>, uid: &str) -> EngineResult<()> {
        let rows = self.orders.fetch_all(uid).await?;
        let live_rows: Vec<MonitoredOrder> = rows
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect();

        let needs_sweeps = {
            let state = self.state.lock();
            state
                .last_orphan_sweep
                .get(uid)
                .map(|t| t.elapsed().as_secs() >= SWEEP_INTERVAL_SECS)
                .unwrap_or(true)
        };

        if live_rows.is_empty() && !needs_sweeps {
            return Ok(());
        }

        let handle = self.pool.acquire(uid).await?;
        let result = self
            .process_user_with_client(uid, &handle.client, live_rows)
            .await;
        self.pool.release(handle).await;
        result
    }

    async fn process_user_with_client(
        self: &Arc<Self>,
        uid: &str,
        client: &OkxClient,
        live_rows: Vec<MonitoredOrder>,
    ) -> EngineResult<()> {
        // Group rows by symbol; one price fetch per symbol per tick.
        let mut by_symbol: HashMap<String, Vec<MonitoredOrder>> = HashMap::new();
        for row in live_rows {
            by_symbol.entry(row.symbol.clone()).or_default().push(row);
        }

        for (symbol, rows) in by_symbol {
            if let Err(e) = self
                .process_symbol(uid, client, &symbol, rows)
                .await
            {
                warn!(uid, symbol, error = %e, "symbol monitor section failed — continuing");
            }
        }

        self.periodic_sweeps(uid, client).await;
        Ok(())
    }

    async fn process_symbol(
        self: &Arc<Self>,
        uid: &str,
        client: &OkxClient,
        symbol: &str,
        rows: Vec<MonitoredOrder>,
    ) -> EngineResult<()> {
        let current_price = match client.get_ticker(symbol).await {
            Ok(px) => px,
            Err(e) => {
                warn!(uid, symbol, error = %e, "ticker fetch failed — skipping symbol");
                return Ok(());
            }
        };

        // Count drop detection feeds the missing-order reconciliation.
        let open_count = rows.len();
        let previous = {
            let mut state = self.state.lock();
            state
                .open_counts
                .insert((uid.to_string(), symbol.to_string()), open_count)
        };
        if let Some(prev) = previous {
            if open_count < prev {
                let monitor = self.clone();
                let uid = uid.to_string();
                let symbol = symbol.to_string();
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(e) = monitor
                        .reconcile_missing_orders(&uid, &client, &symbol)
                        .await
                    {
                        warn!(uid, symbol, error = %e, "missing-order reconciliation failed");
                    }
                });
            }
        }

        let (iteration, full_sweep) = {
            let state = self.state.lock();
            (state.iteration, state.full_sweep_tick)
        };

        for row in rows {
            let prev_status = self.state.lock().order_statuses.get(&row.order_id).copied();
            if !poll_due(&row, prev_status, current_price, iteration, full_sweep) {
                continue;
            }
            if let Err(e) = self.poll_order(uid, client, &row, current_price).await {
                warn!(
                    uid, symbol,
                    order_id = %row.order_id,
                    error = %e,
                    "order poll failed — continuing"
                );
            }
        }

        // Trailing records tick on every symbol pass.
        for side in [PosSide::Long, PosSide::Short] {
            if let Err(e) = self
                .trailing
                .tick(client, uid, symbol, side, current_price)
                .await
            {
                warn!(uid, symbol, %side, error = %e, "trailing tick failed");
            }
        }

        // Silent-replacement detection rides the full sweep: a position the
        // exchange recreated out-of-band invalidates the stored TP/SL graph,
        // so the engine rebuilds it against the live numbers.
        if full_sweep {
            for side in [PosSide::Long, PosSide::Short] {
                match self.positions.fetch_live(uid, symbol, side, client).await {
                    Ok(Some(check)) if check.silently_replaced => {
                        warn!(uid, symbol, %side, "position silently replaced — rebuilding TP/SL graph");
                        let settings = match self.settings.get(uid).await {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(uid, error = %e, "settings read failed during repair");
                                continue;
                            }
                        };
                        let dual = self
                            .settings
                            .get_dual_side(uid)
                            .await
                            .unwrap_or_default();
                        let ctx = ReconcileContext::dca(1.0, None);
                        if let Err(e) = self
                            .tpsl
                            .reconcile(client, uid, symbol, side, &settings, &dual, &ctx)
                            .await
                        {
                            warn!(uid, symbol, %side, error = %e, "replacement repair failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(uid, symbol, %side, error = %e, "live position check failed");
                    }
                }
            }
        }

        Ok(())
    }

    // (poll cadence rules live in `poll_due` below)

    // -------------------------------------------------------------------------
    // Poll + terminal handling
    // -------------------------------------------------------------------------

    async fn poll_order(
        self: &Arc<Self>,
        uid: &str,
        client: &OkxClient,
        row: &MonitoredOrder,
        current_price: f64,
    ) -> EngineResult<()> {
        let is_algo = row.order_type.is_algo();

        // A 2 s status cache coalesces poll bursts: several cadence rules can
        // pick the same order in back-to-back iterations.
        let status_cache_key = format!("order_status:{}", row.order_id);
        if let Some(cached) = self.store.cache().get(&status_cache_key) {
            if OrderState::parse(&cached) == Some(OrderState::Open) {
                return Ok(());
            }
        }

        let (status, fill_time_ms, filled) =
            match client.fetch_order(&row.order_id, &row.symbol, is_algo).await {
                Ok(details) => {
                    let status = OrderState::parse(&details.state).unwrap_or(OrderState::Open);
                    (status, details.update_time_ms, details.filled_contracts)
                }
                // Not-found is the safe default for a vanished order.
                Err(EngineError::NotFound(_)) => (OrderState::Canceled, 0, 0.0),
                Err(e) => return Err(e),
            };
        self.store
            .cache()
            .put(&status_cache_key, status.as_str(), CacheClass::OrderStatus);

        self.state
            .lock()
            .order_statuses
            .insert(row.order_id.clone(), status);

        if !status.is_terminal() {
            return Ok(());
        }

        self.orders.update_fill(row, status, filled).await?;

        // Last-moment safety poll: a cancel-on-DCA can race an in-flight
        // fill; if the final word is "filled" while we were about to archive
        // a cancel, the fill must be processed now.
        let (final_status, final_fill_time) =
            match client.fetch_order(&row.order_id, &row.symbol, is_algo).await {
                Ok(details) => (
                    OrderState::parse(&details.state).unwrap_or(status),
                    details.update_time_ms,
                ),
                Err(_) => (status, fill_time_ms),
            };

        let effective = if final_status == OrderState::Filled {
            OrderState::Filled
        } else {
            status
        };

        self.orders.archive(row, effective).await?;
        self.state.lock().order_statuses.remove(&row.order_id);

        if effective == OrderState::Filled {
            self.handle_fill(uid, client, row, current_price, final_fill_time)
                .await?;
        }
        Ok(())
    }

    async fn handle_fill(
        self: &Arc<Self>,
        uid: &str,
        client: &OkxClient,
        row: &MonitoredOrder,
        current_price: f64,
        fill_time_ms: i64,
    ) -> EngineResult<()> {
        let symbol = &row.symbol;
        let side = row.position_side;

        match row.order_type {
            OrderKind::Tp1 | OrderKind::Tp2 | OrderKind::Tp3 => {
                let level = row.order_type.tp_level().unwrap_or(1);

                // Exactly-once gate; a concurrent path may have won already.
                let first = self
                    .positions
                    .mark_tp_filled(uid, symbol, side, level)
                    .await?;
                if !first {
                    return Ok(());
                }

                self.notifier
                    .notify_tp_fill(
                        uid,
                        symbol,
                        side,
                        level,
                        &format!(
                            "{symbol} {side} tp{level} filled at {} ({} contracts)",
                            row.price, row.contracts_amount
                        ),
                        fill_time_ms,
                    )
                    .await;

                let settings = self.settings.get(uid).await?;

                // Break-even pipeline.
                if settings.break_even_enabled(level) {
                    if let Err(e) = self
                        .apply_break_even(uid, client, symbol, side, level)
                        .await
                    {
                        warn!(uid, symbol, level, error = %e, "break-even move failed");
                    }
                }

                // Trailing activation at the configured TP level.
                if settings.trailing_stop_active
                    && level == settings.trailing_start_point.level()
                {
                    if let Some(position) = self.positions.fetch(uid, symbol, side).await? {
                        if let Err(e) = self
                            .trailing
                            .activate(uid, symbol, &position, &settings, current_price)
                            .await
                        {
                            warn!(uid, symbol, error = %e, "trailing activation failed");
                        }
                    }
                }

                // TP3 (or all enabled TPs) filled: verify the side closes.
                let position = self.positions.fetch(uid, symbol, side).await?;
                let complete = level == 3
                    || position.as_ref().map(|p| p.all_tps_filled()).unwrap_or(false);
                if complete && !settings.trailing_stop_active {
                    self.schedule_closure_verification(uid, symbol, side, "tp_complete");
                }
            }
            OrderKind::Sl | OrderKind::BreakEven => {
                self.notifier
                    .notify(
                        uid,
                        Some(symbol),
                        "sl_execution",
                        EventCategory::Sl,
                        &format!("{symbol} {side} stop loss filled at {}", row.price),
                    )
                    .await;

                // Trailing state cannot survive an SL fill.
                if let Err(e) = self.trailing.clear(uid, symbol, side).await {
                    warn!(uid, symbol, error = %e, "trailing clear after SL failed");
                }
                self.schedule_closure_verification(uid, symbol, side, "sl_filled");
            }
            OrderKind::Limit | OrderKind::Market => {
                self.notifier
                    .notify(
                        uid,
                        Some(symbol),
                        "order_filled",
                        EventCategory::Entry,
                        &format!("{symbol} {side} {} order filled", row.order_type),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Move the SL to the break-even anchor for the filled level: entry
    /// price after TP1, TP1 price after TP2, TP2 price after TP3.
    async fn apply_break_even(
        self: &Arc<Self>,
        uid: &str,
        client: &OkxClient,
        symbol: &str,
        side: PosSide,
        filled_level: u8,
    ) -> EngineResult<()> {
        let Some(position) = self.positions.fetch(uid, symbol, side).await? else {
            return Ok(());
        };

        let anchor = match filled_level {
            1 => position.entry_price,
            2 => position.tp_prices.first().copied().unwrap_or(position.entry_price),
            _ => position.tp_prices.get(1).copied().unwrap_or(position.entry_price),
        };
        if anchor <= 0.0 {
            return Ok(());
        }

        // Old SL must be gone before the replacement is recorded.
        if let Some(old_id) = &position.sl_order_id {
            match client
                .cancel_algo_orders(std::slice::from_ref(old_id), symbol)
                .await
            {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            if let Some(old_row) = self.orders.fetch(uid, symbol, old_id).await? {
                self.orders.archive(&old_row, OrderState::Canceled).await?;
            }
            self.positions.clear_sl(uid, symbol, side).await?;
        }

        // Size the replacement SL against what the exchange actually still
        // holds; the stored row can lag a partial close.
        let remaining = match client.fetch_positions(&[symbol]).await {
            Ok(live) => live
                .into_iter()
                .find(|p| p.pos_side == side)
                .map(|p| p.contracts)
                .unwrap_or(0.0),
            Err(_) => {
                position.contracts_amount
                    - position
                        .tp_data
                        .iter()
                        .filter(|e| e.status == crate::position::TpStatus::Filled)
                        .map(|e| {
                            position
                                .tp_contracts_amounts
                                .get((e.level - 1) as usize)
                                .copied()
                                .unwrap_or(0.0)
                        })
                        .sum::<f64>()
            }
        };
        if remaining <= 0.0 {
            return Ok(());
        }

        let request = OrderRequest::stop_loss(symbol, side, anchor, remaining);
        let ack = client.create_order(&request).await?;
        self.positions
            .set_sl(uid, symbol, side, anchor, &ack.order_id, remaining)
            .await?;
        let be_row = MonitoredOrder::new(
            uid,
            symbol,
            &ack.order_id,
            OrderKind::BreakEven,
            side,
            anchor,
            remaining,
            position.position_qty,
            position.is_hedge,
        );
        self.orders.upsert(&be_row).await?;

        self.notifier
            .notify_deduped(
                &format!("break_even:{uid}:{symbol}:{side}:{filled_level}"),
                uid,
                Some(symbol),
                "break_even_moved",
                EventCategory::Sl,
                &format!("{symbol} {side} stop moved to {anchor} after tp{filled_level}"),
            )
            .await;
        Ok(())
    }

    /// After an SL fill or graph completion, wait 2 s and force-close any
    /// residue the exchange still reports for the side.
    fn schedule_closure_verification(
        self: &Arc<Self>,
        uid: &str,
        symbol: &str,
        side: PosSide,
        reason: &str,
    ) {
        let monitor = self.clone();
        let uid = uid.to_string();
        let symbol = symbol.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(CLOSURE_VERIFY_DELAY_SECS)).await;
            if let Err(e) = monitor
                .verify_closure(&uid, &symbol, side, &reason)
                .await
            {
                warn!(uid, symbol, %side, error = %e, "closure verification failed");
            }
        });
    }

    async fn verify_closure(
        self: &Arc<Self>,
        uid: &str,
        symbol: &str,
        side: PosSide,
        reason: &str,
    ) -> EngineResult<()> {
        let handle = self.pool.acquire(uid).await?;
        let result: EngineResult<()> = async {
            let residue = handle
                .client
                .fetch_positions(&[symbol])
                .await?
                .into_iter()
                .find(|p| p.pos_side == side);

            if let Some(live) = residue {
                info!(
                    uid, symbol, %side,
                    contracts = live.contracts,
                    reason,
                    "residual size after close — forcing market close"
                );
                let request = OrderRequest::market_close(symbol, side, live.contracts);
                handle.client.create_order(&request).await?;
            }

            // The side is (now) flat: clear the row and its artefacts.
            let settings = self.settings.get(uid).await?;
            self.notifier.clear_side(uid, symbol, side);
            self.positions.clear_side(uid, symbol, side, reason).await?;
            if settings.use_cooldown {
                self.positions
                    .set_cooldown(uid, symbol, side, settings.cooldown_time)
                    .await?;
            }
            Ok(())
        }
        .await;
        self.pool.release(handle).await;
        result
    }

    // -------------------------------------------------------------------------
    // Missing-order reconciliation
    // -------------------------------------------------------------------------

    /// The open-order count dropped: look at the last hour of closed orders
    /// on the exchange and drive a synthetic fill for anything that filled
    /// remotely but vanished locally.
    async fn reconcile_missing_orders(
        self: &Arc<Self>,
        uid: &str,
        client: &OkxClient,
        symbol: &str,
    ) -> EngineResult<()> {
        let since_ms = chrono::Utc::now().timestamp_millis() - MISSING_ORDER_WINDOW_MS;
        let remote_fills = client.recent_filled_orders(symbol, since_ms).await?;
        if remote_fills.is_empty() {
            return Ok(());
        }

        let local: HashSet<String> = self
            .orders
            .fetch_all(uid)
            .await?
            .into_iter()
            .map(|r| r.order_id)
            .collect();

        for details in remote_fills {
            if local.contains(&details.order_id) {
                continue;
            }
            let Some(side) = details.pos_side else { continue };

            // Match the fill against the stored TP graph to find its level.
            let Some(position) = self.positions.fetch(uid, symbol, side).await? else {
                continue;
            };
            let Some(level) = position
                .tp_data
                .iter()
                .find(|e| e.order_id.as_deref() == Some(details.order_id.as_str()))
                .map(|e| e.level)
            else {
                continue;
            };

            info!(
                uid, symbol, %side, level,
                order_id = %details.order_id,
                "remote fill without local row — driving synthetic fill"
            );
            let first = self
                .positions
                .mark_tp_filled(uid, symbol, side, level)
                .await?;
            if first {
                self.notifier
                    .notify_tp_fill(
                        uid,
                        symbol,
                        side,
                        level,
                        &format!("{symbol} {side} tp{level} filled (recovered)"),
                        details.update_time_ms,
                    )
                    .await;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Periodic sweeps
    // -------------------------------------------------------------------------

    async fn periodic_sweeps(self: &Arc<Self>, uid: &str, client: &OkxClient) {
        let due = {
            let mut state = self.state.lock();
            let due = state
                .last_orphan_sweep
                .get(uid)
                .map(|t| t.elapsed().as_secs() >= SWEEP_INTERVAL_SECS)
                .unwrap_or(true);
            if due {
                state.last_orphan_sweep.insert(uid.to_string(), Instant::now());
            }
            due
        };
        if !due {
            return;
        }

        if let Err(e) = self.sweep_orphan_algos(uid, client).await {
            warn!(uid, error = %e, "orphan algo sweep failed");
        }
    }

    /// Cancel leftover algo orders for sides with no live position, then
    /// enforce algo-order cardinality per (symbol, posSide).
    async fn sweep_orphan_algos(self: &Arc<Self>, uid: &str, client: &OkxClient) -> EngineResult<()> {
        let live = client.fetch_positions(&[]).await?;
        let held: HashSet<(String, PosSide)> = live
            .iter()
            .map(|p| (p.symbol.clone(), p.pos_side))
            .collect();

        // Symbols with monitored rows or live positions are in scope.
        let mut symbols: HashSet<String> = live.iter().map(|p| p.symbol.clone()).collect();
        for row in self.orders.fetch_all(uid).await? {
            symbols.insert(row.symbol);
        }

        for symbol in symbols {
            let pending = match client.pending_algos(&symbol, SL_ALGO_TYPE).await {
                Ok(rows) => rows,
                // No orders is a perfectly normal outcome.
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(uid, symbol, error = %e, "pending algo fetch failed");
                    continue;
                }
            };

            // 1. Orphans: algo protects a side that holds nothing.
            for side in [PosSide::Long, PosSide::Short] {
                if held.contains(&(symbol.clone(), side)) {
                    continue;
                }
                let count = match client
                    .cancel_all_algo(&symbol, Some(side), SL_ALGO_TYPE)
                    .await
                {
                    Ok(n) => n,
                    Err(EngineError::NotFound(_)) => 0,
                    Err(e) => {
                        warn!(uid, symbol, %side, error = %e, "orphan cancel failed");
                        continue;
                    }
                };
                if count > 0 {
                    self.journal
                        .record(
                            LogEntry::new(
                                uid,
                                "orphan_algo_cleanup",
                                EventCategory::Info,
                                &format!("{count} orphan algo orders cancelled for {symbol} {side}"),
                            )
                            .with_symbol(&symbol),
                        )
                        .await;
                }
            }

            // 2. Cardinality: at most one SL per posSide; extras beyond the
            // newest (by update time) are cancelled.
            for side in [PosSide::Long, PosSide::Short] {
                if !held.contains(&(symbol.clone(), side)) {
                    continue;
                }
                let mut side_orders: Vec<_> = pending
                    .iter()
                    .filter(|o| o.pos_side == Some(side))
                    .collect();
                if side_orders.len() <= 1 {
                    continue;
                }
                side_orders.sort_by_key(|o| std::cmp::Reverse(o.update_time_ms));
                let extras: Vec<String> = side_orders[1..]
                    .iter()
                    .map(|o| o.algo_id.clone())
                    .collect();
                warn!(
                    uid, symbol, %side,
                    extra = extras.len(),
                    "SL cardinality violated — cancelling all but the newest"
                );
                if let Err(e) = client.cancel_algo_orders(&extras, &symbol).await {
                    warn!(uid, symbol, error = %e, "cardinality cancel failed");
                }
                self.journal
                    .record(
                        LogEntry::new(
                            uid,
                            "sl_cardinality_repair",
                            EventCategory::Error,
                            &format!(
                                "{} extra SL orders cancelled for {symbol} {side}",
                                extras.len()
                            ),
                        )
                        .with_symbol(&symbol),
                    )
                    .await;
            }

            // 3. Same policy for TPs: at most three reduce-only limit orders
            // per posSide, newest kept.
            let regular = match client.pending_orders(&symbol).await {
                Ok(rows) => rows,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(uid, symbol, error = %e, "pending order fetch failed");
                    continue;
                }
            };
            for side in [PosSide::Long, PosSide::Short] {
                if !held.contains(&(symbol.clone(), side)) {
                    continue;
                }
                let mut tps: Vec<_> = regular
                    .iter()
                    .filter(|o| o.pos_side == Some(side) && o.side == side.close_side())
                    .collect();
                if tps.len() <= 3 {
                    continue;
                }
                tps.sort_by_key(|o| std::cmp::Reverse(o.update_time_ms));
                warn!(
                    uid, symbol, %side,
                    extra = tps.len() - 3,
                    "TP cardinality violated — cancelling all but the newest three"
                );
                for extra in &tps[3..] {
                    match client.cancel_order(&extra.order_id, &symbol).await {
                        Ok(()) | Err(EngineError::NotFound(_)) => {}
                        Err(e) => {
                            warn!(uid, symbol, order_id = %extra.order_id, error = %e, "TP cardinality cancel failed");
                        }
                    }
                }
                self.journal
                    .record(
                        LogEntry::new(
                            uid,
                            "tp_cardinality_repair",
                            EventCategory::Error,
                            &format!(
                                "{} extra TP orders cancelled for {symbol} {side}",
                                tps.len() - 3
                            ),
                        )
                        .with_symbol(&symbol),
                    )
                    .await;
            }
        }
        Ok(())
    }
}

/// Poll-pressure shaping: any rule returning true polls the order now.
fn poll_due(
    row: &MonitoredOrder,
    prev_status: Option<OrderState>,
    current_price: f64,
    iteration: u64,
    full_sweep: bool,
) -> bool {
    // 15 s cadence: everything.
    if full_sweep {
        return true;
    }

    // Status changed behind our back (another process wrote the row).
    if let Some(prev) = prev_status {
        if prev != row.status {
            return true;
        }
    }

    // Open-order heartbeat.
    if iteration % OPEN_HEARTBEAT_ITERS == 0 && row.status == OrderState::Open {
        return true;
    }

    match row.order_type {
        OrderKind::Tp1 | OrderKind::Tp2 | OrderKind::Tp3 => {
            // TP sweep every 2nd iteration, else proximity on the closing
            // side.
            if iteration % TP_SWEEP_ITERS == 0 {
                return true;
            }
            match row.position_side {
                PosSide::Long => current_price >= row.price * 0.99,
                PosSide::Short => current_price <= row.price * 1.01,
            }
        }
        OrderKind::Sl | OrderKind::BreakEven => {
            // Price crossed the stop level on the stop side.
            match row.position_side {
                PosSide::Long => current_price <= row.price,
                PosSide::Short => current_price >= row.price,
            }
        }
        _ => false,
    }
}

/// Resident set size of this process in megabytes.
fn resident_memory_mb() -> u64 {
    let mut system = System::new();
    let pid = Pid::from_u32(std::process::id());
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    system
        .process(pid)
        .map(|p| p.memory() / (1024 * 1024))
        .unwrap_or(0)
}

impl std::fmt::Debug for MonitorLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MonitorLoop")
            .field("iteration", &state.iteration)
            .field("tracked_orders", &state.order_statuses.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tp_row(kind: OrderKind, side: PosSide, price: f64) -> MonitoredOrder {
        MonitoredOrder::new("u1", "BTC-USDT-SWAP", "oid", kind, side, price, 3.0, 10.0, false)
    }

    #[test]
    fn full_sweep_polls_everything() {
        let row = tp_row(OrderKind::Tp1, PosSide::Long, 102.0);
        assert!(poll_due(&row, None, 50.0, 1, true));
    }

    #[test]
    fn status_change_triggers_poll() {
        let row = tp_row(OrderKind::Tp1, PosSide::Long, 102.0);
        // Row says open, cache remembered filled: divergence polls.
        assert!(poll_due(&row, Some(OrderState::Filled), 50.0, 1, false));
    }

    #[test]
    fn open_heartbeat_every_fifth_iteration() {
        let row = tp_row(OrderKind::Sl, PosSide::Long, 95.0);
        // SL far from trigger, odd iteration: no poll.
        assert!(!poll_due(&row, None, 100.0, 3, false));
        // 5th iteration heartbeat polls all open orders.
        assert!(poll_due(&row, None, 100.0, 5, false));
    }

    #[test]
    fn tp_sweep_every_second_iteration() {
        let row = tp_row(OrderKind::Tp2, PosSide::Long, 103.0);
        assert!(poll_due(&row, None, 50.0, 4, false));
        // Odd iteration, price far below the TP: skip.
        assert!(!poll_due(&row, None, 50.0, 3, false));
    }

    #[test]
    fn tp_proximity_polls_on_closing_side() {
        let long_tp = tp_row(OrderKind::Tp1, PosSide::Long, 100.0);
        assert!(poll_due(&long_tp, None, 99.0, 1, false)); // within 1 %
        assert!(!poll_due(&long_tp, None, 98.0, 1, false));

        let short_tp = tp_row(OrderKind::Tp1, PosSide::Short, 100.0);
        assert!(poll_due(&short_tp, None, 101.0, 1, false));
        assert!(!poll_due(&short_tp, None, 102.0, 1, false));
    }

    #[test]
    fn sl_cross_polls_on_stop_side() {
        let long_sl = tp_row(OrderKind::Sl, PosSide::Long, 95.0);
        assert!(poll_due(&long_sl, None, 94.9, 1, false));
        assert!(!poll_due(&long_sl, None, 95.1, 1, false));

        let short_sl = tp_row(OrderKind::Sl, PosSide::Short, 105.0);
        assert!(poll_due(&short_sl, None, 105.1, 1, false));
        assert!(!poll_due(&short_sl, None, 104.9, 1, false));
    }
}
