// =============================================================================
// Central Application State — Helios Perp Nexus
// =============================================================================
//
// Ties every component together and owns nothing itself: each collaborator
// is built once here, injected everywhere, and shut down explicitly from
// main. No module-level globals survive initialisation.
// =============================================================================

use std::sync::Arc;

use crate::dispatcher::{ChatApi, MessageDispatcher};
use crate::identity::{IdentityResolver, UserDirectory};
use crate::journal::Journal;
use crate::monitor::notify::Notifier;
use crate::monitor::orders::OrderRows;
use crate::monitor::MonitorLoop;
use crate::okx::ClientPool;
use crate::position::PositionRepo;
use crate::preset::PresetRepo;
use crate::scheduler::Scheduler;
use crate::settings::SettingsRepo;
use crate::store::cache::CacheSweeper;
use crate::store::Store;
use crate::tpsl::TpSlEngine;
use crate::trailing::TrailingStopHandler;

/// Shared state handed to the API layer and every background task.
pub struct AppState {
    pub store: Store,
    pub identity: Arc<IdentityResolver>,
    pub pool: Arc<ClientPool>,
    pub settings: SettingsRepo,
    pub presets: PresetRepo,
    pub positions: PositionRepo,
    pub orders: OrderRows,
    pub tpsl: Arc<TpSlEngine>,
    pub trailing: Arc<TrailingStopHandler>,
    pub journal: Journal,
    pub dispatcher: Arc<MessageDispatcher>,
    pub notifier: Arc<Notifier>,
    pub scheduler: Arc<Scheduler>,
    pub monitor: Arc<MonitorLoop>,
    pub cache_sweeper: CacheSweeper,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build the full component graph from its three injected boundaries:
    /// the store, the chat API, and the user directory.
    pub fn build(
        store: Store,
        chat: Arc<dyn ChatApi>,
        directory: Arc<dyn UserDirectory>,
    ) -> Arc<Self> {
        let journal = Journal::new(store.clone());
        let identity = Arc::new(IdentityResolver::new(store.clone(), directory));
        let dispatcher =
            MessageDispatcher::new(store.clone(), identity.clone(), chat, journal.clone());
        let notifier = Notifier::new(dispatcher.clone(), journal.clone());

        let positions = PositionRepo::new(store.clone(), journal.clone());
        let orders = OrderRows::new(store.clone());
        let settings = SettingsRepo::new(store.clone());
        let presets = PresetRepo::new(store.clone());
        let pool_max_size = std::env::var("HELIOS_POOL_MAX_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let pool_max_age_secs = std::env::var("HELIOS_POOL_MAX_AGE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);
        let pool = Arc::new(
            ClientPool::new(identity.clone()).with_limits(
                pool_max_size,
                std::time::Duration::from_secs(pool_max_age_secs),
            ),
        );

        let tpsl = Arc::new(TpSlEngine::new(
            store.clone(),
            positions.clone(),
            orders.clone(),
            notifier.clone(),
        ));
        let trailing = Arc::new(TrailingStopHandler::new(
            store.clone(),
            positions.clone(),
            orders.clone(),
            notifier.clone(),
        ));

        let cycle_deps = crate::cycle::CycleDeps {
            store: store.clone(),
            pool: pool.clone(),
            settings: settings.clone(),
            positions: positions.clone(),
            tpsl: tpsl.clone(),
            notifier: notifier.clone(),
        };
        let scheduler = Scheduler::new(
            store.clone(),
            identity.clone(),
            cycle_deps,
            notifier.clone(),
        );

        let monitor = MonitorLoop::new(
            store.clone(),
            identity.clone(),
            pool.clone(),
            settings.clone(),
            positions.clone(),
            orders.clone(),
            tpsl.clone(),
            trailing.clone(),
            notifier.clone(),
            journal.clone(),
        );

        let cache_sweeper = CacheSweeper::spawn(store.cache());

        Arc::new(Self {
            store,
            identity,
            pool,
            settings,
            presets,
            positions,
            orders,
            tpsl,
            trailing,
            journal,
            dispatcher,
            notifier,
            scheduler,
            monitor,
            cache_sweeper,
            start_time: std::time::Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("uptime_secs", &self.uptime_secs())
            .finish()
    }
}
