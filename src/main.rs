// =============================================================================
// Helios Perp Nexus — Main Entry Point
// =============================================================================
//
// Boot order: pid guard, state store, component graph, API server, monitor
// supervisor, then startup recovery for every (user, symbol) that was still
// marked running. SIGINT/SIGTERM request a cooperative shutdown; workers are
// never killed directly.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod cycle;
mod dispatcher;
mod error;
mod identity;
mod indicators;
mod journal;
mod monitor;
mod okx;
mod position;
mod preset;
mod scheduler;
mod settings;
mod store;
mod strategy;
mod tpsl;
mod trailing;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::dispatcher::{ChatApi, HttpChat, NoopChat};
use crate::identity::NoDirectory;
use crate::scheduler::PidGuard;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Helios Perp Nexus — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Single-flight pid guard ───────────────────────────────────────
    let pid_path = std::env::var("HELIOS_PID_FILE").unwrap_or_else(|_| "bot.pid".into());
    let _pid_guard = match PidGuard::acquire(&pid_path) {
        Ok(guard) => guard,
        Err(e) => {
            error!(error = %e, "refusing to start");
            std::process::exit(1);
        }
    };

    // ── 3. State store ───────────────────────────────────────────────────
    let redis_url =
        std::env::var("HELIOS_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
    let store = Store::connect(&redis_url).await?;
    info!(url = %redis_url, "state store connected");

    // ── 4. Boundary collaborators ────────────────────────────────────────
    let chat: Arc<dyn ChatApi> = match std::env::var("HELIOS_BOT_URL") {
        Ok(url) if !url.is_empty() => {
            info!(url = %url, "chat endpoint configured");
            Arc::new(HttpChat::new(url))
        }
        _ => {
            warn!("HELIOS_BOT_URL not set — user messages downgrade to the journal");
            Arc::new(NoopChat)
        }
    };

    // ── 5. Component graph ───────────────────────────────────────────────
    let state = AppState::build(store.clone(), chat, Arc::new(NoDirectory));

    // One-shot key-schema migration before anything reads runtime keys.
    match identity::migrate_chat_scoped_keys(&store).await {
        Ok(migrated) if migrated > 0 => info!(migrated, "legacy keys migrated"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "key migration failed — readers fall back to both schemas"),
    }

    // ── 6. API server ────────────────────────────────────────────────────
    let bind_addr =
        std::env::var("HELIOS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".into());
    let api_state = state.clone();
    let api_addr = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&api_addr)
            .await
            .expect("Failed to bind API server");
        info!(addr = %api_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 7. Monitor loop (supervised) ─────────────────────────────────────
    tokio::spawn(state.monitor.clone().run_supervised());

    // ── 8. Startup recovery ──────────────────────────────────────────────
    let recovery = state.scheduler.start_all_running_users().await;
    info!(
        restarted = recovery.restarted_users.len(),
        errors = recovery.errors.len(),
        "startup recovery complete"
    );

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    shutdown_signal().await;
    warn!("Shutdown signal received — stopping gracefully");

    state.cache_sweeper.shutdown();
    info!("Helios Perp Nexus shut down complete.");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler installation failed");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
