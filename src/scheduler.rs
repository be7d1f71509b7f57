// =============================================================================
// Scheduler / Task Controller — start, stop, restart per (user, symbol)
// =============================================================================
//
// Owns the cycle task registry. Start requests resolve the caller's identity,
// hydrate credentials, refuse duplicates, and spawn the cycle; stop requests
// raise the cooperative stop signal, revoke the task, and tear down runtime
// keys best-effort (a failed teardown step logs and moves on). Startup
// recovery relaunches everything that was running when the process died.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cycle::{run_cycle, CycleDeps};
use crate::error::{EngineError, EngineResult};
use crate::identity::IdentityResolver;
use crate::monitor::notify::Notifier;
use crate::store::{keys, Store};
use crate::types::{EventCategory, PosSide, TradingStatus};

/// Grace period between revoking a task and reusing its keys.
const REVOKE_GRACE_SECS: u64 = 2;
/// Defaults applied when a start request names no market.
const DEFAULT_SYMBOL: &str = "BTC-USDT-SWAP";
const DEFAULT_TIMEFRAME: &str = "1m";

#[derive(Debug, Serialize)]
pub struct StartResult {
    pub okx_uid: String,
    pub symbol: String,
    pub timeframe: String,
    pub task_id: String,
}

#[derive(Debug, Serialize, Default)]
pub struct RecoveryResult {
    pub restarted_users: Vec<String>,
    pub errors: Vec<String>,
}

pub struct Scheduler {
    store: Store,
    identity: Arc<IdentityResolver>,
    cycle_deps: CycleDeps,
    notifier: Arc<Notifier>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        identity: Arc<IdentityResolver>,
        cycle_deps: CycleDeps,
        notifier: Arc<Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            identity,
            cycle_deps,
            notifier,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Start
    // -------------------------------------------------------------------------

    pub async fn start(
        self: &Arc<Self>,
        user_id: &str,
        symbol: Option<&str>,
        timeframe: Option<&str>,
        restart: bool,
    ) -> EngineResult<StartResult> {
        // 1. Identity + credentials.
        let uid = self.identity.resolve_to_uid(user_id).await?;
        if self.identity.api_credentials(&uid).await?.is_none() {
            return Err(EngineError::Config(format!(
                "no API credentials registered for {uid}"
            )));
        }
        let chat_id = self.identity.resolve_to_chat_id(&uid).await?;

        // Fall back to stored preferences, then to defaults.
        let prefs = self.store.hgetall(&keys::preferences(&uid)).await?;
        let symbol = symbol
            .map(str::to_string)
            .or_else(|| prefs.get("symbol").cloned())
            .unwrap_or_else(|| DEFAULT_SYMBOL.to_string());
        let timeframe = timeframe
            .map(str::to_string)
            .or_else(|| prefs.get("timeframe").cloned())
            .unwrap_or_else(|| DEFAULT_TIMEFRAME.to_string());

        // 2. Duplicate guard across both key schemas.
        let mut statuses = vec![self.store.get(&keys::symbol_status(&uid, &symbol)).await?];
        if let Some(chat) = &chat_id {
            statuses.push(
                self.store
                    .get(&keys::legacy::symbol_status(chat, &symbol))
                    .await?,
            );
        }
        let running = statuses
            .iter()
            .flatten()
            .any(|s| TradingStatus::parse(s) == Some(TradingStatus::Running));
        if running && !restart {
            return Err(EngineError::Validation("already_running".into()));
        }

        // 3. Revoke any prior task.
        let prior_task = self.store.get(&keys::task_id(&uid)).await?;
        if restart || prior_task.is_some() {
            if let Some(task_id) = prior_task {
                self.revoke(&task_id);
                if let Err(e) = self.store.del(&keys::task_id(&uid)).await {
                    warn!(uid, error = %e, "prior task_id delete failed");
                }
            }
            tokio::time::sleep(Duration::from_secs(REVOKE_GRACE_SECS)).await;
        }

        // 4. Purge side locks, cooldowns, and the task-running guard.
        self.purge_runtime_keys(&uid, &symbol).await;

        // 5. Mark running, persist preferences, dispatch the cycle.
        self.store
            .set(&keys::symbol_status(&uid, &symbol), "running")
            .await?;
        self.store.del(&keys::stop_signal(&uid)).await?;
        self.store
            .hset_multiple(
                &keys::preferences(&uid),
                &[
                    ("symbol".into(), symbol.clone()),
                    ("timeframe".into(), timeframe.clone()),
                ],
            )
            .await?;

        let task_id = Uuid::new_v4().to_string();
        let handle = tokio::spawn(run_cycle(
            self.cycle_deps.clone(),
            uid.clone(),
            symbol.clone(),
            timeframe.clone(),
        ));
        self.tasks.lock().insert(task_id.clone(), handle);

        // Record the id under the uid and, during migration, the chat twin.
        self.store.set(&keys::task_id(&uid), &task_id).await?;
        if let Some(chat) = &chat_id {
            if let Err(e) = self.store.set(&keys::legacy::task_id(chat), &task_id).await {
                warn!(uid, error = %e, "legacy task_id write failed");
            }
        }

        info!(uid, symbol, timeframe, task_id, restart, "trading started");
        Ok(StartResult {
            okx_uid: uid,
            symbol,
            timeframe,
            task_id,
        })
    }

    // -------------------------------------------------------------------------
    // Stop
    // -------------------------------------------------------------------------

    /// Stop trading for a user. Every teardown step is best-effort: a
    /// failure logs and the pipeline continues.
    pub async fn stop(self: &Arc<Self>, user_id: &str) -> EngineResult<String> {
        let uid = self.identity.resolve_to_uid(user_id).await?;
        let chat_id = self.identity.resolve_to_chat_id(&uid).await.unwrap_or(None);

        if let Err(e) = self.store.set(&keys::stop_signal(&uid), "true").await {
            warn!(uid, error = %e, "stop signal write failed");
        }
        if let Some(chat) = &chat_id {
            if let Err(e) = self.store.set(&keys::legacy::stop_signal(chat), "true").await {
                warn!(uid, error = %e, "legacy stop signal write failed");
            }
        }

        let prefs = self.store.hgetall(&keys::preferences(&uid)).await.unwrap_or_default();
        let symbol = prefs
            .get("symbol")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SYMBOL.to_string());
        if let Err(e) = self
            .store
            .set(&keys::symbol_status(&uid, &symbol), "stopped")
            .await
        {
            warn!(uid, symbol, error = %e, "status write failed");
        }

        if let Ok(Some(task_id)) = self.store.get(&keys::task_id(&uid)).await {
            self.revoke(&task_id);
        }
        tokio::time::sleep(Duration::from_secs(REVOKE_GRACE_SECS)).await;

        for key in [
            keys::task_id(&uid),
            keys::stop_signal(&uid),
            keys::task_running(&uid),
        ] {
            if let Err(e) = self.store.del(&key).await {
                warn!(uid, key, error = %e, "teardown delete failed");
            }
        }
        self.purge_runtime_keys(&uid, &symbol).await;

        self.notifier
            .notify(
                &uid,
                Some(&symbol),
                "trading_stopped",
                EventCategory::Stop,
                &format!("{symbol} trading stopped"),
            )
            .await;

        info!(uid, symbol, "trading stopped");
        Ok(uid)
    }

    // -------------------------------------------------------------------------
    // Bulk operations
    // -------------------------------------------------------------------------

    /// Relaunch every (user, symbol) that was `running` at process boot.
    /// Individual failures collect into the error list; the sweep finishes.
    pub async fn start_all_running_users(self: &Arc<Self>) -> RecoveryResult {
        let mut result = RecoveryResult::default();

        let entries = match self.running_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                result.errors.push(format!("status scan failed: {e}"));
                return result;
            }
        };

        for (uid, symbol) in entries {
            // Transient marker so a crash mid-recovery is visible.
            if let Err(e) = self
                .store
                .set(&keys::symbol_status(&uid, &symbol), "restarting")
                .await
            {
                warn!(uid, symbol, error = %e, "restarting marker write failed");
            }
            if let Ok(Some(orphan)) = self.store.get(&keys::task_id(&uid)).await {
                self.revoke(&orphan);
            }

            match self.start(&uid, Some(&symbol), None, true).await {
                Ok(_) => result.restarted_users.push(uid),
                Err(e) => {
                    warn!(uid, symbol, error = %e, "recovery start failed");
                    let _ = self
                        .store
                        .set(&keys::symbol_status(&uid, &symbol), "error")
                        .await;
                    result.errors.push(format!("{uid}/{symbol}: {e}"));
                }
            }
        }

        info!(
            restarted = result.restarted_users.len(),
            errors = result.errors.len(),
            "startup recovery finished"
        );
        result
    }

    pub async fn stop_all_running_users(self: &Arc<Self>) -> RecoveryResult {
        let mut result = RecoveryResult::default();
        let entries = match self.running_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                result.errors.push(format!("status scan failed: {e}"));
                return result;
            }
        };
        for (uid, _symbol) in entries {
            match self.stop(&uid).await {
                Ok(uid) => result.restarted_users.push(uid),
                Err(e) => result.errors.push(format!("{uid}: {e}")),
            }
        }
        result
    }

    /// All distinct uids whose status reads `running`.
    pub async fn running_users(self: &Arc<Self>) -> EngineResult<Vec<String>> {
        let mut uids: Vec<String> = self
            .running_entries()
            .await?
            .into_iter()
            .map(|(uid, _)| uid)
            .collect();
        uids.sort();
        uids.dedup();
        Ok(uids)
    }

    async fn running_entries(&self) -> EngineResult<Vec<(String, String)>> {
        let mut out = Vec::new();
        for key in self.store.scan_match(keys::symbol_status_pattern()).await? {
            let Some((id, symbol)) = keys::parse_symbol_status_key(&key) else {
                continue;
            };
            let Some(status) = self.store.get(&key).await? else {
                continue;
            };
            if TradingStatus::parse(&status) == Some(TradingStatus::Running) {
                let uid = self.identity.resolve_to_uid(&id).await?;
                out.push((uid, symbol));
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    pub async fn status(
        &self,
        uid: &str,
        symbol: Option<&str>,
    ) -> EngineResult<serde_json::Value> {
        // Preferences change rarely; a stale cached read is fine here.
        let prefs = self
            .store
            .hgetall_cached(&keys::preferences(uid), true)
            .await?;
        let symbol = symbol
            .map(str::to_string)
            .or_else(|| prefs.get("symbol").cloned())
            .unwrap_or_else(|| DEFAULT_SYMBOL.to_string());
        let status = self
            .store
            .get(&keys::symbol_status(uid, &symbol))
            .await?
            .unwrap_or_else(|| "stopped".to_string());
        let task_id = self.store.get(&keys::task_id(uid)).await?;

        let mut positions = serde_json::Map::new();
        let mut cooldowns = serde_json::Map::new();
        for side in [PosSide::Long, PosSide::Short] {
            let row = self.store.hgetall(&keys::position(uid, &symbol, side)).await?;
            if !row.is_empty() {
                positions.insert(side.as_str().to_string(), serde_json::to_value(row)?);
            }
            let ttl = self.store.ttl(&keys::cooldown(uid, &symbol, side)).await?;
            if ttl > 0 {
                cooldowns.insert(side.as_str().to_string(), serde_json::json!(ttl));
            }
        }

        Ok(serde_json::json!({
            "okx_uid": uid,
            "symbol": symbol,
            "status": status,
            "task_id": task_id,
            "preferences": prefs,
            "positions": positions,
            "cooldown_secs": cooldowns,
        }))
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn revoke(&self, task_id: &str) {
        if let Some(handle) = self.tasks.lock().remove(task_id) {
            handle.abort();
            debug!(task_id, "cycle task revoked");
        }
    }

    async fn purge_runtime_keys(&self, uid: &str, symbol: &str) {
        match self
            .store
            .scan_match(&format!("lock:user:{uid}:{symbol}:*"))
            .await
        {
            Ok(locks) => {
                for lock in locks {
                    if let Err(e) = self.store.del(&lock).await {
                        warn!(uid, lock, error = %e, "lock purge failed");
                    }
                }
            }
            Err(e) => warn!(uid, error = %e, "lock scan failed"),
        }
        for side in [PosSide::Long, PosSide::Short] {
            if let Err(e) = self.store.del(&keys::cooldown(uid, symbol, side)).await {
                warn!(uid, symbol, %side, error = %e, "cooldown purge failed");
            }
        }
        if let Err(e) = self.store.del(&keys::task_running(uid)).await {
            warn!(uid, error = %e, "task_running purge failed");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

// =============================================================================
// PID-file single-flight guard
// =============================================================================

/// Refuses to start a second supervisor on the same machine. The pid file is
/// rewritten when the recorded process is dead, and removed on drop.
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
}

impl PidGuard {
    pub fn acquire(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Ok(pid) = content.trim().parse::<u32>() {
                if pid != std::process::id() && process_alive(pid) {
                    return Err(EngineError::Conflict(format!(
                        "another instance is running (pid {pid})"
                    )));
                }
            }
            // Stale or unreadable pid: take over.
            let _ = std::fs::remove_file(&path);
        }

        std::fs::write(&path, std::process::id().to_string())
            .map_err(|e| EngineError::Config(format!("pid file write failed: {e}")))?;
        info!(path = %path.display(), pid = std::process::id(), "pid guard acquired");
        Ok(Self { path })
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_guard_acquires_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.pid");
        {
            let _guard = PidGuard::acquire(&path).unwrap();
            let recorded: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
            assert_eq!(recorded, std::process::id());
        }
        // Dropped: the file is gone.
        assert!(!path.exists());
    }

    #[test]
    fn pid_guard_replaces_stale_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.pid");
        // A pid that cannot be alive.
        std::fs::write(&path, "4194304").unwrap();
        let _guard = PidGuard::acquire(&path).unwrap();
        let recorded: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(recorded, std::process::id());
    }

    #[test]
    fn pid_guard_rejects_live_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.pid");
        // PID 1 is always alive on Linux.
        std::fs::write(&path, "1").unwrap();
        let err = PidGuard::acquire(&path).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        // The original file must be untouched.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
    }

    #[test]
    fn pid_guard_accepts_garbage_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        let _guard = PidGuard::acquire(&path).unwrap();
        assert!(path.exists());
    }
}
