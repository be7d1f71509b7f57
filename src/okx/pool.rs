// =============================================================================
// Exchange Client Pool — bounded per-user pool with idle validation and TTL
// =============================================================================
//
// Each user gets an independent pool of authenticated clients shared across
// that user's concurrent cycles; clients are never shared across users.
// Candidates are taken out of the pool before the 5 s validation call so no
// lock is held across exchange I/O.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::identity::IdentityResolver;

use super::client::OkxClient;

/// Default pool bounds.
const DEFAULT_MAX_SIZE: usize = 10;
const DEFAULT_MAX_AGE_SECS: u64 = 3600;
/// Validation budget per candidate.
const VALIDATE_TIMEOUT_SECS: u64 = 5;
/// Acquire backoff ladder: 0.5 s, 1 s, 2 s.
const ACQUIRE_RETRIES: u32 = 3;
const ACQUIRE_BACKOFF_BASE_MS: u64 = 500;
/// Instrument used for the market-load validation probe.
const VALIDATE_SYMBOL: &str = "BTC-USDT-SWAP";

/// Optional metrics sink. Absent collector is a no-op.
pub trait PoolMetrics: Send + Sync {
    fn client_created(&self, uid: &str);
    fn client_released(&self, uid: &str);
    fn client_error(&self, uid: &str);
    fn acquire_wait_secs(&self, uid: &str, secs: f64);
    fn pool_size(&self, uid: &str, size: usize);
}

struct Entry {
    id: u64,
    client: OkxClient,
    created_at: Instant,
    in_use: bool,
}

#[derive(Default)]
struct UserPool {
    entries: Vec<Entry>,
    next_id: u64,
}

/// A checked-out client. Must be handed back through [`ClientPool::release`].
pub struct PooledClient {
    pub client: OkxClient,
    uid: String,
    entry_id: u64,
}

/// Per-user bounded pool of authenticated exchange clients.
pub struct ClientPool {
    identity: Arc<IdentityResolver>,
    pools: Mutex<HashMap<String, Arc<Mutex<UserPool>>>>,
    max_size: usize,
    max_age: Duration,
    metrics: Option<Arc<dyn PoolMetrics>>,
}

impl ClientPool {
    pub fn new(identity: Arc<IdentityResolver>) -> Self {
        Self {
            identity,
            pools: Mutex::new(HashMap::new()),
            max_size: DEFAULT_MAX_SIZE,
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECS),
            metrics: None,
        }
    }

    pub fn with_limits(mut self, max_size: usize, max_age: Duration) -> Self {
        self.max_size = max_size;
        self.max_age = max_age;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn PoolMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn user_pool(&self, uid: &str) -> Arc<Mutex<UserPool>> {
        let mut pools = self.pools.lock().await;
        pools
            .entry(uid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UserPool::default())))
            .clone()
    }

    /// Acquire a validated client for `uid`.
    ///
    /// Ordering per attempt: evict aged entries, validate idle candidates,
    /// build a new client if the pool has room, otherwise back off at
    /// 0.5 s * 2^attempt and retry up to 3 times before failing with the
    /// pool-exhausted kind.
    pub async fn acquire(&self, uid: &str) -> EngineResult<PooledClient> {
        let started = Instant::now();
        let pool = self.user_pool(uid).await;

        let mut attempt: u32 = 0;
        loop {
            // 1 + 2. Evict aged entries, then try idle candidates one at a
            // time. Each candidate is marked in_use before the lock drops so
            // concurrent acquires cannot validate the same client.
            loop {
                let candidate = {
                    let mut p = pool.lock().await;
                    p.entries
                        .retain(|e| e.in_use || e.created_at.elapsed() < self.max_age);
                    self.report_size(uid, p.entries.len());
                    match p.entries.iter_mut().find(|e| !e.in_use) {
                        Some(entry) => {
                            entry.in_use = true;
                            Some((entry.id, entry.client.clone()))
                        }
                        None => None,
                    }
                };

                let Some((entry_id, client)) = candidate else {
                    break;
                };

                if self.validate(&client).await {
                    self.report_wait(uid, started);
                    return Ok(PooledClient {
                        client,
                        uid: uid.to_string(),
                        entry_id,
                    });
                }

                debug!(uid, entry_id, "pooled client failed validation — dropping");
                if let Some(m) = &self.metrics {
                    m.client_error(uid);
                }
                pool.lock().await.entries.retain(|e| e.id != entry_id);
            }

            // 3. Build a fresh client if there is room.
            let reserved_id = {
                let mut p = pool.lock().await;
                if p.entries.len() < self.max_size {
                    p.next_id += 1;
                    Some(p.next_id)
                } else {
                    None
                }
            };

            if let Some(entry_id) = reserved_id {
                match self.build_client(uid).await {
                    Ok(client) => {
                        if self.validate(&client).await {
                            let mut p = pool.lock().await;
                            p.entries.push(Entry {
                                id: entry_id,
                                client: client.clone(),
                                created_at: Instant::now(),
                                in_use: true,
                            });
                            self.report_size(uid, p.entries.len());
                            drop(p);
                            if let Some(m) = &self.metrics {
                                m.client_created(uid);
                            }
                            self.report_wait(uid, started);
                            return Ok(PooledClient {
                                client,
                                uid: uid.to_string(),
                                entry_id,
                            });
                        }
                        warn!(uid, "freshly built client failed validation");
                        if let Some(m) = &self.metrics {
                            m.client_error(uid);
                        }
                    }
                    // Authentication failures are surfaced as-is so callers
                    // stop retrying with the same bad credentials.
                    Err(e @ EngineError::Auth(_)) => return Err(e),
                    Err(e @ EngineError::Config(_)) => return Err(e),
                    Err(e) => {
                        warn!(uid, error = %e, "client build failed");
                        if let Some(m) = &self.metrics {
                            m.client_error(uid);
                        }
                    }
                }
            }

            // 4. Pool full or build failed: back off and retry.
            if attempt >= ACQUIRE_RETRIES {
                return Err(EngineError::PoolExhausted(uid.to_string()));
            }
            let delay = ACQUIRE_BACKOFF_BASE_MS * 2u64.pow(attempt);
            debug!(uid, attempt, delay_ms = delay, "pool busy — backing off");
            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempt += 1;
        }
    }

    /// Return a client to the available set without closing it.
    pub async fn release(&self, handle: PooledClient) {
        let pool = self.user_pool(&handle.uid).await;
        let mut p = pool.lock().await;
        if let Some(entry) = p.entries.iter_mut().find(|e| e.id == handle.entry_id) {
            entry.in_use = false;
        }
        drop(p);
        if let Some(m) = &self.metrics {
            m.client_released(&handle.uid);
        }
    }

    /// Close and drop every client owned by `uid` (e.g. after credential
    /// rotation or a hard auth failure).
    pub async fn invalidate_user(&self, uid: &str) {
        let pool = self.user_pool(uid).await;
        let dropped = {
            let mut p = pool.lock().await;
            let n = p.entries.len();
            p.entries.clear();
            n
        };
        if dropped > 0 {
            info!(uid, dropped, "user client pool invalidated");
        }
        self.report_size(uid, 0);
    }

    /// Number of live entries for a user (for the status API).
    pub async fn size(&self, uid: &str) -> usize {
        let pool = self.user_pool(uid).await;
        let p = pool.lock().await;
        p.entries.len()
    }

    async fn build_client(&self, uid: &str) -> EngineResult<OkxClient> {
        let creds = self
            .identity
            .api_credentials(uid)
            .await?
            .ok_or_else(|| EngineError::Config(format!("no API credentials for user {uid}")))?;
        Ok(OkxClient::new(creds.api_key, creds.api_secret, creds.passphrase))
    }

    async fn validate(&self, client: &OkxClient) -> bool {
        matches!(
            tokio::time::timeout(
                Duration::from_secs(VALIDATE_TIMEOUT_SECS),
                client.load_market(VALIDATE_SYMBOL),
            )
            .await,
            Ok(Ok(()))
        )
    }

    fn report_size(&self, uid: &str, size: usize) {
        if let Some(m) = &self.metrics {
            m.pool_size(uid, size);
        }
    }

    fn report_wait(&self, uid: &str, started: Instant) {
        if let Some(m) = &self.metrics {
            m.acquire_wait_secs(uid, started.elapsed().as_secs_f64());
        }
    }
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("max_size", &self.max_size)
            .field("max_age", &self.max_age)
            .finish()
    }
}
