// =============================================================================
// Identity Resolver — chat-ID ↔ exchange-UID bidirectional mapping
// =============================================================================
//
// Chat IDs are at most 11 digits; exchange UIDs are 12+. The forward mapping
// lives at `user:{chat_id}:okx_uid`, the reverse at
// `okx_uid_to_telegram:{uid}`. Both directions are written in one atomic
// pipeline, and a chat-id reassignment clears the previous edge first so the
// round-trip invariant holds for every stored pair.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineResult;
use crate::store::{keys, Store};

/// Exchange API credentials stored per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

/// Boundary contract for the upstream account-provisioning directory. The
/// concrete implementation lives outside this crate; a no-op stub is used
/// when no directory is configured.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up the chat id linked to an exchange UID.
    async fn chat_id_for(&self, uid: &str) -> EngineResult<Option<String>>;

    /// Fetch API credentials for an exchange UID.
    async fn credentials_for(&self, uid: &str) -> EngineResult<Option<ApiCredentials>>;
}

/// Directory stub used when no upstream record store is wired in.
pub struct NoDirectory;

#[async_trait]
impl UserDirectory for NoDirectory {
    async fn chat_id_for(&self, _uid: &str) -> EngineResult<Option<String>> {
        Ok(None)
    }

    async fn credentials_for(&self, _uid: &str) -> EngineResult<Option<ApiCredentials>> {
        Ok(None)
    }
}

/// True when `id` looks like a chat id rather than an exchange UID.
pub fn is_chat_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 11 && id.bytes().all(|b| b.is_ascii_digit())
}

/// Reverse lookups additionally sanity-check the stored chat id.
fn is_valid_chat_id(id: &str) -> bool {
    id.bytes().all(|b| b.is_ascii_digit()) && (6..15).contains(&id.len())
}

/// Resolves identities against the store with an optional external directory
/// as the last fallback.
pub struct IdentityResolver {
    store: Store,
    directory: Arc<dyn UserDirectory>,
}

impl IdentityResolver {
    pub fn new(store: Store, directory: Arc<dyn UserDirectory>) -> Self {
        Self { store, directory }
    }

    /// Resolve an incoming identifier to an exchange UID.
    ///
    /// Identifiers of 11 digits or fewer are treated as chat ids and mapped
    /// through `user:{id}:okx_uid`; when no mapping exists the input is
    /// returned unchanged and the caller must tolerate it. Anything else is
    /// already a UID.
    pub async fn resolve_to_uid(&self, id: &str) -> EngineResult<String> {
        if !is_chat_id(id) {
            return Ok(id.to_string());
        }
        match self.store.get(&keys::okx_uid_of_chat(id)).await? {
            Some(uid) => Ok(uid),
            None => {
                debug!(chat_id = id, "no uid mapping — returning input unchanged");
                Ok(id.to_string())
            }
        }
    }

    /// Resolve an exchange UID back to a chat id, trying in order:
    /// 1. cursor-scan of `user:*:okx_uid`, newest `last_trade_date` first;
    /// 2. the reverse key `okx_uid_to_telegram:{uid}`;
    /// 3. the external user directory, caching any hit under the reverse key.
    ///
    /// Returns `None` on every miss; never errors on an empty result.
    pub async fn resolve_to_chat_id(&self, uid: &str) -> EngineResult<Option<String>> {
        if uid.is_empty() {
            warn!("resolve_to_chat_id called with empty uid");
            return Ok(None);
        }

        // 1. Scan the forward mappings.
        let mut candidates: Vec<(String, i64)> = Vec::new();
        for key in self.store.scan_match(keys::okx_uid_pattern()).await? {
            let Some(chat_id) = keys::parse_okx_uid_key(&key) else {
                continue;
            };
            let Some(stored) = self.store.get(&key).await? else {
                continue;
            };
            if stored == uid && is_valid_chat_id(&chat_id) {
                let last_trade = self
                    .store
                    .get(&format!("user:{chat_id}:last_trade_date"))
                    .await?
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                candidates.push((chat_id, last_trade));
            }
        }
        if !candidates.is_empty() {
            candidates.sort_by(|a, b| b.1.cmp(&a.1));
            return Ok(Some(candidates.remove(0).0));
        }

        // 2. Reverse key.
        if let Some(chat_id) = self.store.get(&keys::chat_of_okx_uid(uid)).await? {
            if is_valid_chat_id(&chat_id) {
                return Ok(Some(chat_id));
            }
            // Bad data under the reverse key: clear it.
            self.store.del(&keys::chat_of_okx_uid(uid)).await?;
        }

        // 3. External directory, cached back under the reverse key.
        match self.directory.chat_id_for(uid).await {
            Ok(Some(chat_id)) if is_valid_chat_id(&chat_id) => {
                self.store
                    .set(&keys::chat_of_okx_uid(uid), &chat_id)
                    .await?;
                Ok(Some(chat_id))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(uid, error = %e, "user directory lookup failed");
                Ok(None)
            }
        }
    }

    /// Write both mapping directions in one atomic pipeline. A chat id that
    /// previously pointed at a different UID has its old reverse edge cleared
    /// first so the two directions stay in lockstep.
    pub async fn store_mapping(&self, chat_id: &str, uid: &str) -> EngineResult<()> {
        let previous = self.store.get(&keys::okx_uid_of_chat(chat_id)).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(old_uid) = previous.filter(|old| old != uid) {
            pipe.del(keys::chat_of_okx_uid(&old_uid)).ignore();
        }
        pipe.set(keys::okx_uid_of_chat(chat_id), uid).ignore();
        pipe.set(keys::chat_of_okx_uid(uid), chat_id).ignore();
        self.store.run_pipeline(pipe).await?;

        debug!(chat_id, uid, "identity mapping stored");
        Ok(())
    }

    /// Remove both directions of the mapping for `chat_id`.
    pub async fn clear_mapping(&self, chat_id: &str) -> EngineResult<()> {
        if let Some(uid) = self.store.get(&keys::okx_uid_of_chat(chat_id)).await? {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.del(keys::okx_uid_of_chat(chat_id)).ignore();
            pipe.del(keys::chat_of_okx_uid(&uid)).ignore();
            self.store.run_pipeline(pipe).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Credentials
    // -------------------------------------------------------------------------

    /// Load API credentials for `uid`, hydrating from the external directory
    /// when the store has none.
    pub async fn api_credentials(&self, uid: &str) -> EngineResult<Option<ApiCredentials>> {
        let stored = self.store.hgetall(&keys::api_keys(uid)).await?;
        if let (Some(key), Some(secret), Some(passphrase)) = (
            stored.get("api_key"),
            stored.get("api_secret"),
            stored.get("passphrase"),
        ) {
            if !key.is_empty() && !secret.is_empty() {
                return Ok(Some(ApiCredentials {
                    api_key: key.clone(),
                    api_secret: secret.clone(),
                    passphrase: passphrase.clone(),
                }));
            }
        }

        match self.directory.credentials_for(uid).await? {
            Some(creds) => {
                self.save_credentials(uid, &creds).await?;
                Ok(Some(creds))
            }
            None => Ok(None),
        }
    }

    pub async fn save_credentials(&self, uid: &str, creds: &ApiCredentials) -> EngineResult<()> {
        self.store
            .hset_multiple(
                &keys::api_keys(uid),
                &[
                    ("api_key".into(), creds.api_key.clone()),
                    ("api_secret".into(), creds.api_secret.clone()),
                    ("passphrase".into(), creds.passphrase.clone()),
                ],
            )
            .await
    }
}

/// One-shot key-schema migration: for every chat-id → uid link, copy the
/// chat-id-keyed runtime keys (preferences, task_id, per-symbol status)
/// forward to the uid form where the uid form is still empty. Readers
/// consult both schemas during the transition window; writers only ever
/// produce the uid form, so this converges.
pub async fn migrate_chat_scoped_keys(store: &Store) -> EngineResult<usize> {
    let mut migrated = 0usize;

    for key in store.scan_match(keys::okx_uid_pattern()).await? {
        let Some(chat_id) = keys::parse_okx_uid_key(&key) else {
            continue;
        };
        let Some(uid) = store.get(&key).await? else {
            continue;
        };
        if uid == chat_id {
            continue;
        }

        // Preferences hash.
        let legacy_prefs = store.hgetall(&keys::legacy::preferences(&chat_id)).await?;
        if !legacy_prefs.is_empty() {
            let current = store.hgetall(&keys::preferences(&uid)).await?;
            if current.is_empty() {
                let fields: Vec<(String, String)> = legacy_prefs.into_iter().collect();
                store.hset_multiple(&keys::preferences(&uid), &fields).await?;
                migrated += 1;
            }
        }

        // Task id.
        if let Some(task_id) = store.get(&keys::legacy::task_id(&chat_id)).await? {
            if store.get(&keys::task_id(&uid)).await?.is_none() {
                store.set(&keys::task_id(&uid), &task_id).await?;
                migrated += 1;
            }
        }

        // Per-symbol statuses.
        for status_key in store
            .scan_match(&format!("user:{chat_id}:symbol:*:status"))
            .await?
        {
            let Some((_, symbol)) = keys::parse_symbol_status_key(&status_key) else {
                continue;
            };
            let Some(status) = store.get(&status_key).await? else {
                continue;
            };
            let uid_key = keys::symbol_status(&uid, &symbol);
            if store.get(&uid_key).await?.is_none() {
                store.set(&uid_key, &status).await?;
                migrated += 1;
            }
        }
    }

    if migrated > 0 {
        debug!(migrated, "chat-scoped keys copied forward to uid schema");
    }
    Ok(migrated)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_id_detection() {
        assert!(is_chat_id("12345678901")); // 11 digits
        assert!(is_chat_id("123456"));
        assert!(!is_chat_id("123456789012")); // 12 digits → uid
        assert!(!is_chat_id("12ab34"));
        assert!(!is_chat_id(""));
    }

    #[test]
    fn reverse_lookup_validity_window() {
        assert!(is_valid_chat_id("123456"));
        assert!(is_valid_chat_id("12345678901234")); // 14 digits
        assert!(!is_valid_chat_id("12345")); // too short
        assert!(!is_valid_chat_id("123456789012345")); // 15 digits
        assert!(!is_valid_chat_id("12a456"));
    }
}
