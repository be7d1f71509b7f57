// =============================================================================
// Presets — named, versioned snapshots of a user's Settings
// =============================================================================
//
// Invariants:
//   - at most one preset per user has is_default=true;
//   - a preset cannot be deleted while any symbol is bound to it;
//   - updating a preset publishes a "reload" on preset:update:{uid}:{sym}
//     for every symbol currently bound to it.
// =============================================================================

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::settings::Settings;
use crate::store::{keys, Store};

const MAX_NAME_LEN: usize = 50;
const MAX_DESCRIPTION_LEN: usize = 200;
const PRESET_ID_LEN: usize = 8;

/// A stored preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub preset_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: String,
    pub updated_at: String,
    pub settings: Settings,
}

/// Request payload for create/update.
#[derive(Debug, Clone, Deserialize)]
pub struct PresetPayload {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_default: bool,
    pub settings: Settings,
}

fn generate_preset_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..PRESET_ID_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn validate_payload(payload: &PresetPayload) -> EngineResult<()> {
    if payload.name.is_empty() || payload.name.chars().count() > MAX_NAME_LEN {
        return Err(EngineError::Validation(format!(
            "preset name must be 1..={MAX_NAME_LEN} characters"
        )));
    }
    if payload.description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::Validation(format!(
            "preset description must be at most {MAX_DESCRIPTION_LEN} characters"
        )));
    }
    payload.settings.validate()
}

/// Store-backed preset management.
#[derive(Clone)]
pub struct PresetRepo {
    store: Store,
}

impl PresetRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, uid: &str, payload: PresetPayload) -> EngineResult<Preset> {
        validate_payload(&payload)?;

        let now = Utc::now().to_rfc3339();
        let preset = Preset {
            preset_id: generate_preset_id(),
            name: payload.name,
            description: payload.description,
            is_default: payload.is_default,
            created_at: now.clone(),
            updated_at: now,
            settings: payload.settings,
        };

        if preset.is_default {
            self.clear_default(uid).await?;
        }

        let raw = serde_json::to_string(&preset)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(keys::preset(uid, &preset.preset_id), raw).ignore();
        pipe.sadd(keys::preset_list(uid), &preset.preset_id).ignore();
        if preset.is_default {
            pipe.set(keys::preset_default(uid), &preset.preset_id).ignore();
        }
        self.store.run_pipeline(pipe).await?;

        info!(uid, preset_id = %preset.preset_id, name = %preset.name, "preset created");
        Ok(preset)
    }

    pub async fn get(&self, uid: &str, preset_id: &str) -> EngineResult<Preset> {
        let raw = self
            .store
            .get(&keys::preset(uid, preset_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("preset {preset_id}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn list(&self, uid: &str) -> EngineResult<Vec<Preset>> {
        let ids = self.store.smembers(&keys::preset_list(uid)).await?;
        let mut presets = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(raw) = self.store.get(&keys::preset(uid, &id)).await? {
                if let Ok(preset) = serde_json::from_str::<Preset>(&raw) {
                    presets.push(preset);
                }
            }
        }
        presets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(presets)
    }

    /// Replace a preset's payload and notify every symbol bound to it.
    pub async fn update(
        &self,
        uid: &str,
        preset_id: &str,
        payload: PresetPayload,
    ) -> EngineResult<Preset> {
        validate_payload(&payload)?;
        let existing = self.get(uid, preset_id).await?;

        if payload.is_default && !existing.is_default {
            self.clear_default(uid).await?;
        }

        let updated = Preset {
            preset_id: existing.preset_id.clone(),
            name: payload.name,
            description: payload.description,
            is_default: payload.is_default,
            created_at: existing.created_at,
            updated_at: Utc::now().to_rfc3339(),
            settings: payload.settings,
        };

        let raw = serde_json::to_string(&updated)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(keys::preset(uid, preset_id), raw).ignore();
        if updated.is_default {
            pipe.set(keys::preset_default(uid), preset_id).ignore();
        } else if existing.is_default {
            pipe.del(keys::preset_default(uid)).ignore();
        }
        self.store.run_pipeline(pipe).await?;

        // Reload notification for every symbol bound to this preset.
        let bound = self.symbols_bound_to(uid, preset_id).await?;
        for symbol in &bound {
            self.store
                .publish(&keys::preset_update_channel(uid, symbol), "reload")
                .await?;
            debug!(uid, preset_id, symbol, "preset reload published");
        }

        info!(uid, preset_id, bound = bound.len(), "preset updated");
        Ok(updated)
    }

    /// Delete a preset. Refused with a conflict while any symbol references
    /// it.
    pub async fn delete(&self, uid: &str, preset_id: &str) -> EngineResult<()> {
        // Existence check first so a missing preset is a 404, not a no-op.
        let preset = self.get(uid, preset_id).await?;

        let bound = self.symbols_bound_to(uid, preset_id).await?;
        if !bound.is_empty() {
            return Err(EngineError::Conflict(format!(
                "preset {preset_id} is bound to symbols: {}",
                bound.join(", ")
            )));
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(keys::preset(uid, preset_id)).ignore();
        pipe.srem(keys::preset_list(uid), preset_id).ignore();
        if preset.is_default {
            pipe.del(keys::preset_default(uid)).ignore();
        }
        self.store.run_pipeline(pipe).await?;

        info!(uid, preset_id, "preset deleted");
        Ok(())
    }

    pub async fn default_preset(&self, uid: &str) -> EngineResult<Option<Preset>> {
        match self.store.get(&keys::preset_default(uid)).await? {
            Some(id) => match self.get(uid, &id).await {
                Ok(p) => Ok(Some(p)),
                Err(EngineError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }

    pub async fn set_default(&self, uid: &str, preset_id: &str) -> EngineResult<Preset> {
        let mut preset = self.get(uid, preset_id).await?;
        self.clear_default(uid).await?;
        preset.is_default = true;
        preset.updated_at = Utc::now().to_rfc3339();
        let raw = serde_json::to_string(&preset)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(keys::preset(uid, preset_id), raw).ignore();
        pipe.set(keys::preset_default(uid), preset_id).ignore();
        self.store.run_pipeline(pipe).await?;
        Ok(preset)
    }

    /// Bind a symbol to a preset so future reloads reach it.
    pub async fn bind_symbol(&self, uid: &str, symbol: &str, preset_id: &str) -> EngineResult<()> {
        // Verify the preset exists before binding.
        self.get(uid, preset_id).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(keys::symbol_preset(uid, symbol), preset_id).ignore();
        pipe.sadd(keys::active_symbols(uid), symbol).ignore();
        self.store.run_pipeline(pipe).await
    }

    pub async fn unbind_symbol(&self, uid: &str, symbol: &str) -> EngineResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(keys::symbol_preset(uid, symbol)).ignore();
        pipe.srem(keys::active_symbols(uid), symbol).ignore();
        self.store.run_pipeline(pipe).await
    }

    async fn symbols_bound_to(&self, uid: &str, preset_id: &str) -> EngineResult<Vec<String>> {
        let symbols = self.store.smembers(&keys::active_symbols(uid)).await?;
        let mut bound = Vec::new();
        for symbol in symbols {
            if let Some(bound_id) = self.store.get(&keys::symbol_preset(uid, &symbol)).await? {
                if bound_id == preset_id {
                    bound.push(symbol);
                }
            }
        }
        Ok(bound)
    }

    async fn clear_default(&self, uid: &str) -> EngineResult<()> {
        if let Some(old_id) = self.store.get(&keys::preset_default(uid)).await? {
            if let Ok(mut old) = self.get(uid, &old_id).await {
                old.is_default = false;
                let raw = serde_json::to_string(&old)?;
                self.store.set(&keys::preset(uid, &old_id), &raw).await?;
            }
            self.store.del(&keys::preset_default(uid)).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_ids_are_8_chars_and_unique_enough() {
        let a = generate_preset_id();
        let b = generate_preset_id();
        assert_eq!(a.len(), PRESET_ID_LEN);
        assert!(a.bytes().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        // Not a proof of uniqueness, but collisions here would be astonishing.
        assert_ne!(a, b);
    }

    #[test]
    fn payload_validation_enforces_lengths() {
        let ok = PresetPayload {
            name: "scalp".into(),
            description: String::new(),
            is_default: false,
            settings: Settings::default(),
        };
        assert!(validate_payload(&ok).is_ok());

        let long_name = PresetPayload {
            name: "x".repeat(51),
            description: String::new(),
            is_default: false,
            settings: Settings::default(),
        };
        assert!(validate_payload(&long_name).is_err());

        let long_desc = PresetPayload {
            name: "ok".into(),
            description: "d".repeat(201),
            is_default: false,
            settings: Settings::default(),
        };
        assert!(validate_payload(&long_desc).is_err());
    }

    #[test]
    fn payload_validation_rejects_bad_settings() {
        let mut settings = Settings::default();
        settings.leverage = 500;
        let payload = PresetPayload {
            name: "bad".into(),
            description: String::new(),
            is_default: false,
            settings,
        };
        assert!(validate_payload(&payload).is_err());
    }
}
