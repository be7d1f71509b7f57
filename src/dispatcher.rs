// =============================================================================
// Message Dispatcher — queued per-user fan-out with rate-limit handling
// =============================================================================
//
// Every user gets a FIFO queue (`telegram:queue:{uid}`) drained by a single
// worker task guarded by a 60 s `processing` flag. A process-wide semaphore
// caps concurrent chat-API sends at 3. Send outcomes split into four
// classes: authorisation-denied and bad-request terminate, rate-limited
// suspends the worker for the advertised interval, transient failures retry
// up to 3 times at 1 s.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::identity::IdentityResolver;
use crate::journal::{Journal, LogEntry};
use crate::store::{keys, Store};
use crate::types::EventCategory;

/// Maximum concurrent outbound chat-API calls across all users.
const SEND_CONCURRENCY: usize = 3;
/// Retry policy for transient send failures.
const SEND_RETRIES: u32 = 3;
const SEND_RETRY_INTERVAL_SECS: u64 = 1;
/// Processing-flag TTL; refreshed while a worker is draining.
const PROCESSING_TTL_SECS: u64 = 60;

/// Outcome classes of one chat-API send attempt.
#[derive(Debug)]
pub enum SendError {
    /// The recipient blocked the bot. Terminate permanently.
    AuthorizationDenied,
    /// Malformed request (bad chat id, bad markup). Terminate this message.
    BadRequest(String),
    /// Back off for `retry_after` seconds, then retry.
    RateLimited { retry_after: u64 },
    /// Network-level failure; bounded retry applies.
    Transient(String),
}

/// Boundary contract over the chat front-end.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str, html: bool)
        -> Result<String, SendError>;
}

/// Chat stub that swallows messages; used when no bot endpoint is wired in.
pub struct NoopChat;

#[async_trait]
impl ChatApi for NoopChat {
    async fn send_message(
        &self,
        _chat_id: &str,
        _text: &str,
        _html: bool,
    ) -> Result<String, SendError> {
        Ok(String::new())
    }
}

/// Chat front-end reached over HTTP. The endpoint takes
/// `{chat_id, text, html}` and answers 200 with a message id, 401/403 for a
/// blocked recipient, 400 for malformed input, or 429 with a `retry_after`
/// field.
pub struct HttpChat {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpChat {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            endpoint: endpoint.into(),
            http,
        }
    }
}

#[async_trait]
impl ChatApi for HttpChat {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        html: bool,
    ) -> Result<String, SendError> {
        let body = serde_json::json!({ "chat_id": chat_id, "text": text, "html": html });
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Transient(e.to_string()))?;

        let status = resp.status();
        let payload: serde_json::Value = resp.json().await.unwrap_or_default();

        match status.as_u16() {
            200..=299 => Ok(payload
                .get("message_id")
                .map(|v| v.to_string())
                .unwrap_or_default()),
            401 | 403 => Err(SendError::AuthorizationDenied),
            400 => Err(SendError::BadRequest(
                payload
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("bad request")
                    .to_string(),
            )),
            429 => Err(SendError::RateLimited {
                retry_after: payload
                    .get("retry_after")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(5),
            }),
            _ => Err(SendError::Transient(format!("chat API returned {status}"))),
        }
    }
}

/// One queued message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedMessage {
    text: String,
    category: String,
    enqueued_at: i64,
}

/// Per-user serial dispatch of user-visible notifications.
pub struct MessageDispatcher {
    store: Store,
    identity: Arc<IdentityResolver>,
    chat: Arc<dyn ChatApi>,
    journal: Journal,
    send_permits: Arc<Semaphore>,
    /// Users with an in-process worker task.
    active_workers: Mutex<HashSet<String>>,
    /// Recipients that denied authorisation; never contacted again.
    blocked: Mutex<HashSet<String>>,
}

impl MessageDispatcher {
    pub fn new(
        store: Store,
        identity: Arc<IdentityResolver>,
        chat: Arc<dyn ChatApi>,
        journal: Journal,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            identity,
            chat,
            journal,
            send_permits: Arc::new(Semaphore::new(SEND_CONCURRENCY)),
            active_workers: Mutex::new(HashSet::new()),
            blocked: Mutex::new(HashSet::new()),
        })
    }

    /// Queue a message for `uid` and make sure a worker is draining.
    pub async fn enqueue(
        self: &Arc<Self>,
        uid: &str,
        text: &str,
        category: EventCategory,
    ) -> EngineResult<()> {
        let message = QueuedMessage {
            text: text.to_string(),
            category: category.as_str().to_string(),
            enqueued_at: chrono::Utc::now().timestamp(),
        };
        self.store
            .rpush(&keys::message_queue(uid), &serde_json::to_string(&message)?)
            .await?;
        self.spawn_worker_if_idle(uid).await;
        Ok(())
    }

    async fn spawn_worker_if_idle(self: &Arc<Self>, uid: &str) {
        {
            let mut workers = self.active_workers.lock();
            if workers.contains(uid) {
                return;
            }
            workers.insert(uid.to_string());
        }

        // The processing flag protects against a second process picking up
        // the same queue; in-process duplication is handled above.
        let flag_set = self
            .store
            .set_nx_ex(&keys::queue_processing(uid), "1", PROCESSING_TTL_SECS)
            .await
            .unwrap_or(false);
        if !flag_set {
            self.active_workers.lock().remove(uid);
            return;
        }

        let dispatcher = self.clone();
        let worker_uid = uid.to_string();
        tokio::spawn(async move {
            dispatcher.drain_queue(&worker_uid).await;
            let _ = dispatcher
                .store
                .del(&keys::queue_processing(&worker_uid))
                .await;
            dispatcher.active_workers.lock().remove(&worker_uid);
        });
    }

    async fn drain_queue(self: &Arc<Self>, uid: &str) {
        debug!(uid, "dispatch worker started");
        loop {
            // Keep the processing flag alive while draining.
            let _ = self
                .store
                .set_ex(&keys::queue_processing(uid), "1", PROCESSING_TTL_SECS)
                .await;

            let raw = match self.store.lpop(&keys::message_queue(uid)).await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    warn!(uid, error = %e, "queue pop failed — worker exiting");
                    break;
                }
            };

            let Ok(message) = serde_json::from_str::<QueuedMessage>(&raw) else {
                warn!(uid, "malformed queued message dropped");
                continue;
            };
            self.deliver(uid, &message).await;
        }
        debug!(uid, "dispatch worker drained");
    }

    async fn deliver(self: &Arc<Self>, uid: &str, message: &QueuedMessage) {
        if self.blocked.lock().contains(uid) {
            self.bump_stats(uid, &message.category, false).await;
            return;
        }

        // Silent downgrade when the user has no linked chat id.
        let chat_id = match self.identity.resolve_to_chat_id(uid).await {
            Ok(Some(chat_id)) => chat_id,
            Ok(None) => {
                debug!(uid, "no linked chat id — message downgraded to journal only");
                self.fan_to_journal(uid, message, None).await;
                return;
            }
            Err(e) => {
                warn!(uid, error = %e, "chat id resolution failed");
                self.bump_stats(uid, &message.category, false).await;
                return;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            // The semaphore is never closed, so acquisition cannot fail.
            let permit = self.send_permits.clone().acquire_owned().await.ok();
            let result = self
                .chat
                .send_message(&chat_id, &message.text, true)
                .await;
            drop(permit);

            match result {
                Ok(message_id) => {
                    self.bump_stats(uid, &message.category, true).await;
                    self.fan_to_journal(uid, message, Some(message_id)).await;
                    return;
                }
                Err(SendError::AuthorizationDenied) => {
                    warn!(uid, chat_id, "recipient denied authorisation — blocking");
                    self.blocked.lock().insert(uid.to_string());
                    self.bump_stats(uid, &message.category, false).await;
                    return;
                }
                Err(SendError::BadRequest(reason)) => {
                    warn!(uid, reason, "bad-request from chat API — dropping message");
                    self.bump_stats(uid, &message.category, false).await;
                    return;
                }
                Err(SendError::RateLimited { retry_after }) => {
                    info!(uid, retry_after, "chat API rate limit — suspending worker");
                    tokio::time::sleep(Duration::from_secs(retry_after.max(1))).await;
                    // Rate limits do not consume a retry attempt.
                }
                Err(SendError::Transient(reason)) if attempt < SEND_RETRIES => {
                    debug!(uid, reason, attempt, "transient send failure — retrying");
                    tokio::time::sleep(Duration::from_secs(SEND_RETRY_INTERVAL_SECS)).await;
                    attempt += 1;
                }
                Err(SendError::Transient(reason)) => {
                    warn!(uid, reason, "send failed after retries");
                    self.bump_stats(uid, &message.category, false).await;
                    return;
                }
            }
        }
    }

    async fn fan_to_journal(&self, uid: &str, message: &QueuedMessage, message_id: Option<String>) {
        let mut entry = LogEntry::new(uid, "message_sent", EventCategory::Info, &message.text);
        entry.category = message.category.clone();
        entry.message_id = message_id;
        self.journal.record(entry).await;
    }

    async fn bump_stats(&self, uid: &str, category: &str, success: bool) {
        let key = keys::message_stats(uid);
        let _ = self.store.hincr(&key, "total", 1).await;
        let _ = self
            .store
            .hincr(&key, if success { "success" } else { "failed" }, 1)
            .await;
        let _ = self
            .store
            .hincr(&key, &format!("category:{category}"), 1)
            .await;
    }

    /// Per-user send counters for the stats endpoint.
    pub async fn stats(&self, uid: &str) -> EngineResult<HashMap<String, String>> {
        self.store.hgetall(&keys::message_stats(uid)).await
    }
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("active_workers", &self.active_workers.lock().len())
            .field("blocked", &self.blocked.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_message_roundtrip() {
        let message = QueuedMessage {
            text: "TP1 filled".into(),
            category: "tp".into(),
            enqueued_at: 1_700_000_000,
        };
        let raw = serde_json::to_string(&message).unwrap();
        let back: QueuedMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.text, "TP1 filled");
        assert_eq!(back.category, "tp");
    }

    #[tokio::test]
    async fn noop_chat_always_succeeds() {
        let chat = NoopChat;
        let result = chat.send_message("123", "hello", true).await;
        assert!(result.is_ok());
    }
}
