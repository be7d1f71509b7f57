// =============================================================================
// WebSocket log streams — live journal fan-out per user
// =============================================================================
//
// Clients connect to /telegram/ws/logs/{id} (chat id or exchange UID) and
// receive every new journal entry as it is published on the user's log
// channel. A recent-history snapshot is sent on connect so the client does
// not start from a blank screen.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::store::keys;

/// History entries pushed on connect.
const SNAPSHOT_LIMIT: usize = 20;

pub async fn ws_logs(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, id))
}

pub async fn ws_logs_by_uid(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, uid))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, id: String) {
    let uid = match state.identity.resolve_to_uid(&id).await {
        Ok(uid) => uid,
        Err(e) => {
            warn!(id, error = %e, "WebSocket identity resolution failed");
            return;
        }
    };

    let mut pubsub = match state.store.subscribe(&keys::log_channel(&uid)).await {
        Ok(pubsub) => pubsub,
        Err(e) => {
            warn!(uid, error = %e, "log channel subscribe failed");
            return;
        }
    };

    info!(uid, "log stream connected");
    let (mut sender, mut receiver) = socket.split();

    // Recent history first, oldest of the page last-to-first so the client
    // renders chronologically.
    if let Ok(entries) = state.journal.query(&uid, SNAPSHOT_LIMIT, 0, None, None).await {
        for entry in entries.into_iter().rev() {
            if let Ok(payload) = serde_json::to_string(&entry) {
                if sender.send(Message::Text(payload)).await.is_err() {
                    return;
                }
            }
        }
    }

    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            // ── Store pub/sub → client ──────────────────────────────
            published = stream.next() => {
                match published {
                    Some(msg) => {
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                debug!(uid, error = %e, "unreadable pub/sub payload");
                                continue;
                            }
                        };
                        if let Err(e) = sender.send(Message::Text(payload)).await {
                            debug!(uid, error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    None => {
                        warn!(uid, "log channel closed — disconnecting client");
                        break;
                    }
                }
            }

            // ── Client frames ───────────────────────────────────────
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(uid, "log stream closed by client");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text/binary/pong from the client carry no meaning here.
                    }
                    Some(Err(e)) => {
                        debug!(uid, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }
}
