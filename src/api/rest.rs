// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Trading control, user registration and identity mapping, settings and
// preset CRUD, message enqueueing, log queries, and health checks. Errors
// surface as structured JSON with HTTP-style codes via EngineError's
// IntoResponse impl.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::error::{EngineError, EngineResult};
use crate::identity::ApiCredentials;
use crate::preset::PresetPayload;
use crate::settings::{DualSideSettings, Settings};
use crate::store::keys;
use crate::types::EventCategory;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Trading control ─────────────────────────────────────────
        .route("/trading/start", post(trading_start))
        .route("/trading/stop", post(trading_stop))
        .route("/trading/start_all_users", post(trading_start_all))
        .route("/trading/stop_all_running_users", post(trading_stop_all))
        .route("/trading/running_users", get(trading_running_users))
        .route("/trading/status/:uid", get(trading_status))
        .route("/trading/status/:uid/:symbol", get(trading_status_symbol))
        // ── Users & identity ────────────────────────────────────────
        .route("/user/register", post(user_register))
        .route("/user/:uid", get(user_get))
        .route("/user/:uid/okx_uid", get(user_mapping_get).post(user_mapping_set))
        .route("/user/okx/:uid/telegram", get(user_reverse_lookup))
        // ── Settings ────────────────────────────────────────────────
        .route("/settings/:uid", get(settings_get).put(settings_put))
        .route(
            "/settings/:uid/dual_side",
            get(dual_side_get).put(dual_side_put),
        )
        .route("/settings/:uid/reset", post(settings_reset))
        // ── Presets ─────────────────────────────────────────────────
        .route("/presets/:uid", get(presets_list).post(presets_create))
        .route(
            "/presets/:uid/:preset_id",
            get(presets_get).put(presets_update).delete(presets_delete),
        )
        .route("/presets/:uid/:preset_id/default", post(presets_set_default))
        .route(
            "/presets/:uid/:preset_id/symbols/:symbol",
            post(presets_bind_symbol).delete(presets_unbind_symbol),
        )
        // ── Messaging & logs ────────────────────────────────────────
        .route("/telegram/messages/:uid", post(telegram_enqueue))
        .route("/telegram/logs/:uid", get(telegram_logs))
        .route("/telegram/logs/by_okx_uid/:uid", get(telegram_logs_by_uid))
        .route("/telegram/stats/:uid", get(telegram_stats))
        // ── WebSocket log streams ───────────────────────────────────
        .route("/telegram/ws/logs/:uid", get(crate::api::ws::ws_logs))
        .route(
            "/telegram/ws/logs/by_okx_uid/:uid",
            get(crate::api::ws::ws_logs_by_uid),
        )
        // ── Health ──────────────────────────────────────────────────
        .route("/status/", get(status_root))
        .route("/status/redis", get(status_redis))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Trading control
// =============================================================================

#[derive(Deserialize)]
struct StartBody {
    user_id: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    timeframe: Option<String>,
}

#[derive(Deserialize)]
struct StartQuery {
    #[serde(default)]
    restart: Option<bool>,
}

async fn trading_start(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StartQuery>,
    Json(body): Json<StartBody>,
) -> EngineResult<impl IntoResponse> {
    let result = state
        .scheduler
        .start(
            &body.user_id,
            body.symbol.as_deref(),
            body.timeframe.as_deref(),
            query.restart.unwrap_or(false),
        )
        .await?;
    Ok(Json(serde_json::to_value(result)?))
}

#[derive(Deserialize)]
struct StopBody {
    #[serde(default)]
    okx_uid: Option<String>,
}

#[derive(Deserialize)]
struct StopQuery {
    #[serde(default)]
    user_id: Option<String>,
}

async fn trading_stop(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StopQuery>,
    body: Option<Json<StopBody>>,
) -> EngineResult<impl IntoResponse> {
    let user_id = body
        .and_then(|Json(b)| b.okx_uid)
        .or(query.user_id)
        .ok_or_else(|| EngineError::Validation("okx_uid or user_id required".into()))?;
    let uid = state.scheduler.stop(&user_id).await?;
    Ok(Json(serde_json::json!({ "okx_uid": uid, "status": "stopped" })))
}

async fn trading_start_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result = state.scheduler.start_all_running_users().await;
    Json(serde_json::json!({
        "restarted_users": result.restarted_users,
        "errors": result.errors,
    }))
}

async fn trading_stop_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result = state.scheduler.stop_all_running_users().await;
    Json(serde_json::json!({
        "stopped_users": result.restarted_users,
        "errors": result.errors,
    }))
}

async fn trading_running_users(
    State(state): State<Arc<AppState>>,
) -> EngineResult<impl IntoResponse> {
    let users = state.scheduler.running_users().await?;
    Ok(Json(serde_json::json!({ "running_users": users })))
}

async fn trading_status(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    Ok(Json(state.scheduler.status(&uid, None).await?))
}

async fn trading_status_symbol(
    State(state): State<Arc<AppState>>,
    Path((uid, symbol)): Path<(String, String)>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    Ok(Json(state.scheduler.status(&uid, Some(&symbol)).await?))
}

// =============================================================================
// Users & identity
// =============================================================================

#[derive(Deserialize)]
struct RegisterBody {
    user_id: String,
    api_key: String,
    api_secret: String,
    passphrase: String,
}

async fn user_register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> EngineResult<impl IntoResponse> {
    if body.api_key.is_empty() || body.api_secret.is_empty() {
        return Err(EngineError::Validation("api_key and api_secret required".into()));
    }
    let uid = state.identity.resolve_to_uid(&body.user_id).await?;
    state
        .identity
        .save_credentials(
            &uid,
            &ApiCredentials {
                api_key: body.api_key,
                api_secret: body.api_secret,
                passphrase: body.passphrase,
            },
        )
        .await?;
    // Materialise default settings on registration.
    state.settings.get(&uid).await?;
    state
        .store
        .hset(
            &keys::stats(&uid),
            "registration_date",
            &chrono::Utc::now().to_rfc3339(),
        )
        .await?;

    info!(uid, "user registered");
    Ok(Json(serde_json::json!({ "okx_uid": uid, "registered": true })))
}

async fn user_get(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    let has_credentials = state.identity.api_credentials(&uid).await?.is_some();
    let stats = state.store.hgetall(&keys::stats(&uid)).await?;
    let status = state.scheduler.status(&uid, None).await?;
    let pool_size = state.pool.size(&uid).await;
    Ok(Json(serde_json::json!({
        "okx_uid": uid,
        "has_credentials": has_credentials,
        "stats": stats,
        "trading": status,
        "pool_size": pool_size,
    })))
}

async fn user_mapping_get(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let resolved = state.identity.resolve_to_uid(&uid).await?;
    Ok(Json(serde_json::json!({ "input": uid, "okx_uid": resolved })))
}

#[derive(Deserialize)]
struct MappingBody {
    okx_uid: String,
}

async fn user_mapping_set(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    Json(body): Json<MappingBody>,
) -> EngineResult<impl IntoResponse> {
    if body.okx_uid.len() < 12 {
        return Err(EngineError::Validation(
            "okx_uid must be at least 12 digits".into(),
        ));
    }
    state.identity.store_mapping(&chat_id, &body.okx_uid).await?;
    Ok(Json(serde_json::json!({
        "chat_id": chat_id,
        "okx_uid": body.okx_uid,
    })))
}

async fn user_reverse_lookup(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let chat_id = state.identity.resolve_to_chat_id(&uid).await?;
    Ok(Json(serde_json::json!({ "okx_uid": uid, "chat_id": chat_id })))
}

// =============================================================================
// Settings
// =============================================================================

async fn settings_get(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    Ok(Json(state.settings.get(&uid).await?))
}

async fn settings_put(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    Json(settings): Json<Settings>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    state.settings.put(&uid, &settings).await?;
    Ok(Json(settings))
}

async fn settings_reset(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    Ok(Json(state.settings.reset(&uid).await?))
}

async fn dual_side_get(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    Ok(Json(state.settings.get_dual_side(&uid).await?))
}

async fn dual_side_put(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    Json(settings): Json<DualSideSettings>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    state.settings.put_dual_side(&uid, &settings).await?;
    Ok(Json(settings))
}

// =============================================================================
// Presets
// =============================================================================

async fn presets_list(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    Ok(Json(state.presets.list(&uid).await?))
}

async fn presets_create(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    Json(payload): Json<PresetPayload>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    Ok(Json(state.presets.create(&uid, payload).await?))
}

async fn presets_get(
    State(state): State<Arc<AppState>>,
    Path((uid, preset_id)): Path<(String, String)>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    Ok(Json(state.presets.get(&uid, &preset_id).await?))
}

async fn presets_update(
    State(state): State<Arc<AppState>>,
    Path((uid, preset_id)): Path<(String, String)>,
    Json(payload): Json<PresetPayload>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    Ok(Json(state.presets.update(&uid, &preset_id, payload).await?))
}

async fn presets_delete(
    State(state): State<Arc<AppState>>,
    Path((uid, preset_id)): Path<(String, String)>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    state.presets.delete(&uid, &preset_id).await?;
    Ok(Json(serde_json::json!({ "deleted": preset_id })))
}

async fn presets_set_default(
    State(state): State<Arc<AppState>>,
    Path((uid, preset_id)): Path<(String, String)>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    Ok(Json(state.presets.set_default(&uid, &preset_id).await?))
}

async fn presets_bind_symbol(
    State(state): State<Arc<AppState>>,
    Path((uid, preset_id, symbol)): Path<(String, String, String)>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    state.presets.bind_symbol(&uid, &symbol, &preset_id).await?;
    Ok(Json(serde_json::json!({ "symbol": symbol, "preset_id": preset_id })))
}

async fn presets_unbind_symbol(
    State(state): State<Arc<AppState>>,
    Path((uid, _preset_id, symbol)): Path<(String, String, String)>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    state.presets.unbind_symbol(&uid, &symbol).await?;
    Ok(Json(serde_json::json!({ "symbol": symbol, "unbound": true })))
}

// =============================================================================
// Messaging & logs
// =============================================================================

#[derive(Deserialize)]
struct MessageQuery {
    message: String,
}

async fn telegram_enqueue(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    Query(query): Query<MessageQuery>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    state
        .dispatcher
        .enqueue(&uid, &query.message, EventCategory::Info)
        .await?;
    Ok(Json(serde_json::json!({ "queued": true })))
}

#[derive(Deserialize)]
struct LogQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    strategy_type: Option<String>,
}

async fn telegram_logs(
    state: State<Arc<AppState>>,
    path: Path<String>,
    query: Query<LogQuery>,
) -> EngineResult<impl IntoResponse> {
    telegram_logs_by_uid(state, path, query).await
}

async fn telegram_logs_by_uid(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    Query(query): Query<LogQuery>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    let entries = state
        .journal
        .query(
            &uid,
            query.limit.unwrap_or(50).min(500),
            query.offset.unwrap_or(0),
            query.category.as_deref(),
            query.strategy_type.as_deref(),
        )
        .await?;
    let total = state.journal.count(&uid).await?;
    Ok(Json(serde_json::json!({ "total": total, "logs": entries })))
}

async fn telegram_stats(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let uid = state.identity.resolve_to_uid(&uid).await?;
    let counters = state.dispatcher.stats(&uid).await?;
    let queue_len = state.store.llen(&keys::message_queue(&uid)).await?;
    Ok(Json(serde_json::json!({
        "counters": counters,
        "queue_len": queue_len,
    })))
}

// =============================================================================
// Health
// =============================================================================

async fn status_root(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn status_redis(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => Json(serde_json::json!({ "redis": "ok" })).into_response(),
        Err(e) => e.into_response(),
    }
}
