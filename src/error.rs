// =============================================================================
// Typed error taxonomy — mapped onto HTTP-style status codes at the API seam
// =============================================================================
//
// Background loops never propagate these upward; they log and continue.
// User-facing operations convert them into structured JSON failures via the
// IntoResponse impl below.
// =============================================================================

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};

/// Engine-wide error type. Every fallible operation that crosses a component
/// boundary returns one of these kinds so that callers can branch on retry
/// semantics (§7) without string matching.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Missing or invalid credentials, unknown symbol, malformed settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// Exchange rejected the API key / signature. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Exchange rate limit (HTTP 429 / code 50011). Retried with backoff.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Order or record not found. Cancels/fetches map this to `canceled`.
    #[error("not found: {0}")]
    NotFound(String),

    /// Validation failure in user input (settings constraint, bad enum).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Resource conflict, e.g. deleting a preset still bound to a symbol or
    /// starting a task that is already running.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Connection-level failure talking to the exchange or the store.
    #[error("network error: {0}")]
    Network(String),

    /// Client pool could not produce a client within the retry budget.
    #[error("exchange client pool exhausted for user {0}")]
    PoolExhausted(String),

    /// An internal invariant would be violated (TP ratios, order-graph shape).
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// State store failure that survived the write retry ladder.
    #[error("store error: {0}")]
    Store(String),

    /// Terminal exchange rejection that is neither auth nor rate-limit
    /// (e.g. insufficient margin, instrument suspended). Never retried.
    #[error("exchange rejected request (code {code}): {msg}")]
    Exchange { code: String, msg: String },
}

impl EngineError {
    /// HTTP status this error maps to at the API boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            // Pool exhaustion is deliberately a 500 like other cycle errors.
            Self::Network(_)
            | Self::PoolExhausted(_)
            | Self::Invariant(_)
            | Self::Store(_)
            | Self::Exchange { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the retry ladder may re-attempt the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited(_) | Self::Store(_))
    }

    /// Short machine-readable kind tag used in journal entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Auth(_) => "auth",
            Self::RateLimited(_) => "rate_limited",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::Network(_) => "network",
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::Invariant(_) => "invariant",
            Self::Store(_) => "store",
            Self::Exchange { .. } => "exchange",
        }
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(value: redis::RedisError) -> Self {
        Self::Store(value.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(value: reqwest::Error) -> Self {
        Self::Network(value.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        Self::Store(format!("serialization: {value}"))
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.kind(),
            "detail": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Convenience alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_propagation_policy() {
        assert_eq!(
            EngineError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::Auth("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            EngineError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            EngineError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            EngineError::RateLimited("x".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        // Pool exhaustion is unified with other cycle errors as a 500.
        assert_eq!(
            EngineError::PoolExhausted("123".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn retryable_kinds() {
        assert!(EngineError::Network("t".into()).is_retryable());
        assert!(EngineError::RateLimited("t".into()).is_retryable());
        assert!(!EngineError::Auth("t".into()).is_retryable());
        assert!(!EngineError::NotFound("t".into()).is_retryable());
        assert!(!EngineError::Invariant("t".into()).is_retryable());
    }
}
