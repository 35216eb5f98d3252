//! Error taxonomy.
//!
//! WebSocket-surfaced errors carry an [`ErrorCode`] plus a recoverable
//! flag; per-turn errors never tear down the session. The HTTP sidecar has
//! its own response-shaped error type.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Wire-level error codes for `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadEnvelope,
    Unsupported,
    PayloadTooLarge,
    Forbidden,
    AuthFailed,
    SttError,
    LlmError,
    TtsError,
    ProviderUnhealthy,
    RateExceeded,
    Internal,
}

impl ErrorCode {
    /// Whether the connection stays open after this error.
    pub fn recoverable(self) -> bool {
        !matches!(self, ErrorCode::Forbidden | ErrorCode::AuthFailed)
    }
}

/// Action rate limiting error, surfaced in the action path.
#[derive(Debug, Error)]
#[error("rate limit exceeded for {action}: {scope} cap of {limit} reached")]
pub struct ActionRateLimitError {
    pub action: String,
    pub scope: &'static str,
    pub limit: u32,
}

/* ------------------ HTTP sidecar errors ------------------ */

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message.clone(),
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_fatal_codes_are_not_recoverable() {
        assert!(!ErrorCode::AuthFailed.recoverable());
        assert!(!ErrorCode::Forbidden.recoverable());
        assert!(ErrorCode::PayloadTooLarge.recoverable());
        assert!(ErrorCode::LlmError.recoverable());
    }
}
