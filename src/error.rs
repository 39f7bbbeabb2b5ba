//! Gateway error taxonomy and the stable client-facing JSON shapes.
//!
//! Client bodies never carry credential material, internal URLs, or account
//! identifiers; upstream detail is logged (truncated) but not surfaced except
//! for 400 passthrough.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("no available accounts")]
    NoAccountAvailable { model: Option<String> },

    #[error("this API key only serves Claude Code clients")]
    ClaudeCodeOnly,

    #[error("fallback group cycle detected")]
    FallbackCycle,

    /// Terminal upstream failure after retries/failover were exhausted.
    #[error("upstream returned status {status}")]
    Upstream { status: u16, body: String },

    #[error("account concurrency queue is full")]
    Saturated,

    #[error("timed out waiting for an account slot")]
    SlotTimeout,

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn no_account(model: Option<&str>) -> Self {
        GatewayError::NoAccountAvailable {
            model: model.map(|m| m.to_string()),
        }
    }

    /// Stable `{type:"error", error:{type, message}}` body plus HTTP status.
    pub fn client_response(&self) -> (StatusCode, Value) {
        match self {
            GatewayError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                error_body("invalid_request_error", msg),
            ),
            GatewayError::NoAccountAvailable { model } => {
                let msg = match model {
                    Some(m) => format!("no available accounts supporting model {m}"),
                    None => "no available accounts".to_string(),
                };
                (StatusCode::SERVICE_UNAVAILABLE, error_body("api_error", &msg))
            }
            GatewayError::ClaudeCodeOnly => (
                StatusCode::FORBIDDEN,
                error_body(
                    "permission_error",
                    "this API key only serves Claude Code clients",
                ),
            ),
            GatewayError::FallbackCycle => (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("api_error", "group fallback configuration error"),
            ),
            GatewayError::Upstream { status, body } => upstream_client_response(*status, body),
            GatewayError::Saturated | GatewayError::SlotTimeout => (
                StatusCode::SERVICE_UNAVAILABLE,
                error_body("overloaded_error", "no available accounts"),
            ),
            GatewayError::Internal(err) => {
                tracing::error!(error = %err, "internal gateway error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_body("api_error", "internal server error"),
                )
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, body) = self.client_response();
        (status, Json(body)).into_response()
    }
}

fn error_body(kind: &str, message: &str) -> Value {
    json!({ "type": "error", "error": { "type": kind, "message": message } })
}

/// Terminal upstream statuses map to generic, sanitized messages. 400 is the
/// exception: the upstream body passes through so clients can fix requests.
fn upstream_client_response(status: u16, body: &str) -> (StatusCode, Value) {
    let http = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    match status {
        400 => match serde_json::from_str::<Value>(body) {
            Ok(v) => (http, v),
            Err(_) => (http, error_body("invalid_request_error", "bad request")),
        },
        401 | 403 => (
            http,
            error_body("authentication_error", "auth failed / forbidden, contact admin"),
        ),
        429 => (http, error_body("rate_limit_error", "rate limit exceeded")),
        529 => (http, error_body("overloaded_error", "overloaded")),
        s if s >= 500 => (
            StatusCode::BAD_GATEWAY,
            error_body("api_error", "upstream temporarily unavailable"),
        ),
        _ => (http, error_body("api_error", "upstream error")),
    }
}
