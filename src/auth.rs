//! Gateway API-key authentication middleware.
//!
//! Accepts `x-api-key: <key>` or `Authorization: Bearer <key>`; resolves
//! the key to its user/group and stashes a [`ClientInfo`] extension for
//! the handlers. Claude Code clients are recognized by user-agent.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::models::ClientInfo;
use crate::state::AppState;

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(json!({
            "type": "error",
            "error": { "type": "authentication_error", "message": message }
        })),
    )
        .into_response()
}

fn presented_key(request: &Request) -> Option<String> {
    if let Some(key) = request.headers().get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim().to_string());
    }
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|k| k.trim().to_string())
}

pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let Some(key) = presented_key(&request) else {
        return Err(unauthorized("missing API key"));
    };

    let key_hash = hex::encode(Sha256::digest(key.as_bytes()));
    let record = match state.api_keys.find_by_hash(&key_hash).await {
        Ok(Some(record)) => record,
        Ok(None) => return Err(unauthorized("invalid API key")),
        Err(e) => {
            tracing::error!(error = %e, "API key lookup failed");
            return Err(unauthorized("invalid API key"));
        }
    };

    if record.key_hash.as_bytes().ct_eq(key_hash.as_bytes()).unwrap_u8() != 1 {
        return Err(unauthorized("invalid API key"));
    }
    if record.disabled {
        return Err(unauthorized("API key disabled"));
    }

    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let is_claude_code = user_agent
        .as_deref()
        .map(|ua| ua.starts_with("claude-cli"))
        .unwrap_or(false);
    let ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string());

    request.extensions_mut().insert(ClientInfo {
        api_key_id: record.id,
        user_id: record.user_id,
        group_id: record.group_id,
        is_claude_code,
        user_agent,
        ip,
    });

    Ok(next.run(request).await)
}
