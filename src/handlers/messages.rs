//! Anthropic Messages relay endpoints.

use axum::Extension;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::gateway::{self, ForwardOptions};
use crate::models::ClientInfo;
use crate::state::AppState;

/// POST /v1/messages
#[utoipa::path(post, path = "/v1/messages", tag = "gateway",
    request_body(content = String, description = "Raw JSON request body"),
    responses(
        (status = 200, description = "Relayed upstream response (SSE or JSON)"),
        (status = 400, description = "Malformed request body"),
        (status = 503, description = "No account available")))]
pub async fn create_message(
    State(state): State<AppState>,
    Extension(client): Extension<ClientInfo>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match gateway::forward(state, client, headers, body, ForwardOptions::messages()).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

/// POST /v1/messages/count_tokens — unbilled, non-streaming passthrough.
#[utoipa::path(post, path = "/v1/messages/count_tokens", tag = "gateway",
    request_body(content = String, description = "Raw JSON request body"),
    responses(
        (status = 200, description = "Token count from upstream"),
        (status = 400, description = "Malformed request body")))]
pub async fn count_tokens(
    State(state): State<AppState>,
    Extension(client): Extension<ClientInfo>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match gateway::forward(state, client, headers, body, ForwardOptions::count_tokens()).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}
