//! OpenAI Responses relay endpoint.

use axum::Extension;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::gateway::{self, ForwardOptions};
use crate::models::ClientInfo;
use crate::state::AppState;

/// POST /responses — forced to the openai platform; sticky bindings live
/// under the `openai:` namespace.
#[utoipa::path(post, path = "/responses", tag = "gateway",
    request_body(content = String, description = "Raw JSON request body"),
    responses(
        (status = 200, description = "Relayed upstream response (SSE or JSON)"),
        (status = 400, description = "Malformed request body"),
        (status = 503, description = "No account available")))]
pub async fn create_response(
    State(state): State<AppState>,
    Extension(client): Extension<ClientInfo>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match gateway::forward(state, client, headers, body, ForwardOptions::responses()).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}
