//! Health & readiness endpoints.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub app: String,
    pub uptime_seconds: u64,
}

/// GET /health
#[utoipa::path(get, path = "/health", tag = "health",
    responses((status = 200, description = "Service health", body = HealthResponse)))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.is_ready() { "ok" } else { "starting" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        app: "sub2api-gateway".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

/// GET /health/ready — 503 until startup wiring completes.
#[utoipa::path(get, path = "/health/ready", tag = "health",
    responses(
        (status = 200, description = "Ready"),
        (status = 503, description = "Still starting")))]
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
