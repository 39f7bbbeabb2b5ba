pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod identity;
pub mod memory;
pub mod models;
pub mod parser;
pub mod ratelimit;
pub mod retry;
pub mod scheduler;
pub mod secrets;
pub mod services;
pub mod session;
pub mod slots;
pub mod sse;
pub mod state;
pub mod sticky;
pub mod storage;
pub mod toolnames;
pub mod transform;
pub mod upstream;
pub mod usage;
pub mod watchdog;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use utoipa::OpenApi;

use state::AppState;

// ═══════════════════════════════════════════════════════════════════════
//  Request correlation ID middleware
// ═══════════════════════════════════════════════════════════════════════

/// Assign (or propagate) a UUID v4 correlation id per request.
///
/// - Recorded on the current tracing span as `request_id`
/// - Returned in the `X-Request-Id` response header
async fn request_id_middleware(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    tracing::Span::current().record("request_id", request_id.as_str());
    tracing::debug!(request_id = %request_id, "request correlation ID assigned");

    let mut response = next.run(req).await;
    if let Ok(header_value) = axum::http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", header_value);
    }
    response
}

// ── OpenAPI documentation ───────────────────────────────────────────────

#[derive(OpenApi)]
#[openapi(
    info(
        title = "sub2api gateway",
        description = "Multi-tenant LLM API proxy — account scheduling, sticky sessions, SSE relay",
    ),
    paths(
        handlers::health_check,
        handlers::readiness,
        handlers::create_message,
        handlers::count_tokens,
        handlers::create_response,
    ),
    components(schemas(handlers::HealthResponse)),
    tags(
        (name = "health", description = "Health & readiness"),
        (name = "gateway", description = "LLM relay endpoints"),
    )
)]
pub struct ApiDoc;

/// Build the application router with the given shared state. Extracted
/// from `main()` so integration tests can drive the app without binding a
/// port.
pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/health/ready", get(handlers::readiness))
        .route(
            "/api-docs/openapi.json",
            get(|| async { axum::Json(ApiDoc::openapi()) }),
        );

    let relay = Router::new()
        .route("/v1/messages", post(handlers::create_message))
        .route("/v1/messages/count_tokens", post(handlers::count_tokens))
        .route("/responses", post(handlers::create_response))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    public
        .merge(relay)
        // 60 MB body limit — must come before .with_state() for extractors
        .layer(DefaultBodyLimit::max(60 * 1024 * 1024))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}
