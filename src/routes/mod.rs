//! Route definitions for the adminguard API.

pub mod health;
pub mod security;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Ingested contexts are small; larger bodies are rejected before parsing.
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let security_routes = Router::new()
        .route("/security/dashboard", get(security::dashboard))
        .route(
            "/security/events",
            get(security::list_events).post(security::ingest_event),
        )
        .route("/security/alerts", get(security::list_alerts))
        .route("/security/rotation", post(security::rotate));

    Router::new()
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .nest("/api/v1", security_routes)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
