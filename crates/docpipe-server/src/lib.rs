//! docpipe HTTP API server.
//!
//! Exposes the processing core's entry points as a REST API with
//! bearer-token auth and an SSE stream for real-time document events.

pub mod auth;
pub mod error;
pub mod routes;
pub mod sse;
pub mod state;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Headroom on top of the configured file limit for multipart framing.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the complete axum router with all API routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.limits.max_file_size as usize + MULTIPART_OVERHEAD;

    let api = Router::new()
        .route("/health", get(routes::health::health))
        // Documents
        .route(
            "/documents",
            get(routes::documents::list).post(routes::documents::upload),
        )
        .route(
            "/documents/{id}",
            get(routes::documents::fetch).delete(routes::documents::delete),
        )
        .route(
            "/documents/{id}/download",
            get(routes::documents::download_url),
        )
        .route("/documents/{id}/retry", post(routes::documents::retry))
        .route("/documents/{id}/data", put(routes::documents::save_corrected))
        .route("/documents/{id}/approve", post(routes::documents::approve))
        // Audit
        .route("/documents/{id}/audit", get(routes::audit::document_trail))
        .route("/audit/summary", get(routes::audit::summary))
        // Events
        .route("/events", get(sse::events))
        // Auth middleware — applied to all routes; health is exempted internally.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
