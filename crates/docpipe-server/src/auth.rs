//! Bearer-token authentication for the docpipe API server.
//!
//! The token → user mapping lives in configuration and is the seam the
//! out-of-scope login/session machinery plugs into: whatever issues
//! sessions upstream just has to resolve them to one of these tokens.
//! All `/api/*` routes except `/api/health` require
//! `Authorization: Bearer <token>`.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

/// The authenticated principal, inserted by the middleware.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(ApiError::Unauthorized)
    }
}

/// Axum middleware that enforces bearer-token authentication.
///
/// Skips authentication for the health endpoint.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Response {
    // Inside a nested router (`/api`), the path may appear with or
    // without the `/api` prefix.
    let path = request.uri().path();
    if path == "/health" || path == "/api/health" {
        return next.run(request).await;
    }

    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match token.and_then(|t| state.config.server.api_tokens.get(t)) {
        Some(user_id) => {
            request.extensions_mut().insert(AuthUser(user_id.clone()));
            next.run(request).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({"error": "unauthorized"})),
        )
            .into_response(),
    }
}
