//! Health endpoint.

use axum::Json;
use serde_json::{json, Value};

/// `GET /api/health` — unauthenticated liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": docpipe_core::version(),
    }))
}
