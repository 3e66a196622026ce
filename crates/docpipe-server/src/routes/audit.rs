//! Read-only audit trail endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use docpipe_core::storage::{audit, documents};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// `GET /api/documents/{id}/audit` — the chronological audit trail of
/// one document, plus per-stage metrics.
pub async fn document_trail(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let owned = documents::get_for_user(&state.db, &id, &user_id)
        .await?
        .is_some();
    if !owned {
        return Err(ApiError::NotFound(format!("document {id} not found")));
    }

    let records = audit::list_for_document(&state.db, &id).await?;
    let stages = audit::stage_metrics(&state.db, &id).await?;
    Ok(Json(json!({ "records": records, "stages": stages })))
}

/// Query parameters for the audit summary.
#[derive(Deserialize)]
pub struct SummaryQuery {
    /// ISO 8601 window start; defaults to the epoch.
    pub start: Option<String>,
    /// ISO 8601 window end; defaults to now.
    pub end: Option<String>,
    /// Restrict to one provider tag.
    pub provider: Option<String>,
}

/// `GET /api/audit/summary` — call/token/cost totals over a window.
pub async fn summary(
    State(state): State<Arc<AppState>>,
    _caller: AuthUser,
    Query(params): Query<SummaryQuery>,
) -> Result<Json<Value>, ApiError> {
    let start = params
        .start
        .unwrap_or_else(|| "1970-01-01T00:00:00.000Z".to_string());
    let end = params.end.unwrap_or_else(|| {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    });

    let summary = audit::summary(&state.db, &start, &end, params.provider.as_deref()).await?;
    Ok(Json(json!(summary)))
}
