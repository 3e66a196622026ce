//! Document entry points: enqueue-upload, fetch, list, retry,
//! save-corrected, approve, and delete.
//!
//! Every mutating handler checks ownership through the store query
//! itself; a document owned by someone else is indistinguishable from
//! a missing one.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use docpipe_core::document::DocumentStatus;
use docpipe_core::events::{DocumentEvent, EventKind};
use docpipe_core::object_store::{
    mime_from_filename, object_key, ObjectStore as _, DEFAULT_SIGNED_URL_TTL,
};
use docpipe_core::pipeline::UploadJob;
use docpipe_core::storage::{audit, documents};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Confidence assigned when a reviewer saves corrected data.
const REVIEWED_CONFIDENCE: f64 = 0.95;

/// Confidence assigned when a reviewer approves a document.
const APPROVED_CONFIDENCE: f64 = 1.0;

/// Full JSON view of a document row, with `parsed_data` as an object.
fn document_json(row: &documents::DocumentRow) -> Value {
    let parsed_data = row
        .parsed_data
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok());
    json!({
        "id": row.id,
        "status": row.status,
        "document_type": row.document_type,
        "filename": row.original_filename,
        "mime_type": row.mime_type,
        "file_size": row.file_size,
        "confidence": row.confidence,
        "needs_review": row.needs_review,
        "parsed_data": parsed_data,
        "error_message": row.error_message,
        "created_at": row.created_at,
        "updated_at": row.updated_at,
        "completed_at": row.completed_at,
        "reviewed_at": row.reviewed_at,
    })
}

async fn emit(state: &AppState, id: &str, kind: EventKind) -> Result<(), ApiError> {
    if let Some(row) = documents::get(&state.db, id).await? {
        state
            .bus
            .publish(&DocumentEvent::now(kind, row.user_id.clone(), row.snapshot()));
    }
    Ok(())
}

/// Fetch a document the caller owns, or 404.
async fn owned(
    state: &AppState,
    id: &str,
    user_id: &str,
) -> Result<documents::DocumentRow, ApiError> {
    documents::get_for_user(&state.db, id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("document {id} not found")))
}

/// `POST /api/documents` — validate, store bytes, enqueue processing.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut file: Option<(String, Option<String>, Vec<u8>)> = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError::Validation {
        field: "file".to_string(),
        message: e.to_string(),
    })? {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("upload").to_string();
            let declared_mime = field.content_type().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::Validation {
                    field: "file".to_string(),
                    message: e.to_string(),
                })?
                .to_vec();
            file = Some((filename, declared_mime, bytes));
        }
    }

    let Some((filename, declared_mime, bytes)) = file else {
        return Err(ApiError::Validation {
            field: "file".to_string(),
            message: "multipart field 'file' is required".to_string(),
        });
    };

    let mime_type = declared_mime
        .or_else(|| mime_from_filename(&filename).map(str::to_string))
        .ok_or_else(|| ApiError::Validation {
            field: "file".to_string(),
            message: "could not determine content type".to_string(),
        })?;

    if !state.config.limits.allowed_mime_types.contains(&mime_type) {
        return Err(ApiError::Validation {
            field: "file".to_string(),
            message: format!(
                "unsupported content type '{mime_type}', allowed: {}",
                state.config.limits.allowed_mime_types.join(", ")
            ),
        });
    }
    if bytes.is_empty() {
        return Err(ApiError::Validation {
            field: "file".to_string(),
            message: "file is empty".to_string(),
        });
    }
    if bytes.len() as u64 > state.config.limits.max_file_size {
        return Err(ApiError::Validation {
            field: "file".to_string(),
            message: format!(
                "file exceeds maximum size of {} bytes",
                state.config.limits.max_file_size
            ),
        });
    }

    let id = uuid::Uuid::new_v4().to_string();
    let key = object_key(&user_id, &filename, chrono::Utc::now().timestamp_millis());
    let file_size = bytes.len() as i64;

    state.store.put(&key, bytes, &mime_type).await?;

    let row = documents::insert(
        &state.db,
        &documents::NewDocument {
            id: &id,
            user_id: &user_id,
            object_key: &key,
            bucket: &state.config.object_store.bucket,
            file_size,
            mime_type: &mime_type,
            original_filename: &filename,
        },
    )
    .await?;

    let job = UploadJob {
        document_id: id.clone(),
        user_id: user_id.clone(),
        object_key: key,
        bucket: state.config.object_store.bucket.clone(),
        mime_type,
        file_size,
    };
    state
        .ingest
        .send(job)
        .await
        .map_err(|_| ApiError::Internal("ingest queue closed".to_string()))?;

    emit(&state, &id, EventKind::Created).await?;

    tracing::info!(document_id = %id, user_id = %user_id, file_size, "document enqueued");
    Ok((StatusCode::CREATED, Json(document_json(&row))))
}

/// `GET /api/documents` — the caller's documents, newest first.
pub async fn list(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Value>, ApiError> {
    let rows = documents::list_for_user(&state.db, &user_id).await?;
    let docs: Vec<Value> = rows.iter().map(document_json).collect();
    Ok(Json(json!({ "documents": docs })))
}

/// `GET /api/documents/{id}` — one document, owner only.
pub async fn fetch(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let row = owned(&state, &id, &user_id).await?;
    Ok(Json(document_json(&row)))
}

/// `GET /api/documents/{id}/download` — a time-limited signed URL for
/// the original bytes.
pub async fn download_url(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let row = owned(&state, &id, &user_id).await?;
    let url = state
        .store
        .presign_get(&row.object_key, DEFAULT_SIGNED_URL_TTL)
        .await?;
    Ok(Json(json!({
        "url": url,
        "expires_in_secs": DEFAULT_SIGNED_URL_TTL.as_secs(),
    })))
}

/// `POST /api/documents/{id}/retry` — re-run a failed or reviewed
/// document from scratch.
pub async fn retry(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let row = owned(&state, &id, &user_id).await?;
    if !row.status_enum().is_some_and(|s| s.retryable()) {
        return Err(ApiError::Conflict(format!(
            "document in status {} cannot be retried",
            row.status
        )));
    }

    // A retry is a fresh pipeline run: the memoized stages must go.
    audit::clear_for_document(&state.db, &id).await?;
    documents::reset_for_retry(&state.db, &id).await?;

    state
        .ingest
        .send(UploadJob {
            document_id: row.id.clone(),
            user_id: row.user_id.clone(),
            object_key: row.object_key.clone(),
            bucket: row.bucket.clone(),
            mime_type: row.mime_type.clone(),
            file_size: row.file_size,
        })
        .await
        .map_err(|_| ApiError::Internal("ingest queue closed".to_string()))?;

    emit(&state, &id, EventKind::Processing).await?;

    let row = owned(&state, &id, &user_id).await?;
    Ok(Json(document_json(&row)))
}

/// Request body for saving reviewer-corrected data.
#[derive(Deserialize)]
pub struct SaveCorrectedRequest {
    pub data: Map<String, Value>,
}

/// `PUT /api/documents/{id}/data` — overwrite parsed data during review.
pub async fn save_corrected(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<SaveCorrectedRequest>,
) -> Result<Json<Value>, ApiError> {
    let row = owned(&state, &id, &user_id).await?;
    if row.status_enum() != Some(DocumentStatus::NeedsReview) {
        return Err(ApiError::Conflict(format!(
            "document in status {} cannot be edited",
            row.status
        )));
    }

    let parsed_json = serde_json::to_string(&Value::Object(body.data))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    documents::save_corrected(&state.db, &id, &parsed_json, REVIEWED_CONFIDENCE).await?;
    emit(&state, &id, EventKind::Updated).await?;

    let row = owned(&state, &id, &user_id).await?;
    Ok(Json(document_json(&row)))
}

/// Request body for approval, with optional final edits.
#[derive(Deserialize, Default)]
pub struct ApproveRequest {
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
}

/// `POST /api/documents/{id}/approve` — human sign-off on a reviewed
/// document. Approval is a human vouching for the data, so the stored
/// confidence becomes 1.0.
pub async fn approve(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    body: Option<Json<ApproveRequest>>,
) -> Result<Json<Value>, ApiError> {
    let row = owned(&state, &id, &user_id).await?;
    if row.status_enum() != Some(DocumentStatus::NeedsReview) {
        return Err(ApiError::Conflict(format!(
            "document in status {} cannot be approved",
            row.status
        )));
    }

    let edited = match body.and_then(|Json(b)| b.data) {
        Some(data) => Some(
            serde_json::to_string(&Value::Object(data))
                .map_err(|e| ApiError::Internal(e.to_string()))?,
        ),
        None => None,
    };
    documents::approve(&state.db, &id, edited.as_deref(), APPROVED_CONFIDENCE).await?;
    emit(&state, &id, EventKind::Completed).await?;

    let row = owned(&state, &id, &user_id).await?;
    Ok(Json(document_json(&row)))
}

/// `DELETE /api/documents/{id}` — archive and schedule byte deletion.
pub async fn delete(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let row = owned(&state, &id, &user_id).await?;
    documents::archive(&state.db, &id).await?;
    emit(&state, &id, EventKind::Deleted).await?;

    // Object bytes go away best-effort; the archived row survives
    // regardless of the outcome.
    let store = Arc::clone(&state.store);
    let key = row.object_key.clone();
    tokio::spawn(async move {
        if let Err(err) = store.delete(&key).await {
            tracing::warn!(key, error = %err, "best-effort object deletion failed");
        }
    });

    Ok(Json(json!({ "id": id, "status": "ARCHIVED" })))
}
