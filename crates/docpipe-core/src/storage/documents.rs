//! Document row storage and status transitions.
//!
//! The document row is the single source of truth for a document's
//! processing state. Only the pipeline orchestrator and user review
//! actions mutate it; every mutation bumps `updated_at`.

use super::DbPool;
use crate::document::{DocumentSnapshot, DocumentStatus};
use crate::error::StorageError;

/// One uploaded document.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct DocumentRow {
    pub id: String,
    pub user_id: String,
    pub object_key: String,
    pub bucket: String,
    pub file_size: i64,
    pub mime_type: String,
    pub original_filename: String,
    pub status: String,
    pub document_type: Option<String>,
    pub parsed_data: Option<String>,
    pub confidence: Option<f64>,
    pub needs_review: bool,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub reviewed_at: Option<String>,
}

impl DocumentRow {
    /// The event/API view of this row.
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            id: self.id.clone(),
            status: self.status.clone(),
            document_type: self.document_type.clone(),
            confidence: self.confidence,
            filename: self.original_filename.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
            completed_at: self.completed_at.clone(),
        }
    }

    /// Typed status; rows only ever hold canonical strings.
    pub fn status_enum(&self) -> Option<DocumentStatus> {
        DocumentStatus::parse(&self.status)
    }

    /// Parsed data as a JSON map, when present.
    pub fn parsed_data_map(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        self.parsed_data
            .as_deref()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|value| value.as_object().cloned())
    }
}

/// Fields needed to create a document row.
#[derive(Debug, Clone)]
pub struct NewDocument<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub object_key: &'a str,
    pub bucket: &'a str,
    pub file_size: i64,
    pub mime_type: &'a str,
    pub original_filename: &'a str,
}

/// Insert a new document with status `PROCESSING`.
pub async fn insert(pool: &DbPool, new: &NewDocument<'_>) -> Result<DocumentRow, StorageError> {
    sqlx::query(
        "INSERT INTO documents
            (id, user_id, object_key, bucket, file_size, mime_type, original_filename, status)
         VALUES (?, ?, ?, ?, ?, ?, ?, 'PROCESSING')",
    )
    .bind(new.id)
    .bind(new.user_id)
    .bind(new.object_key)
    .bind(new.bucket)
    .bind(new.file_size)
    .bind(new.mime_type)
    .bind(new.original_filename)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    get(pool, new.id)
        .await?
        .ok_or_else(|| StorageError::Query {
            source: sqlx::Error::RowNotFound,
        })
}

/// Fetch a document by id.
pub async fn get(pool: &DbPool, id: &str) -> Result<Option<DocumentRow>, StorageError> {
    sqlx::query_as::<_, DocumentRow>("SELECT * FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Fetch a document by id, only when the caller owns it.
///
/// Ownership is checked in the query so a foreign id behaves exactly
/// like a missing one.
pub async fn get_for_user(
    pool: &DbPool,
    id: &str,
    user_id: &str,
) -> Result<Option<DocumentRow>, StorageError> {
    sqlx::query_as::<_, DocumentRow>("SELECT * FROM documents WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// List a user's documents, newest first, excluding archived ones.
pub async fn list_for_user(pool: &DbPool, user_id: &str) -> Result<Vec<DocumentRow>, StorageError> {
    sqlx::query_as::<_, DocumentRow>(
        "SELECT * FROM documents
         WHERE user_id = ? AND status != 'ARCHIVED'
         ORDER BY created_at DESC, id DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Set the classified document type.
pub async fn set_classification(
    pool: &DbPool,
    id: &str,
    document_type: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE documents
         SET document_type = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE id = ?",
    )
    .bind(document_type)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Mark a document failed with an operator-readable message.
pub async fn mark_failed(pool: &DbPool, id: &str, message: &str) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE documents
         SET status = 'FAILED',
             error_message = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE id = ?",
    )
    .bind(message)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Terminal pipeline write: parsed data, confidence, review flag, and
/// either `COMPLETED` or `NEEDS_REVIEW`.
pub async fn finalize(
    pool: &DbPool,
    id: &str,
    parsed_data: &str,
    confidence: f64,
    needs_review: bool,
) -> Result<(), StorageError> {
    let status = if needs_review {
        DocumentStatus::NeedsReview
    } else {
        DocumentStatus::Completed
    };
    sqlx::query(
        "UPDATE documents
         SET status = ?,
             parsed_data = ?,
             confidence = ?,
             needs_review = ?,
             error_message = NULL,
             completed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(parsed_data)
    .bind(confidence)
    .bind(needs_review)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Overwrite parsed data from a user correction (review flow).
pub async fn save_corrected(
    pool: &DbPool,
    id: &str,
    parsed_data: &str,
    confidence: f64,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE documents
         SET parsed_data = ?,
             confidence = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE id = ?",
    )
    .bind(parsed_data)
    .bind(confidence)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Approve a reviewed document, optionally with user-edited data.
pub async fn approve(
    pool: &DbPool,
    id: &str,
    parsed_data: Option<&str>,
    confidence: f64,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE documents
         SET status = 'COMPLETED',
             parsed_data = COALESCE(?, parsed_data),
             confidence = ?,
             needs_review = 0,
             completed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
             reviewed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE id = ?",
    )
    .bind(parsed_data)
    .bind(confidence)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Logical delete.
pub async fn archive(pool: &DbPool, id: &str) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE documents
         SET status = 'ARCHIVED', updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Reset a failed or reviewed document for another pipeline run.
pub async fn reset_for_retry(pool: &DbPool, id: &str) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE documents
         SET status = 'PROCESSING',
             confidence = NULL,
             needs_review = 0,
             error_message = NULL,
             completed_at = NULL,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}
