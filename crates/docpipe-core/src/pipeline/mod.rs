//! The per-document processing pipeline.
//!
//! [`orchestrate::run_document`] drives one document through
//! Download → Classify → Extract → Validate → (Correct → Revalidate)?
//! → Finalize, writing an audit record and a document-row mutation
//! after every stage. [`worker::PipelineWorker`] consumes the ingest
//! queue and runs documents concurrently, standing in for an external
//! event broker with at-least-once delivery.
//!
//! Steps are idempotent: a completed stage leaves an audit record with
//! a result snapshot, and re-delivery reuses it instead of repeating
//! the LLM call.

pub mod orchestrate;
pub mod worker;


use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dispatch::Dispatcher;
use crate::error::{LlmError, ObjectStoreError, StorageError};
use crate::events::EventBus;
use crate::object_store::ObjectStore;
use crate::storage::DbPool;

pub use orchestrate::{run_document, PipelineOutcome};
pub use worker::{ingest_channel, IngestSender, PipelineWorker};

/// Errors from pipeline operations.
///
/// An `Err` from the pipeline means infrastructure trouble worth a
/// delivery retry; semantic stage failures instead mark the document
/// `FAILED` and return an [`PipelineOutcome::Failed`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// LLM provider error that escaped stage handling.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Database error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Object store error (download/delete).
    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    /// The ingest event references a document that does not exist.
    #[error("document '{0}' not found")]
    MissingDocument(String),

    /// Persisted pipeline state could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The ingest payload published when uploaded bytes land.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadJob {
    pub document_id: String,
    pub user_id: String,
    pub object_key: String,
    pub bucket: String,
    pub mime_type: String,
    pub file_size: i64,
}

/// Shared handles the pipeline stages need.
pub struct PipelineDeps {
    /// SQLite connection pool.
    pub db: DbPool,
    /// Document byte storage.
    pub store: Arc<dyn ObjectStore>,
    /// Provider dispatch.
    pub dispatcher: Dispatcher,
    /// Event fan-out.
    pub bus: Arc<EventBus>,
}
