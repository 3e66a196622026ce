//! In-process pipeline worker.
//!
//! Consumes the ingest queue and runs one pipeline task per document,
//! with steps serial inside a document and documents concurrent up to
//! a cap. Stands in for an external event broker: deliveries are
//! at-least-once (failed deliveries are retried with backoff), and
//! stage memoization in the orchestrator keeps redelivery from
//! repeating completed work.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use super::{orchestrate, PipelineDeps, PipelineOutcome, UploadJob};
use crate::config::PipelineConfig;
use crate::events::{DocumentEvent, EventKind};
use crate::storage::documents;

/// Queue depth between the enqueue entry point and the worker.
const INGEST_QUEUE_DEPTH: usize = 256;

/// Publisher handle for `document/uploaded` events.
pub type IngestSender = mpsc::Sender<UploadJob>;

/// Create the ingest queue pair.
pub fn ingest_channel() -> (IngestSender, mpsc::Receiver<UploadJob>) {
    mpsc::channel(INGEST_QUEUE_DEPTH)
}

/// Long-running consumer of the ingest queue.
pub struct PipelineWorker {
    deps: Arc<PipelineDeps>,
    rx: mpsc::Receiver<UploadJob>,
    cancel: CancellationToken,
    max_concurrent: usize,
    delivery_attempts: u32,
}

impl PipelineWorker {
    /// Create a worker over shared pipeline dependencies.
    pub fn new(
        deps: Arc<PipelineDeps>,
        rx: mpsc::Receiver<UploadJob>,
        cancel: CancellationToken,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            deps,
            rx,
            cancel,
            max_concurrent: config.max_concurrent.max(1),
            delivery_attempts: config.delivery_attempts.max(1),
        }
    }

    /// Consume jobs until the queue closes or cancellation fires.
    ///
    /// In-flight documents finish their current delivery; only new
    /// jobs stop being picked up.
    pub async fn run(mut self) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        tracing::info!(
            max_concurrent = self.max_concurrent,
            "pipeline worker started"
        );

        loop {
            let job = tokio::select! {
                () = self.cancel.cancelled() => break,
                job = self.rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let deps = Arc::clone(&self.deps);
            let attempts = self.delivery_attempts;
            tokio::spawn(async move {
                let _permit = permit;
                deliver(&deps, &job, attempts).await;
            });
        }

        tracing::info!("pipeline worker stopped");
    }
}

/// Run one delivery with broker-style retries.
///
/// Infrastructure errors (`Err` from the orchestrator) are retried
/// with exponential backoff; semantic failures already marked the
/// document and need no retry. When every attempt errors out, the
/// document is marked `FAILED` so it never hangs in `PROCESSING`.
pub async fn deliver(deps: &PipelineDeps, job: &UploadJob, attempts: u32) {
    let mut last_error = String::new();

    for attempt in 0..attempts {
        match orchestrate::run_document(deps, job).await {
            Ok(PipelineOutcome::Finalized { status, confidence }) => {
                tracing::debug!(
                    document_id = %job.document_id,
                    status = status.as_str(),
                    confidence,
                    "delivery complete",
                );
                return;
            }
            Ok(PipelineOutcome::Failed { stage, message }) => {
                tracing::debug!(
                    document_id = %job.document_id,
                    stage = stage.as_str(),
                    message,
                    "delivery ended in stage failure",
                );
                return;
            }
            Ok(PipelineOutcome::Skipped { reason }) => {
                tracing::debug!(document_id = %job.document_id, reason, "delivery skipped");
                return;
            }
            Err(err) => {
                last_error = err.to_string();
                tracing::warn!(
                    document_id = %job.document_id,
                    attempt = attempt + 1,
                    attempts,
                    error = %err,
                    "delivery attempt failed",
                );
                if attempt + 1 < attempts {
                    let backoff = Duration::from_secs(1 << attempt.min(4));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    // Delivery exhausted on infrastructure errors.
    let message = format!("delivery exhausted after {attempts} attempts: {last_error}");
    tracing::error!(document_id = %job.document_id, %message, "giving up on document");
    if let Err(err) = documents::mark_failed(&deps.db, &job.document_id, &message).await {
        tracing::error!(document_id = %job.document_id, error = %err, "failed to mark document FAILED");
        return;
    }
    if let Ok(Some(row)) = documents::get(&deps.db, &job.document_id).await {
        deps.bus.publish(&DocumentEvent::now(
            EventKind::Failed,
            row.user_id.clone(),
            row.snapshot(),
        ));
    }
}
