//! The per-document pipeline orchestrator.
//!
//! Composes the stages into a single entrypoint, [`run_document`],
//! invoked once per ingest delivery. Every stage that runs writes one
//! audit record carrying a result snapshot; on re-delivery the
//! snapshot is reused instead of repeating the LLM call, which makes
//! the whole pipeline idempotent under at-least-once delivery.
//!
//! Semantic stage failures (provider exhausted, unsupported media)
//! mark the document `FAILED` and return normally; infrastructure
//! errors bubble up as `Err` so the worker can retry the delivery.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{PipelineDeps, PipelineError, UploadJob};
use crate::confidence::{self, ConfidenceInputs, CorrectionOutcome};
use crate::document::{DocumentStatus, DocumentType, PipelineStage};
use crate::events::{DocumentEvent, EventKind};
use crate::llm::{CallMeta, DocumentPayload};
use crate::object_store::ObjectStore as _;
use crate::rules::{self, ValidationIssue};
use crate::storage::audit::{self, NewAuditRecord};
use crate::storage::documents;

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// The document reached `COMPLETED` or `NEEDS_REVIEW`.
    Finalized {
        status: DocumentStatus,
        confidence: f64,
    },
    /// A stage failed; the document is `FAILED`.
    Failed {
        stage: PipelineStage,
        message: String,
    },
    /// Nothing to do (already finalized, or archived meanwhile).
    Skipped { reason: &'static str },
}

// ── Stage result snapshots (persisted in audit records) ──────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClassificationSnapshot {
    document_type: String,
    confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExtractionSnapshot {
    field_count: usize,
    confidence: f64,
    data: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ValidationSnapshot {
    is_valid: bool,
    /// LLM confidence after the business-rule severity adjustment.
    confidence: f64,
    error_count: usize,
    warning_count: usize,
    issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CorrectionSnapshot {
    confidence: f64,
    data: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FinalizeSnapshot {
    confidence: f64,
    needs_review: bool,
}

/// A stage either produced a result or failed the document.
enum StageResult<T> {
    Done(T),
    Failed(String),
}

enum CorrectionPhase {
    /// The correction call returned corrected data.
    Applied { data: Map<String, Value>, confidence: f64 },
    /// The correction call itself failed; no audit record is written.
    CallFailed,
}

/// Run one document through the pipeline.
pub async fn run_document(
    deps: &PipelineDeps,
    job: &UploadJob,
) -> Result<PipelineOutcome, PipelineError> {
    let document = documents::get(&deps.db, &job.document_id)
        .await?
        .ok_or_else(|| PipelineError::MissingDocument(job.document_id.clone()))?;

    if document.status_enum() == Some(DocumentStatus::Archived) {
        return Ok(PipelineOutcome::Skipped { reason: "archived" });
    }
    if memo::<FinalizeSnapshot>(deps, job, PipelineStage::Finalize)
        .await?
        .is_some()
    {
        return Ok(PipelineOutcome::Skipped {
            reason: "already finalized",
        });
    }

    let started = Instant::now();
    tracing::info!(document_id = %job.document_id, "pipeline run starting");

    // ── Download ─────────────────────────────────────────────────────
    // Bytes are fetched on every delivery (they are not memoized), but
    // the UPLOAD audit record is written only once.
    let download_started = Instant::now();
    let bytes = deps.store.get(&job.object_key).await?;
    let payload = DocumentPayload::new(bytes, job.mime_type.clone());

    if audit::latest_for_stage(&deps.db, &job.document_id, PipelineStage::Upload.as_str())
        .await?
        .is_none()
    {
        audit::insert(
            &deps.db,
            &NewAuditRecord {
                document_id: job.document_id.clone(),
                stage: PipelineStage::Upload.as_str().to_string(),
                provider: "object-store".to_string(),
                model: "-".to_string(),
                prompt_id: "-".to_string(),
                prompt_text: String::new(),
                raw_response: format!(r#"{{"object_key":"{}","bytes":{}}}"#, job.object_key, payload.len()),
                extracted_data: None,
                confidence: None,
                processing_ms: download_started.elapsed().as_millis() as i64,
                input_tokens: 0,
                output_tokens: 0,
                cost_estimate: 0.0,
            },
        )
        .await?;
    }

    // ── Classify ─────────────────────────────────────────────────────
    let classification = match classify_stage(deps, job, &payload).await? {
        StageResult::Done(snapshot) => snapshot,
        StageResult::Failed(message) => {
            return fail(deps, job, PipelineStage::Classification, message).await;
        }
    };
    let doc_type = DocumentType::parse(&classification.document_type).unwrap_or(DocumentType::Other);

    // ── Extract ──────────────────────────────────────────────────────
    let extraction = match extract_stage(deps, job, &payload, doc_type).await? {
        StageResult::Done(snapshot) => snapshot,
        StageResult::Failed(message) => {
            return fail(deps, job, PipelineStage::Extraction, message).await;
        }
    };

    // An extraction that produced nothing goes straight to review;
    // there is no data to validate or correct.
    if extraction.field_count == 0 {
        tracing::warn!(document_id = %job.document_id, "extraction produced zero fields");
        let inputs = ConfidenceInputs {
            classification: classification.confidence,
            extraction: extraction.confidence,
            field_count: 0,
            ..ConfidenceInputs::default()
        };
        return finalize(deps, job, &extraction.data, &inputs, started).await;
    }

    // ── Validate ─────────────────────────────────────────────────────
    let validation =
        match validate_stage(deps, job, &payload, doc_type, &extraction.data).await? {
            StageResult::Done(snapshot) => snapshot,
            StageResult::Failed(message) => {
                return fail(deps, job, PipelineStage::Validation, message).await;
            }
        };

    // ── Correct / Re-validate ────────────────────────────────────────
    let mut final_data = extraction.data.clone();
    let mut score_validation = validation.clone();
    let mut correction_outcome: Option<CorrectionOutcome> = None;

    // Correction is only worth a call when deterministic or LLM
    // validation found actual errors.
    if !validation.is_valid && validation.error_count > 0 {
        match correction_stage(deps, job, &payload, doc_type, &extraction.data, &validation.issues)
            .await?
        {
            CorrectionPhase::CallFailed => {
                tracing::warn!(
                    document_id = %job.document_id,
                    correction_failed = true,
                    "correction call failed, keeping original extraction",
                );
                correction_outcome = Some(CorrectionOutcome {
                    confidence: 0.0,
                    applied: false,
                    failed: true,
                });
            }
            CorrectionPhase::Applied { data, confidence } => {
                let revalidation =
                    revalidate_stage(deps, job, &payload, doc_type, &data).await?;
                match revalidation {
                    Some(reval) if reval.is_valid => {
                        final_data = data;
                        score_validation = reval;
                        correction_outcome = Some(CorrectionOutcome {
                            confidence,
                            applied: true,
                            failed: false,
                        });
                    }
                    Some(reval) => {
                        // Correction retained, but it did not resolve
                        // the problems; the score is capped downstream.
                        final_data = data;
                        score_validation = reval;
                        correction_outcome = Some(CorrectionOutcome {
                            confidence,
                            applied: true,
                            failed: true,
                        });
                    }
                    None => {
                        final_data = data;
                        correction_outcome = Some(CorrectionOutcome {
                            confidence,
                            applied: true,
                            failed: true,
                        });
                    }
                }
            }
        }
    }

    // ── Finalize ─────────────────────────────────────────────────────
    let inputs = ConfidenceInputs {
        classification: classification.confidence,
        extraction: extraction.confidence,
        field_count: extraction.field_count,
        validation: score_validation.confidence,
        is_valid: score_validation.is_valid,
        error_count: score_validation.error_count,
        warning_count: score_validation.warning_count,
        correction: correction_outcome,
    };
    finalize(deps, job, &final_data, &inputs, started).await
}

// ── Stages ───────────────────────────────────────────────────────────

async fn classify_stage(
    deps: &PipelineDeps,
    job: &UploadJob,
    payload: &DocumentPayload,
) -> Result<StageResult<ClassificationSnapshot>, PipelineError> {
    if let Some(snapshot) =
        memo::<ClassificationSnapshot>(deps, job, PipelineStage::Classification).await?
    {
        return Ok(StageResult::Done(snapshot));
    }

    let classification = match deps.dispatcher.classify(payload).await {
        Ok(c) => c,
        Err(e) => return Ok(StageResult::Failed(e.to_string())),
    };

    let snapshot = ClassificationSnapshot {
        document_type: classification.document_type.as_str().to_string(),
        confidence: classification.confidence,
    };
    write_stage_audit(
        deps,
        job,
        PipelineStage::Classification,
        &classification.meta,
        Some(serde_json::to_string(&snapshot)?),
        Some(snapshot.confidence),
    )
    .await?;
    documents::set_classification(&deps.db, &job.document_id, &snapshot.document_type).await?;
    emit(deps, job, EventKind::Processing).await?;

    tracing::info!(
        document_id = %job.document_id,
        document_type = %snapshot.document_type,
        confidence = snapshot.confidence,
        "document classified",
    );
    Ok(StageResult::Done(snapshot))
}

async fn extract_stage(
    deps: &PipelineDeps,
    job: &UploadJob,
    payload: &DocumentPayload,
    doc_type: DocumentType,
) -> Result<StageResult<ExtractionSnapshot>, PipelineError> {
    if let Some(snapshot) = memo::<ExtractionSnapshot>(deps, job, PipelineStage::Extraction).await?
    {
        return Ok(StageResult::Done(snapshot));
    }

    let extraction = match deps.dispatcher.extract(payload, doc_type).await {
        Ok(e) => e,
        Err(e) => return Ok(StageResult::Failed(e.to_string())),
    };

    let snapshot = ExtractionSnapshot {
        field_count: extraction.fields.len(),
        confidence: extraction.confidence,
        data: extraction.data,
    };
    write_stage_audit(
        deps,
        job,
        PipelineStage::Extraction,
        &extraction.meta,
        Some(serde_json::to_string(&snapshot)?),
        Some(snapshot.confidence),
    )
    .await?;
    emit(deps, job, EventKind::Processing).await?;

    tracing::info!(
        document_id = %job.document_id,
        fields = snapshot.field_count,
        confidence = snapshot.confidence,
        "data extracted",
    );
    Ok(StageResult::Done(snapshot))
}

async fn validate_stage(
    deps: &PipelineDeps,
    job: &UploadJob,
    payload: &DocumentPayload,
    doc_type: DocumentType,
    data: &Map<String, Value>,
) -> Result<StageResult<ValidationSnapshot>, PipelineError> {
    if let Some(snapshot) = memo::<ValidationSnapshot>(deps, job, PipelineStage::Validation).await?
    {
        return Ok(StageResult::Done(snapshot));
    }

    let business_issues = rules::validate(doc_type, data);
    let business_errors = rules::error_count(&business_issues);
    let business_warnings = rules::warning_count(&business_issues);

    let consensus = match deps
        .dispatcher
        .validate(data, doc_type, Some(payload), &rules::rules_summary(doc_type))
        .await
    {
        Ok(c) => c,
        Err(e) => return Ok(StageResult::Failed(e.to_string())),
    };

    // Deterministic rules are authoritative: they can veto the LLM's
    // verdict and discount its confidence, never the other way around.
    let mut combined = business_issues;
    combined.extend(consensus.issues.clone());
    let combined = rules::dedup_and_sort(combined);

    let snapshot = ValidationSnapshot {
        is_valid: consensus.is_valid && business_errors == 0,
        confidence: confidence::business_rule_adjusted(
            consensus.confidence,
            business_errors,
            business_warnings,
        ),
        error_count: rules::error_count(&combined),
        warning_count: rules::warning_count(&combined),
        issues: combined,
    };
    write_stage_audit(
        deps,
        job,
        PipelineStage::Validation,
        &consensus.meta,
        Some(serde_json::to_string(&snapshot)?),
        Some(snapshot.confidence),
    )
    .await?;
    emit(deps, job, EventKind::Processing).await?;

    tracing::info!(
        document_id = %job.document_id,
        is_valid = snapshot.is_valid,
        errors = snapshot.error_count,
        warnings = snapshot.warning_count,
        agreement = consensus.agreement,
        "validation complete",
    );
    Ok(StageResult::Done(snapshot))
}

async fn correction_stage(
    deps: &PipelineDeps,
    job: &UploadJob,
    payload: &DocumentPayload,
    doc_type: DocumentType,
    data: &Map<String, Value>,
    issues: &[ValidationIssue],
) -> Result<CorrectionPhase, PipelineError> {
    if let Some(snapshot) = memo::<CorrectionSnapshot>(deps, job, PipelineStage::Correction).await?
    {
        return Ok(CorrectionPhase::Applied {
            data: snapshot.data,
            confidence: snapshot.confidence,
        });
    }

    let correction = match deps
        .dispatcher
        .correct(data, issues, doc_type, Some(payload))
        .await
    {
        Ok(c) => c,
        // A failed correction does not fail the pipeline; the caller
        // forces review instead.
        Err(e) => {
            tracing::warn!(document_id = %job.document_id, error = %e, "correction call failed");
            return Ok(CorrectionPhase::CallFailed);
        }
    };

    let snapshot = CorrectionSnapshot {
        confidence: correction.confidence,
        data: correction.data,
    };
    write_stage_audit(
        deps,
        job,
        PipelineStage::Correction,
        &correction.meta,
        Some(serde_json::to_string(&snapshot)?),
        Some(snapshot.confidence),
    )
    .await?;
    emit(deps, job, EventKind::Processing).await?;

    tracing::info!(
        document_id = %job.document_id,
        changes = correction.changes.len(),
        confidence = snapshot.confidence,
        "correction applied",
    );
    Ok(CorrectionPhase::Applied {
        data: snapshot.data,
        confidence: snapshot.confidence,
    })
}

/// Re-run business rules plus a single-provider LLM validation on
/// corrected data. `None` means the LLM call failed, which the caller
/// treats as a failed correction rather than a failed pipeline.
async fn revalidate_stage(
    deps: &PipelineDeps,
    job: &UploadJob,
    payload: &DocumentPayload,
    doc_type: DocumentType,
    data: &Map<String, Value>,
) -> Result<Option<ValidationSnapshot>, PipelineError> {
    if let Some(snapshot) =
        memo::<ValidationSnapshot>(deps, job, PipelineStage::Revalidation).await?
    {
        return Ok(Some(snapshot));
    }

    let business_issues = rules::validate(doc_type, data);
    let business_errors = rules::error_count(&business_issues);
    let business_warnings = rules::warning_count(&business_issues);

    let validation = match deps
        .dispatcher
        .validate_single(data, doc_type, Some(payload), &rules::rules_summary(doc_type))
        .await
    {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(document_id = %job.document_id, error = %e, "re-validation call failed");
            return Ok(None);
        }
    };

    let mut combined = business_issues;
    combined.extend(validation.issues.clone());
    let combined = rules::dedup_and_sort(combined);

    let snapshot = ValidationSnapshot {
        is_valid: validation.is_valid && business_errors == 0,
        confidence: confidence::business_rule_adjusted(
            validation.confidence,
            business_errors,
            business_warnings,
        ),
        error_count: rules::error_count(&combined),
        warning_count: rules::warning_count(&combined),
        issues: combined,
    };
    write_stage_audit(
        deps,
        job,
        PipelineStage::Revalidation,
        &validation.meta,
        Some(serde_json::to_string(&snapshot)?),
        Some(snapshot.confidence),
    )
    .await?;
    emit(deps, job, EventKind::Processing).await?;

    tracing::info!(
        document_id = %job.document_id,
        is_valid = snapshot.is_valid,
        "re-validation complete",
    );
    Ok(Some(snapshot))
}

async fn finalize(
    deps: &PipelineDeps,
    job: &UploadJob,
    data: &Map<String, Value>,
    inputs: &ConfidenceInputs,
    started: Instant,
) -> Result<PipelineOutcome, PipelineError> {
    let report = confidence::overall(inputs);
    let snapshot = FinalizeSnapshot {
        confidence: report.score,
        needs_review: report.needs_review,
    };

    let parsed_json = serde_json::to_string(&Value::Object(data.clone()))?;
    documents::finalize(
        &deps.db,
        &job.document_id,
        &parsed_json,
        report.score,
        report.needs_review,
    )
    .await?;

    audit::insert(
        &deps.db,
        &NewAuditRecord {
            document_id: job.document_id.clone(),
            stage: PipelineStage::Finalize.as_str().to_string(),
            provider: "pipeline".to_string(),
            model: "-".to_string(),
            prompt_id: "-".to_string(),
            prompt_text: String::new(),
            raw_response: serde_json::to_string(&snapshot)?,
            extracted_data: Some(serde_json::to_string(&snapshot)?),
            confidence: Some(report.score),
            processing_ms: started.elapsed().as_millis() as i64,
            input_tokens: 0,
            output_tokens: 0,
            cost_estimate: 0.0,
        },
    )
    .await?;

    emit(deps, job, EventKind::Completed).await?;

    let status = if report.needs_review {
        DocumentStatus::NeedsReview
    } else {
        DocumentStatus::Completed
    };
    tracing::info!(
        document_id = %job.document_id,
        status = status.as_str(),
        confidence = %confidence::format_percent(report.score),
        level = confidence::ConfidenceLevel::from_score(report.score).as_str(),
        "pipeline run finished",
    );
    Ok(PipelineOutcome::Finalized {
        status,
        confidence: report.score,
    })
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Load a memoized stage snapshot, if the stage already ran.
async fn memo<T: serde::de::DeserializeOwned>(
    deps: &PipelineDeps,
    job: &UploadJob,
    stage: PipelineStage,
) -> Result<Option<T>, PipelineError> {
    let Some(record) =
        audit::latest_for_stage(&deps.db, &job.document_id, stage.as_str()).await?
    else {
        return Ok(None);
    };
    match record.extracted_data.as_deref().map(serde_json::from_str) {
        Some(Ok(snapshot)) => {
            tracing::debug!(
                document_id = %job.document_id,
                stage = stage.as_str(),
                "reusing memoized stage result",
            );
            Ok(Some(snapshot))
        }
        _ => {
            tracing::warn!(
                document_id = %job.document_id,
                stage = stage.as_str(),
                "memoized snapshot unreadable, re-running stage",
            );
            Ok(None)
        }
    }
}

async fn write_stage_audit(
    deps: &PipelineDeps,
    job: &UploadJob,
    stage: PipelineStage,
    meta: &CallMeta,
    extracted_data: Option<String>,
    confidence: Option<f64>,
) -> Result<(), PipelineError> {
    audit::insert(
        &deps.db,
        &NewAuditRecord {
            document_id: job.document_id.clone(),
            stage: stage.as_str().to_string(),
            provider: meta.provider.clone(),
            model: meta.model.clone(),
            prompt_id: meta.prompt_id.clone(),
            prompt_text: meta.prompt_text.clone(),
            raw_response: meta.raw_response.clone(),
            extracted_data,
            confidence,
            processing_ms: meta.elapsed_ms as i64,
            input_tokens: i64::from(meta.usage.input_tokens),
            output_tokens: i64::from(meta.usage.output_tokens),
            cost_estimate: meta.cost_estimate,
        },
    )
    .await?;
    Ok(())
}

async fn emit(deps: &PipelineDeps, job: &UploadJob, kind: EventKind) -> Result<(), PipelineError> {
    if let Some(row) = documents::get(&deps.db, &job.document_id).await? {
        deps.bus
            .publish(&DocumentEvent::now(kind, row.user_id.clone(), row.snapshot()));
    }
    Ok(())
}

async fn fail(
    deps: &PipelineDeps,
    job: &UploadJob,
    stage: PipelineStage,
    message: String,
) -> Result<PipelineOutcome, PipelineError> {
    tracing::error!(
        document_id = %job.document_id,
        stage = stage.as_str(),
        %message,
        "pipeline stage failed",
    );
    documents::mark_failed(&deps.db, &job.document_id, &message).await?;
    emit(deps, job, EventKind::Failed).await?;
    Ok(PipelineOutcome::Failed { stage, message })
}
