//! Append-only per-stage audit trail.
//!
//! Every pipeline stage writes exactly one record per attempt: the
//! prompt that was sent, the raw response, tokens, wall time, and
//! cost. Records are never mutated or deleted; they double as the
//! memoization source for step re-delivery.

use super::DbPool;
use crate::error::StorageError;

/// One immutable audit record.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct AuditRecord {
    pub id: i64,
    pub document_id: String,
    pub stage: String,
    pub provider: String,
    pub model: String,
    pub prompt_id: String,
    pub prompt_text: String,
    pub raw_response: String,
    pub extracted_data: Option<String>,
    pub confidence: Option<f64>,
    pub processing_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_estimate: f64,
    pub created_at: String,
}

/// Fields for a new audit record.
#[derive(Debug, Clone, Default)]
pub struct NewAuditRecord {
    pub document_id: String,
    pub stage: String,
    pub provider: String,
    pub model: String,
    pub prompt_id: String,
    pub prompt_text: String,
    pub raw_response: String,
    pub extracted_data: Option<String>,
    pub confidence: Option<f64>,
    pub processing_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_estimate: f64,
}

/// Append a record. Returns the row id.
pub async fn insert(pool: &DbPool, record: &NewAuditRecord) -> Result<i64, StorageError> {
    let result = sqlx::query(
        "INSERT INTO audit_records
            (document_id, stage, provider, model, prompt_id, prompt_text, raw_response,
             extracted_data, confidence, processing_ms, input_tokens, output_tokens, cost_estimate)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.document_id)
    .bind(&record.stage)
    .bind(&record.provider)
    .bind(&record.model)
    .bind(&record.prompt_id)
    .bind(&record.prompt_text)
    .bind(&record.raw_response)
    .bind(&record.extracted_data)
    .bind(record.confidence)
    .bind(record.processing_ms)
    .bind(record.input_tokens)
    .bind(record.output_tokens)
    .bind(record.cost_estimate)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    Ok(result.last_insert_rowid())
}

/// A document's audit trail in chronological order.
pub async fn list_for_document(
    pool: &DbPool,
    document_id: &str,
) -> Result<Vec<AuditRecord>, StorageError> {
    sqlx::query_as::<_, AuditRecord>(
        "SELECT * FROM audit_records WHERE document_id = ? ORDER BY created_at, id",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// The most recent record for a stage of a document, if any.
///
/// This is the memoization hook: a present record means the stage
/// already ran and its outcome can be reused on event re-delivery.
pub async fn latest_for_stage(
    pool: &DbPool,
    document_id: &str,
    stage: &str,
) -> Result<Option<AuditRecord>, StorageError> {
    sqlx::query_as::<_, AuditRecord>(
        "SELECT * FROM audit_records
         WHERE document_id = ? AND stage = ?
         ORDER BY id DESC LIMIT 1",
    )
    .bind(document_id)
    .bind(stage)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Delete a document's audit trail (user-initiated retry only).
///
/// Retry restarts the pipeline from scratch, so the memoized stages
/// must go; the pipeline itself never calls this.
pub async fn clear_for_document(pool: &DbPool, document_id: &str) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM audit_records WHERE document_id = ?")
        .bind(document_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Aggregate totals over a time window.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditSummary {
    pub total_calls: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cost: f64,
    pub by_provider: Vec<ProviderCount>,
}

/// Calls per provider within a summary window.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderCount {
    pub provider: String,
    pub calls: i64,
}

/// Aggregate over `[start, end]`, optionally restricted to a provider.
/// Timestamps are ISO 8601 strings as stored.
pub async fn summary(
    pool: &DbPool,
    start: &str,
    end: &str,
    provider: Option<&str>,
) -> Result<AuditSummary, StorageError> {
    let mut totals_sql = String::from(
        "SELECT COUNT(*), COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                COALESCE(SUM(cost_estimate), 0.0)
         FROM audit_records WHERE created_at >= ? AND created_at <= ?",
    );
    if provider.is_some() {
        totals_sql.push_str(" AND provider = ?");
    }

    let mut totals_query = sqlx::query_as::<_, (i64, i64, i64, f64)>(&totals_sql)
        .bind(start)
        .bind(end);
    if let Some(p) = provider {
        totals_query = totals_query.bind(p);
    }
    let (total_calls, total_input_tokens, total_output_tokens, total_cost) = totals_query
        .fetch_one(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    let mut provider_sql = String::from(
        "SELECT provider, COUNT(*) FROM audit_records
         WHERE created_at >= ? AND created_at <= ?",
    );
    if provider.is_some() {
        provider_sql.push_str(" AND provider = ?");
    }
    provider_sql.push_str(" GROUP BY provider ORDER BY COUNT(*) DESC");

    let mut provider_query = sqlx::query_as::<_, (String, i64)>(&provider_sql)
        .bind(start)
        .bind(end);
    if let Some(p) = provider {
        provider_query = provider_query.bind(p);
    }
    let by_provider = provider_query
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?
        .into_iter()
        .map(|(provider, calls)| ProviderCount { provider, calls })
        .collect();

    Ok(AuditSummary {
        total_calls,
        total_input_tokens,
        total_output_tokens,
        total_cost,
        by_provider,
    })
}

/// Per-stage metrics for one document.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct StageMetrics {
    pub stage: String,
    pub calls: i64,
    pub avg_processing_ms: f64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub avg_confidence: Option<f64>,
}

/// Average time, tokens, and confidence per stage of a document.
pub async fn stage_metrics(
    pool: &DbPool,
    document_id: &str,
) -> Result<Vec<StageMetrics>, StorageError> {
    sqlx::query_as::<_, StageMetrics>(
        "SELECT stage,
                COUNT(*) AS calls,
                AVG(processing_ms) AS avg_processing_ms,
                COALESCE(SUM(input_tokens), 0) AS total_input_tokens,
                COALESCE(SUM(output_tokens), 0) AS total_output_tokens,
                AVG(confidence) AS avg_confidence
         FROM audit_records
         WHERE document_id = ?
         GROUP BY stage
         ORDER BY MIN(id)",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{documents, init_test_db};

    async fn seed_document(pool: &DbPool, id: &str) {
        documents::insert(
            pool,
            &documents::NewDocument {
                id,
                user_id: "alice",
                object_key: "documents/alice/1_scan.pdf",
                bucket: "docs",
                file_size: 1024,
                mime_type: "application/pdf",
                original_filename: "scan.pdf",
            },
        )
        .await
        .expect("seed document");
    }

    fn record(document_id: &str, stage: &str, provider: &str) -> NewAuditRecord {
        NewAuditRecord {
            document_id: document_id.to_string(),
            stage: stage.to_string(),
            provider: provider.to_string(),
            model: "stub-model".to_string(),
            prompt_id: "classify.v1".to_string(),
            prompt_text: "prompt".to_string(),
            raw_response: "{}".to_string(),
            extracted_data: None,
            confidence: Some(0.9),
            processing_ms: 120,
            input_tokens: 1000,
            output_tokens: 50,
            cost_estimate: 0.0037,
        }
    }

    #[tokio::test]
    async fn records_list_in_insertion_order() {
        let pool = init_test_db().await.expect("init db");
        seed_document(&pool, "doc-1").await;

        for stage in ["UPLOAD", "CLASSIFICATION", "EXTRACTION"] {
            insert(&pool, &record("doc-1", stage, "anthropic"))
                .await
                .expect("insert");
        }

        let trail = list_for_document(&pool, "doc-1").await.expect("list");
        let stages: Vec<&str> = trail.iter().map(|r| r.stage.as_str()).collect();
        assert_eq!(stages, vec!["UPLOAD", "CLASSIFICATION", "EXTRACTION"]);
    }

    #[tokio::test]
    async fn latest_for_stage_finds_memoized_step() {
        let pool = init_test_db().await.expect("init db");
        seed_document(&pool, "doc-1").await;

        assert!(latest_for_stage(&pool, "doc-1", "CLASSIFICATION")
            .await
            .expect("query")
            .is_none());

        insert(&pool, &record("doc-1", "CLASSIFICATION", "anthropic"))
            .await
            .expect("insert");

        let found = latest_for_stage(&pool, "doc-1", "CLASSIFICATION")
            .await
            .expect("query")
            .expect("record");
        assert_eq!(found.provider, "anthropic");
        assert_eq!(found.confidence, Some(0.9));
    }

    #[tokio::test]
    async fn clear_removes_only_target_document() {
        let pool = init_test_db().await.expect("init db");
        seed_document(&pool, "doc-1").await;
        seed_document(&pool, "doc-2").await;
        insert(&pool, &record("doc-1", "CLASSIFICATION", "anthropic"))
            .await
            .expect("insert");
        insert(&pool, &record("doc-2", "CLASSIFICATION", "anthropic"))
            .await
            .expect("insert");

        clear_for_document(&pool, "doc-1").await.expect("clear");
        assert!(list_for_document(&pool, "doc-1")
            .await
            .expect("list")
            .is_empty());
        assert_eq!(list_for_document(&pool, "doc-2").await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn summary_totals_and_provider_counts() {
        let pool = init_test_db().await.expect("init db");
        seed_document(&pool, "doc-1").await;

        insert(&pool, &record("doc-1", "CLASSIFICATION", "anthropic"))
            .await
            .expect("insert");
        insert(&pool, &record("doc-1", "EXTRACTION", "anthropic"))
            .await
            .expect("insert");
        insert(&pool, &record("doc-1", "VALIDATION", "openai"))
            .await
            .expect("insert");

        let all = summary(&pool, "2000-01-01T00:00:00Z", "2100-01-01T00:00:00Z", None)
            .await
            .expect("summary");
        assert_eq!(all.total_calls, 3);
        assert_eq!(all.total_input_tokens, 3000);
        assert_eq!(all.total_output_tokens, 150);
        assert!((all.total_cost - 0.0111).abs() < 1e-9);
        assert_eq!(all.by_provider.len(), 2);
        assert_eq!(all.by_provider[0].provider, "anthropic");
        assert_eq!(all.by_provider[0].calls, 2);

        let openai_only = summary(
            &pool,
            "2000-01-01T00:00:00Z",
            "2100-01-01T00:00:00Z",
            Some("openai"),
        )
        .await
        .expect("summary");
        assert_eq!(openai_only.total_calls, 1);
        assert_eq!(openai_only.by_provider.len(), 1);
    }

    #[tokio::test]
    async fn summary_window_excludes_outside_records() {
        let pool = init_test_db().await.expect("init db");
        seed_document(&pool, "doc-1").await;
        insert(&pool, &record("doc-1", "CLASSIFICATION", "anthropic"))
            .await
            .expect("insert");

        let past = summary(&pool, "2000-01-01T00:00:00Z", "2001-01-01T00:00:00Z", None)
            .await
            .expect("summary");
        assert_eq!(past.total_calls, 0);
        assert!(past.by_provider.is_empty());
    }

    #[tokio::test]
    async fn stage_metrics_grouped_in_pipeline_order() {
        let pool = init_test_db().await.expect("init db");
        seed_document(&pool, "doc-1").await;

        let mut classification = record("doc-1", "CLASSIFICATION", "anthropic");
        classification.processing_ms = 100;
        insert(&pool, &classification).await.expect("insert");

        let mut extraction = record("doc-1", "EXTRACTION", "anthropic");
        extraction.processing_ms = 300;
        extraction.confidence = Some(0.8);
        insert(&pool, &extraction).await.expect("insert");

        let metrics = stage_metrics(&pool, "doc-1").await.expect("metrics");
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].stage, "CLASSIFICATION");
        assert!((metrics[0].avg_processing_ms - 100.0).abs() < 1e-9);
        assert_eq!(metrics[1].stage, "EXTRACTION");
        assert_eq!(metrics[1].total_input_tokens, 1000);
        assert_eq!(metrics[1].avg_confidence, Some(0.8));
    }
}
