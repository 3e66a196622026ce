//! Vision LLM provider abstraction and implementations.
//!
//! Provides a trait-based abstraction over vision-capable LLM providers
//! (Anthropic, OpenAI-compatible) with typed stage operations, token
//! usage tracking, permissive JSON parsing, and a retry wrapper.
//!
//! Providers implement one low-level [`VisionProvider::complete`]
//! primitive; the four pipeline operations (classify, extract,
//! validate, correct) are provided methods built on top of it, so
//! every provider shares the same prompts, parsing, and retry
//! behavior.

pub mod anthropic;
pub mod factory;
pub mod json;
pub mod openai_compat;
pub mod pricing;
pub mod retry;

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};

use crate::document::{DocumentType, PipelineStage};
use crate::error::LlmError;
use crate::prompts;
use crate::rules::{self, Severity, ValidationIssue};
use self::retry::RetryPolicy;

/// Used when extraction reports no per-field or overall confidence.
const EXTRACTION_FALLBACK_CONFIDENCE: f64 = 0.75;

const MAX_TOKENS_CLASSIFY: u32 = 1024;
const MAX_TOKENS_EXTRACT: u32 = 4096;
const MAX_TOKENS_VALIDATE: u32 = 2048;
const MAX_TOKENS_CORRECT: u32 = 4096;

/// Token usage information from an LLM completion.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the input/prompt.
    pub input_tokens: u32,
    /// Number of tokens in the output/completion.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Accumulate token counts from another usage record.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Document bytes plus MIME type, cheap to clone across fan-out tasks.
#[derive(Debug, Clone)]
pub struct DocumentPayload {
    bytes: Arc<Vec<u8>>,
    mime_type: String,
}

impl DocumentPayload {
    /// Wrap raw bytes and their MIME type.
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: Arc::new(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// The MIME type of the payload.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Whether this is a native PDF.
    pub fn is_pdf(&self) -> bool {
        self.mime_type == "application/pdf"
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Base64-encode the bytes for inline transport.
    pub fn to_base64(&self) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(self.bytes.as_slice())
    }
}

/// A raw completion request: system + user prompt + optional document.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub system: String,
    pub prompt: String,
    pub file: Option<DocumentPayload>,
    pub max_tokens: u32,
}

/// Raw text completion from a provider.
#[derive(Debug, Clone)]
pub struct RawCompletion {
    /// The generated text content.
    pub text: String,
    /// Token usage for this completion.
    pub usage: TokenUsage,
    /// The model that produced this response.
    pub model: String,
}

/// Bookkeeping every stage call produces, destined for the audit trail.
#[derive(Debug, Clone)]
pub struct CallMeta {
    pub provider: String,
    pub model: String,
    pub prompt_id: String,
    pub prompt_text: String,
    pub raw_response: String,
    pub usage: TokenUsage,
    pub elapsed_ms: u64,
    /// Estimated USD cost, priced at call time so fan-out merges can
    /// sum across providers.
    pub cost_estimate: f64,
}

/// Result of the classification operation.
#[derive(Debug, Clone)]
pub struct Classification {
    pub document_type: DocumentType,
    pub confidence: f64,
    pub reasoning: String,
    pub meta: CallMeta,
}

/// One extracted field with the model's confidence in it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExtractedField {
    pub name: String,
    pub value: Value,
    pub confidence: Option<f64>,
}

/// Result of the extraction operation.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub fields: Vec<ExtractedField>,
    /// The extracted map, keyed by field name.
    pub data: Map<String, Value>,
    /// Arithmetic mean of field confidences when provided, else the
    /// model's overall figure, else a fallback constant.
    pub confidence: f64,
    pub meta: CallMeta,
}

/// Result of the LLM validation operation.
#[derive(Debug, Clone)]
pub struct LlmValidation {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
    pub confidence: f64,
    /// Corrections the validator volunteered, when any.
    pub corrected_data: Option<Map<String, Value>>,
    pub meta: CallMeta,
}

/// One field changed by the correction operation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    pub reasoning: String,
}

/// Result of the correction operation.
#[derive(Debug, Clone)]
pub struct Correction {
    pub data: Map<String, Value>,
    pub changes: Vec<FieldChange>,
    pub confidence: f64,
    pub meta: CallMeta,
}

/// Trait abstracting vision LLM providers.
///
/// Implementations supply [`Self::complete`]; the stage operations are
/// provided methods so prompts, retries, and response parsing stay
/// uniform across providers. The trait is object-safe for use as
/// `Arc<dyn VisionProvider>`.
#[async_trait::async_trait]
pub trait VisionProvider: Send + Sync {
    /// The provider tag (e.g., "anthropic", "openai").
    fn name(&self) -> &str;

    /// The configured model identifier.
    fn model(&self) -> &str;

    /// Whether the provider accepts native PDF input.
    fn supports_pdf(&self) -> bool;

    /// Send one completion request. Implementations handle transport,
    /// authentication, and provider-specific error mapping; they do
    /// not retry.
    async fn complete(&self, request: VisionRequest) -> Result<RawCompletion, LlmError>;

    /// Classify a document image into a [`DocumentType`].
    async fn classify(&self, file: &DocumentPayload) -> Result<Classification, LlmError> {
        self.ensure_media(Some(file))?;
        let template = prompts::template(PipelineStage::Classification, None);
        let types = DocumentType::all()
            .iter()
            .map(DocumentType::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = template.render(&[("types", types.as_str())]);

        let (completion, elapsed_ms) = self
            .run(VisionRequest {
                system: template.system.to_string(),
                prompt: prompt.clone(),
                file: Some(file.clone()),
                max_tokens: MAX_TOKENS_CLASSIFY,
            })
            .await?;

        let value = json::extract_json(&completion.text)?;
        let (document_type, confidence, reasoning) = parse_classification(&value)?;
        Ok(Classification {
            document_type,
            confidence,
            reasoning,
            meta: self.meta(template.id, prompt, completion, elapsed_ms),
        })
    }

    /// Extract typed fields from a document image.
    async fn extract(
        &self,
        file: &DocumentPayload,
        doc_type: DocumentType,
    ) -> Result<Extraction, LlmError> {
        self.ensure_media(Some(file))?;
        let template = prompts::template(PipelineStage::Extraction, Some(doc_type));
        let config = rules::configs::rules_for(doc_type);
        let mut fields: Vec<&str> = config.required_fields.to_vec();
        fields.extend_from_slice(config.optional_fields);
        let field_list = if fields.is_empty() {
            "any fields present".to_string()
        } else {
            fields.join(", ")
        };
        let prompt = template.render(&[
            ("document_type", doc_type.as_str()),
            ("fields", field_list.as_str()),
        ]);

        let (completion, elapsed_ms) = self
            .run(VisionRequest {
                system: template.system.to_string(),
                prompt: prompt.clone(),
                file: Some(file.clone()),
                max_tokens: MAX_TOKENS_EXTRACT,
            })
            .await?;

        let value = json::extract_json(&completion.text)?;
        let (fields, data, confidence) = parse_extraction(&value);
        Ok(Extraction {
            fields,
            data,
            confidence,
            meta: self.meta(template.id, prompt, completion, elapsed_ms),
        })
    }

    /// Validate extracted data, cross-checking against the document
    /// image when one is supplied.
    async fn validate(
        &self,
        data: &Map<String, Value>,
        doc_type: DocumentType,
        file: Option<&DocumentPayload>,
        rules_summary: &str,
    ) -> Result<LlmValidation, LlmError> {
        self.ensure_media(file)?;
        let template = prompts::template(PipelineStage::Validation, Some(doc_type));
        let data_json = serde_json::to_string_pretty(data).unwrap_or_default();
        let prompt = template.render(&[
            ("document_type", doc_type.as_str()),
            ("data", data_json.as_str()),
            ("rules", rules_summary),
        ]);

        let (completion, elapsed_ms) = self
            .run(VisionRequest {
                system: template.system.to_string(),
                prompt: prompt.clone(),
                file: file.cloned(),
                max_tokens: MAX_TOKENS_VALIDATE,
            })
            .await?;

        let value = json::extract_json(&completion.text)?;
        let (is_valid, issues, confidence, corrected_data) = parse_validation(&value);
        Ok(LlmValidation {
            is_valid,
            issues,
            confidence,
            corrected_data,
            meta: self.meta(template.id, prompt, completion, elapsed_ms),
        })
    }

    /// Produce corrected data for the reported issues.
    async fn correct(
        &self,
        data: &Map<String, Value>,
        issues: &[ValidationIssue],
        doc_type: DocumentType,
        file: Option<&DocumentPayload>,
    ) -> Result<Correction, LlmError> {
        self.ensure_media(file)?;
        let template = prompts::template(PipelineStage::Correction, Some(doc_type));
        let data_json = serde_json::to_string_pretty(data).unwrap_or_default();
        let issue_list = issues
            .iter()
            .map(|i| format!("- {} [{}]: {}", i.field, i.severity.as_str(), i.issue))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = template.render(&[
            ("document_type", doc_type.as_str()),
            ("data", data_json.as_str()),
            ("issues", issue_list.as_str()),
        ]);

        let (completion, elapsed_ms) = self
            .run(VisionRequest {
                system: template.system.to_string(),
                prompt: prompt.clone(),
                file: file.cloned(),
                max_tokens: MAX_TOKENS_CORRECT,
            })
            .await?;

        let value = json::extract_json(&completion.text)?;
        let (corrected, changes, confidence) = parse_correction(&value)?;
        Ok(Correction {
            data: corrected,
            changes,
            confidence,
            meta: self.meta(template.id, prompt, completion, elapsed_ms),
        })
    }

    /// Reject media this provider cannot process before any HTTP call.
    fn ensure_media(&self, file: Option<&DocumentPayload>) -> Result<(), LlmError> {
        match file {
            Some(f) if f.is_pdf() && !self.supports_pdf() => Err(LlmError::UnsupportedMedia {
                provider: self.name().to_string(),
                mime_type: f.mime_type().to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Run a request through the shared retry wrapper, timing it.
    async fn run(&self, request: VisionRequest) -> Result<(RawCompletion, u64), LlmError> {
        let started = Instant::now();
        let completion = retry::retry(&RetryPolicy::default(), || self.complete(request.clone())).await?;
        Ok((completion, started.elapsed().as_millis() as u64))
    }

    /// Assemble audit bookkeeping for a finished call.
    fn meta(
        &self,
        prompt_id: &str,
        prompt_text: String,
        completion: RawCompletion,
        elapsed_ms: u64,
    ) -> CallMeta {
        let cost_estimate = pricing::lookup(self.name(), &completion.model)
            .compute_cost(completion.usage.input_tokens, completion.usage.output_tokens);
        CallMeta {
            provider: self.name().to_string(),
            model: completion.model,
            prompt_id: prompt_id.to_string(),
            prompt_text,
            raw_response: completion.text,
            usage: completion.usage,
            elapsed_ms,
            cost_estimate,
        }
    }
}

// ── Stage response interpretation ────────────────────────────────────

fn clamp_confidence(value: Option<f64>, fallback: f64) -> f64 {
    value.unwrap_or(fallback).clamp(0.0, 1.0)
}

fn parse_classification(value: &Value) -> Result<(DocumentType, f64, String), LlmError> {
    let label = value
        .get("document_type")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::Parse("classification response lacks document_type".to_string()))?;
    let document_type = DocumentType::parse_lenient(label);
    let confidence = clamp_confidence(value.get("confidence").and_then(Value::as_f64), 0.5);
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok((document_type, confidence, reasoning))
}

fn parse_extraction(value: &Value) -> (Vec<ExtractedField>, Map<String, Value>, f64) {
    let mut fields = Vec::new();

    if let Some(array) = value.get("fields").and_then(Value::as_array) {
        for entry in array {
            let Some(name) = entry.get("name").and_then(Value::as_str) else {
                continue;
            };
            fields.push(ExtractedField {
                name: name.to_string(),
                value: entry.get("value").cloned().unwrap_or(Value::Null),
                confidence: entry.get("confidence").and_then(Value::as_f64),
            });
        }
    } else if let Some(object) = value.as_object() {
        // Some models answer with a flat map instead of a field list.
        for (name, field_value) in object {
            if name == "confidence" {
                continue;
            }
            fields.push(ExtractedField {
                name: name.clone(),
                value: field_value.clone(),
                confidence: None,
            });
        }
    }

    // Drop fields the model could not read at all.
    fields.retain(|f| !f.value.is_null());

    let mut data = value
        .get("data")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    if data.is_empty() {
        for field in &fields {
            data.insert(field.name.clone(), field.value.clone());
        }
    }

    let field_confidences: Vec<f64> = fields.iter().filter_map(|f| f.confidence).collect();
    let confidence = if field_confidences.is_empty() {
        clamp_confidence(
            value.get("confidence").and_then(Value::as_f64),
            EXTRACTION_FALLBACK_CONFIDENCE,
        )
    } else {
        let sum: f64 = field_confidences.iter().sum();
        (sum / field_confidences.len() as f64).clamp(0.0, 1.0)
    };

    (fields, data, confidence)
}

fn parse_validation(value: &Value) -> (bool, Vec<ValidationIssue>, f64, Option<Map<String, Value>>) {
    let mut issues = Vec::new();
    if let Some(array) = value.get("issues").and_then(Value::as_array) {
        for entry in array {
            let field = entry
                .get("field")
                .and_then(Value::as_str)
                .unwrap_or("_document")
                .to_string();
            let Some(text) = entry
                .get("issue")
                .or_else(|| entry.get("message"))
                .or_else(|| entry.get("description"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            let severity = entry
                .get("severity")
                .and_then(Value::as_str)
                .map_or(Severity::Warning, Severity::parse_lenient);
            let mut issue = ValidationIssue::new(field, text, severity);
            issue.suggested_fix = entry
                .get("suggested_fix")
                .and_then(Value::as_str)
                .map(str::to_string);
            issues.push(issue);
        }
    }

    let is_valid = value
        .get("is_valid")
        .or_else(|| value.get("valid"))
        .and_then(Value::as_bool)
        .unwrap_or_else(|| rules::error_count(&issues) == 0);

    let confidence = clamp_confidence(value.get("confidence").and_then(Value::as_f64), 0.5);
    let corrected_data = value
        .get("corrected_data")
        .and_then(Value::as_object)
        .cloned();

    (is_valid, rules::dedup_and_sort(issues), confidence, corrected_data)
}

fn parse_correction(value: &Value) -> Result<(Map<String, Value>, Vec<FieldChange>, f64), LlmError> {
    let corrected = value
        .get("corrected_data")
        .or_else(|| value.get("data"))
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| LlmError::Parse("correction response lacks corrected_data".to_string()))?;

    let mut changes = Vec::new();
    if let Some(array) = value.get("changes").and_then(Value::as_array) {
        for entry in array {
            let Some(field) = entry.get("field").and_then(Value::as_str) else {
                continue;
            };
            changes.push(FieldChange {
                field: field.to_string(),
                old_value: entry.get("old_value").cloned().unwrap_or(Value::Null),
                new_value: entry.get("new_value").cloned().unwrap_or(Value::Null),
                reasoning: entry
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
    }

    let confidence = clamp_confidence(value.get("confidence").and_then(Value::as_f64), 0.5);
    Ok((corrected, changes, confidence))
}
