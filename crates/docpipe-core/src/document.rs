//! Document domain types shared across the pipeline, storage, and server.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Uploading,
    Processing,
    NeedsReview,
    Completed,
    Failed,
    Archived,
}

impl DocumentStatus {
    /// The canonical string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "UPLOADING",
            Self::Processing => "PROCESSING",
            Self::NeedsReview => "NEEDS_REVIEW",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Archived => "ARCHIVED",
        }
    }

    /// Parse a stored status string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UPLOADING" => Some(Self::Uploading),
            "PROCESSING" => Some(Self::Processing),
            "NEEDS_REVIEW" => Some(Self::NeedsReview),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "ARCHIVED" => Some(Self::Archived),
            _ => None,
        }
    }

    /// Whether a user-initiated retry is permitted from this status.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::NeedsReview)
    }
}

/// The kind of document the classifier recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    Invoice,
    Receipt,
    Payslip,
    BankStatement,
    TaxForm,
    Contract,
    Other,
}

impl DocumentType {
    /// The canonical string stored in the database and used in prompts.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "INVOICE",
            Self::Receipt => "RECEIPT",
            Self::Payslip => "PAYSLIP",
            Self::BankStatement => "BANK_STATEMENT",
            Self::TaxForm => "TAX_FORM",
            Self::Contract => "CONTRACT",
            Self::Other => "OTHER",
        }
    }

    /// Parse a type string, tolerating case and surrounding whitespace.
    ///
    /// Classifier output is LLM text, so unknown labels map to `Other`
    /// rather than failing the stage.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_uppercase().replace([' ', '-'], "_").as_str() {
            "INVOICE" => Self::Invoice,
            "RECEIPT" => Self::Receipt,
            "PAYSLIP" => Self::Payslip,
            "BANK_STATEMENT" => Self::BankStatement,
            "TAX_FORM" => Self::TaxForm,
            "CONTRACT" => Self::Contract,
            _ => Self::Other,
        }
    }

    /// Strict parse of a stored type string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INVOICE" => Some(Self::Invoice),
            "RECEIPT" => Some(Self::Receipt),
            "PAYSLIP" => Some(Self::Payslip),
            "BANK_STATEMENT" => Some(Self::BankStatement),
            "TAX_FORM" => Some(Self::TaxForm),
            "CONTRACT" => Some(Self::Contract),
            "OTHER" => Some(Self::Other),
            _ => None,
        }
    }

    /// Types where extraction mistakes are costly enough to justify
    /// multi-provider fan-out.
    pub fn is_high_stakes(&self) -> bool {
        matches!(
            self,
            Self::Invoice | Self::Payslip | Self::BankStatement | Self::TaxForm
        )
    }

    /// All known types, in display order.
    pub fn all() -> [DocumentType; 7] {
        [
            Self::Invoice,
            Self::Receipt,
            Self::Payslip,
            Self::BankStatement,
            Self::TaxForm,
            Self::Contract,
            Self::Other,
        ]
    }
}

/// One idempotent step of the per-document pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Upload,
    Classification,
    Extraction,
    Validation,
    Correction,
    Revalidation,
    Finalize,
}

impl PipelineStage {
    /// The canonical string stored in audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "UPLOAD",
            Self::Classification => "CLASSIFICATION",
            Self::Extraction => "EXTRACTION",
            Self::Validation => "VALIDATION",
            Self::Correction => "CORRECTION",
            Self::Revalidation => "REVALIDATION",
            Self::Finalize => "FINALIZE",
        }
    }
}

/// The document view carried on events and returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub id: String,
    pub status: String,
    pub document_type: Option<String>,
    pub confidence: Option<f64>,
    pub filename: String,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}
