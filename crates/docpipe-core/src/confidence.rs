//! Weighted confidence model for processed documents.
//!
//! Aggregates per-stage confidences into one score, applies penalties
//! for validation failures, and decides whether a human needs to look
//! at the result. All inputs are sanitized: NaN, infinities, and
//! out-of-range values clamp to [0, 1] with a log line.

/// Stage weights. Correction only contributes when a correction was
/// actually applied, so the base weights do not renormalize without it.
pub const WEIGHT_CLASSIFICATION: f64 = 0.10;
pub const WEIGHT_EXTRACTION: f64 = 0.50;
pub const WEIGHT_VALIDATION: f64 = 0.30;
pub const WEIGHT_CORRECTION: f64 = 0.10;

/// Documents scoring below this are routed to human review.
pub const REVIEW_THRESHOLD: f64 = 0.95;

/// Ceiling applied when a correction was attempted but failed.
pub const CORRECTION_FAILED_CAP: f64 = 0.30;

/// Multiplier applied when validation failed and no correction ran.
pub const UNCORRECTED_INVALID_FACTOR: f64 = 0.70;

/// Outcome of the correction stage, as seen by the calculator.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrectionOutcome {
    /// Confidence the correction model reported.
    pub confidence: f64,
    /// Whether corrected data replaced the extraction.
    pub applied: bool,
    /// Whether correction was attempted and did not stick (the call
    /// errored, or re-validation still failed).
    pub failed: bool,
}

/// Everything the calculator needs from the pipeline.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceInputs {
    /// Classification stage confidence.
    pub classification: f64,
    /// Extraction stage confidence.
    pub extraction: f64,
    /// Number of fields extraction produced.
    pub field_count: usize,
    /// Validation confidence, already adjusted for business-rule
    /// severity by the caller.
    pub validation: f64,
    /// Combined validity: LLM verdict AND no business-rule errors.
    pub is_valid: bool,
    /// Error-severity issue count.
    pub error_count: usize,
    /// Warning-severity issue count.
    pub warning_count: usize,
    /// Correction stage outcome, when one ran.
    pub correction: Option<CorrectionOutcome>,
}

/// The computed score and review decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceReport {
    /// Final score in [0, 1].
    pub score: f64,
    /// Whether a human must review the document.
    pub needs_review: bool,
}

/// Coarse display bucket for a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    Critical,
}

impl ConfidenceLevel {
    /// Bucket a score: high ≥ 0.90, medium ≥ 0.70, low ≥ 0.40, else critical.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.90 {
            Self::High
        } else if score >= 0.70 {
            Self::Medium
        } else if score >= 0.40 {
            Self::Low
        } else {
            Self::Critical
        }
    }

    /// Label for dashboards and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Critical => "critical",
        }
    }
}

/// Clamp a raw confidence into [0, 1], logging anything abnormal.
pub fn sanitize(value: f64) -> f64 {
    if value.is_nan() {
        tracing::warn!("confidence input was NaN, clamping to 0");
        return 0.0;
    }
    if !(0.0..=1.0).contains(&value) {
        tracing::warn!(value, "confidence input out of range, clamping");
        return value.clamp(0.0, 1.0);
    }
    value
}

/// Penalty applied to the validation contribution when the combined
/// verdict is invalid: errors cost 0.15 each (cap 0.75), warnings 0.05
/// each (cap 0.20).
pub fn issue_penalty(error_count: usize, warning_count: usize) -> f64 {
    let errors = (error_count as f64 * 0.15).min(0.75);
    let warnings = (warning_count as f64 * 0.05).min(0.20);
    errors + warnings
}

/// Adjust a raw LLM validation confidence for authoritative
/// business-rule findings, before it enters the weighted model.
///
/// No-op when the deterministic rules found no errors.
pub fn business_rule_adjusted(raw: f64, error_count: usize, warning_count: usize) -> f64 {
    let raw = sanitize(raw);
    if error_count == 0 {
        return raw;
    }
    let total_penalty = (0.25
        + (0.15 * error_count as f64).min(0.55)
        + (0.05 * warning_count as f64).min(0.20))
    .min(0.80);
    raw * (1.0 - total_penalty)
}

/// Compute the overall document confidence and review decision.
pub fn overall(inputs: &ConfidenceInputs) -> ConfidenceReport {
    // Extraction that produced nothing is not a low-confidence result,
    // it is no result.
    if inputs.field_count == 0 {
        return ConfidenceReport {
            score: 0.0,
            needs_review: true,
        };
    }

    let classification = sanitize(inputs.classification);
    let extraction = sanitize(inputs.extraction);

    let mut validation = sanitize(inputs.validation);
    if !inputs.is_valid {
        validation = (validation - issue_penalty(inputs.error_count, inputs.warning_count)).max(0.0);
    }

    let mut score = classification * WEIGHT_CLASSIFICATION
        + extraction * WEIGHT_EXTRACTION
        + validation * WEIGHT_VALIDATION;

    let correction_failed = inputs.correction.is_some_and(|c| c.failed);

    match inputs.correction {
        Some(correction) if correction.applied && !correction.failed => {
            score += sanitize(correction.confidence) * WEIGHT_CORRECTION;
        }
        Some(_) if correction_failed => {
            score = score.min(CORRECTION_FAILED_CAP);
        }
        _ => {}
    }

    if !inputs.is_valid && inputs.correction.is_none() {
        score *= UNCORRECTED_INVALID_FACTOR;
    }

    let score = score.clamp(0.0, 1.0);
    ConfidenceReport {
        score,
        needs_review: score < REVIEW_THRESHOLD || !inputs.is_valid || correction_failed,
    }
}

/// Format a score as a percentage with one decimal, e.g. "87.5%".
pub fn format_percent(score: f64) -> String {
    format!("{:.1}%", sanitize(score) * 100.0)
}
