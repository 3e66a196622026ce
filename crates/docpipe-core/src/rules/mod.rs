//! Deterministic business rules for extracted document data.
//!
//! Each document type has required fields and a set of semantic checks
//! that run against the extracted JSON map. Rules are pure: the same
//! input always yields the same issues, and nothing is mutated.
//! LLM validation issues share the [`ValidationIssue`] shape so the
//! pipeline treats both sources uniformly.

pub mod configs;

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::DocumentType;

/// Tolerance for monetary equality checks, absorbing rounding.
pub const AMOUNT_TOLERANCE: f64 = 0.02;

/// Severity of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    /// The wire string ("error", "warning", "info").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }

    /// Lenient parse for LLM-reported severities; unknown labels
    /// degrade to `Warning`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "error" | "critical" | "fatal" => Self::Error,
            "info" | "information" | "note" => Self::Info,
            _ => Self::Warning,
        }
    }
}

/// One problem found in extracted data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Dotted path of the offending field.
    pub field: String,
    /// Human-readable description.
    pub issue: String,
    /// How serious the problem is.
    pub severity: Severity,
    /// Suggested replacement value, when one is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

impl ValidationIssue {
    /// Create an issue without a suggested fix.
    pub fn new(field: impl Into<String>, issue: impl Into<String>, severity: Severity) -> Self {
        Self {
            field: field.into(),
            issue: issue.into(),
            severity,
            suggested_fix: None,
        }
    }

    /// The deduplication key.
    fn key(&self) -> (String, String, Severity) {
        (self.field.clone(), self.issue.clone(), self.severity)
    }
}

/// Deduplicate by `(field, issue, severity)` and sort errors first.
pub fn dedup_and_sort(mut issues: Vec<ValidationIssue>) -> Vec<ValidationIssue> {
    issues.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| a.field.cmp(&b.field))
            .then_with(|| a.issue.cmp(&b.issue))
    });
    issues.dedup_by_key(|i| i.key());
    issues
}

/// Count issues at `Error` severity.
pub fn error_count(issues: &[ValidationIssue]) -> usize {
    issues.iter().filter(|i| i.severity == Severity::Error).count()
}

/// Count issues at `Warning` severity.
pub fn warning_count(issues: &[ValidationIssue]) -> usize {
    issues
        .iter()
        .filter(|i| i.severity == Severity::Warning)
        .count()
}

/// Outcome of one rule check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    /// The rule holds.
    Pass,
    /// The rule is violated.
    Fail,
    /// The fields the rule needs are absent; nothing to check.
    Inapplicable,
    /// The fields exist but could not be interpreted.
    Unknown,
}

/// A single semantic check over the extracted map.
pub struct Rule {
    /// Field the issue is reported against.
    pub field: &'static str,
    /// Message emitted on failure.
    pub message: &'static str,
    /// Severity of a failure.
    pub severity: Severity,
    /// The predicate. Must be deterministic and side-effect free.
    pub check: fn(&Map<String, Value>) -> RuleOutcome,
}

/// Required/optional fields and rules for one document type.
pub struct TypeRules {
    pub required_fields: &'static [&'static str],
    pub optional_fields: &'static [&'static str],
    pub rules: Vec<Rule>,
}

/// Run the business rules for a document type against extracted data.
///
/// Missing required fields become `Error` issues; a rule whose operands
/// cannot be interpreted becomes a `Warning` rather than a failure. The
/// result is deduplicated and sorted by severity.
pub fn validate(doc_type: DocumentType, data: &Map<String, Value>) -> Vec<ValidationIssue> {
    let config = configs::rules_for(doc_type);
    let mut issues = Vec::new();

    for field in config.required_fields {
        if !has_content(data, field) {
            issues.push(ValidationIssue::new(
                *field,
                format!("required field '{field}' is missing"),
                Severity::Error,
            ));
        }
    }

    for rule in &config.rules {
        match (rule.check)(data) {
            RuleOutcome::Pass | RuleOutcome::Inapplicable => {}
            RuleOutcome::Fail => {
                issues.push(ValidationIssue::new(rule.field, rule.message, rule.severity));
            }
            RuleOutcome::Unknown => {
                issues.push(ValidationIssue::new(
                    rule.field,
                    format!("unable to validate '{}'", rule.field),
                    Severity::Warning,
                ));
            }
        }
    }

    dedup_and_sort(issues)
}

/// Render the rules of a document type as prompt-ready text.
pub fn rules_summary(doc_type: DocumentType) -> String {
    let config = configs::rules_for(doc_type);
    let mut out = String::new();

    if !config.required_fields.is_empty() {
        out.push_str("Required fields: ");
        out.push_str(&config.required_fields.join(", "));
        out.push('\n');
    }
    for rule in &config.rules {
        out.push_str("- ");
        out.push_str(rule.message);
        out.push_str(" (");
        out.push_str(rule.severity.as_str());
        out.push_str(")\n");
    }
    if out.is_empty() {
        out.push_str("No specific rules for this document type.\n");
    }
    out
}

// ── Value helpers ────────────────────────────────────────────────────
//
// Extraction output is arbitrary JSON: numbers arrive as strings with
// currency symbols, dates in several formats, names nested one level
// deep. These helpers normalize without mutating.

/// Look up a dotted path (`merchant.name`).
pub fn lookup<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut current: &Value = data.get(path.split('.').next()?)?;
    for segment in path.split('.').skip(1) {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Whether a field exists and is non-empty.
///
/// An object counts as content when it has any entry (a `merchant`
/// object with a `name` satisfies a required `merchant` field).
pub fn has_content(data: &Map<String, Value>, path: &str) -> bool {
    match lookup(data, path) {
        Some(Value::Null) | None => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(_) => true,
    }
}

/// Read a numeric field, accepting numbers-as-strings with currency
/// symbols and thousands separators.
pub fn number_field(data: &Map<String, Value>, path: &str) -> Option<f64> {
    match lookup(data, path)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_amount(s),
        _ => None,
    }
}

/// Read a string field, trimmed; `None` when absent or empty.
pub fn string_field(data: &Map<String, Value>, path: &str) -> Option<String> {
    match lookup(data, path)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read a date field in any of the common layouts extraction produces.
pub fn date_field(data: &Map<String, Value>, path: &str) -> Option<NaiveDate> {
    let raw = string_field(data, path)?;
    parse_date(&raw)
}

/// Parse a monetary amount from free-form text.
pub fn parse_amount(s: &str) -> Option<f64> {
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// Parse a date from the layouts LLM extraction commonly emits.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    // ISO timestamps: take the date part.
    let candidate = if s.len() > 10 && s.as_bytes().get(10) == Some(&b'T') {
        &s[..10]
    } else {
        s
    };
    for format in ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%m/%d/%Y", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(candidate, format) {
            return Some(date);
        }
    }
    None
}

/// Two amounts are equal within [`AMOUNT_TOLERANCE`].
pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= AMOUNT_TOLERANCE
}

/// Today's date, for "not in the future" checks.
pub(crate) fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// The current calendar year, for tax-year plausibility.
pub(crate) fn current_year() -> i32 {
    Utc::now().year()
}
