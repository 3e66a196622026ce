//! Per-document-type rule sets.
//!
//! Numeric equality uses [`super::AMOUNT_TOLERANCE`]; dates compare
//! against today in UTC. A rule whose operands are missing reports
//! `Inapplicable` (skipped); operands that exist but resist parsing
//! report `Unknown`, which the engine downgrades to a warning.

use serde_json::{Map, Value};

use super::{
    approx_eq, current_year, date_field, has_content, lookup, number_field, string_field, today,
    Rule, RuleOutcome, Severity, TypeRules,
};
use crate::document::DocumentType;

/// Payment methods recognized on receipts.
const PAYMENT_METHODS: [&str; 8] = [
    "cash", "card", "credit", "debit", "mobile", "online", "check", "other",
];

/// The rule configuration for a document type.
pub fn rules_for(doc_type: DocumentType) -> TypeRules {
    match doc_type {
        DocumentType::Invoice => invoice_rules(),
        DocumentType::Receipt => receipt_rules(),
        DocumentType::Payslip => payslip_rules(),
        DocumentType::BankStatement => bank_statement_rules(),
        DocumentType::TaxForm => tax_form_rules(),
        DocumentType::Contract => contract_rules(),
        DocumentType::Other => TypeRules {
            required_fields: &[],
            optional_fields: &[],
            rules: Vec::new(),
        },
    }
}

// ── Shared check fragments ───────────────────────────────────────────

/// Check that a numeric field is strictly positive.
fn positive(data: &Map<String, Value>, field: &str) -> RuleOutcome {
    if !has_content(data, field) {
        return RuleOutcome::Inapplicable;
    }
    match number_field(data, field) {
        Some(v) if v > 0.0 => RuleOutcome::Pass,
        Some(_) => RuleOutcome::Fail,
        None => RuleOutcome::Unknown,
    }
}

/// Check that a date field is not in the future.
fn not_future(data: &Map<String, Value>, field: &str) -> RuleOutcome {
    if !has_content(data, field) {
        return RuleOutcome::Inapplicable;
    }
    match date_field(data, field) {
        Some(d) if d <= today() => RuleOutcome::Pass,
        Some(_) => RuleOutcome::Fail,
        None => RuleOutcome::Unknown,
    }
}

/// Check `later ≥ earlier` over two date fields when both are present.
fn date_ordered(data: &Map<String, Value>, earlier: &str, later: &str) -> RuleOutcome {
    if !has_content(data, later) || !has_content(data, earlier) {
        return RuleOutcome::Inapplicable;
    }
    match (date_field(data, earlier), date_field(data, later)) {
        (Some(a), Some(b)) if b >= a => RuleOutcome::Pass,
        (Some(_), Some(_)) => RuleOutcome::Fail,
        _ => RuleOutcome::Unknown,
    }
}

/// Check that a string field's length is in `[min, max)`.
fn length_in(data: &Map<String, Value>, field: &str, min: usize, max: usize) -> RuleOutcome {
    if !has_content(data, field) {
        return RuleOutcome::Inapplicable;
    }
    match string_field(data, field) {
        Some(s) if (min..max).contains(&s.chars().count()) => RuleOutcome::Pass,
        Some(_) => RuleOutcome::Fail,
        None => RuleOutcome::Unknown,
    }
}

// ── INVOICE ──────────────────────────────────────────────────────────

fn invoice_rules() -> TypeRules {
    TypeRules {
        required_fields: &["invoice_number", "date", "total", "currency"],
        optional_fields: &["subtotal", "tax", "due_date", "vendor", "line_items"],
        rules: vec![
            Rule {
                field: "total",
                message: "total must be greater than zero",
                severity: Severity::Error,
                check: |data| positive(data, "total"),
            },
            Rule {
                field: "date",
                message: "invoice date must not be in the future",
                severity: Severity::Error,
                check: |data| not_future(data, "date"),
            },
            Rule {
                field: "total",
                message: "subtotal + tax must equal total",
                severity: Severity::Error,
                check: |data| {
                    let (Some(subtotal), Some(tax)) =
                        (number_field(data, "subtotal"), number_field(data, "tax"))
                    else {
                        if has_content(data, "subtotal") && has_content(data, "tax") {
                            return RuleOutcome::Unknown;
                        }
                        return RuleOutcome::Inapplicable;
                    };
                    match number_field(data, "total") {
                        Some(total) if approx_eq(subtotal + tax, total) => RuleOutcome::Pass,
                        Some(_) => RuleOutcome::Fail,
                        None => RuleOutcome::Unknown,
                    }
                },
            },
            Rule {
                field: "due_date",
                message: "due date should not precede the invoice date",
                severity: Severity::Warning,
                check: |data| date_ordered(data, "date", "due_date"),
            },
            Rule {
                field: "invoice_number",
                message: "invoice number must be between 1 and 99 characters",
                severity: Severity::Error,
                check: |data| length_in(data, "invoice_number", 1, 100),
            },
        ],
    }
}

// ── RECEIPT ──────────────────────────────────────────────────────────

fn receipt_rules() -> TypeRules {
    TypeRules {
        required_fields: &["merchant", "total", "date", "currency"],
        optional_fields: &["tax", "tip", "payment_method", "items"],
        rules: vec![
            Rule {
                field: "total",
                message: "total must be greater than zero",
                severity: Severity::Error,
                check: |data| positive(data, "total"),
            },
            Rule {
                field: "merchant",
                message: "merchant name must not be empty",
                severity: Severity::Error,
                check: |data| {
                    if !has_content(data, "merchant") {
                        return RuleOutcome::Inapplicable;
                    }
                    // Accept either a bare string or a nested object with a name.
                    let name = match lookup(data, "merchant") {
                        Some(Value::Object(_)) => string_field(data, "merchant.name"),
                        _ => string_field(data, "merchant"),
                    };
                    match name {
                        Some(_) => RuleOutcome::Pass,
                        None => RuleOutcome::Fail,
                    }
                },
            },
            Rule {
                field: "date",
                message: "receipt date must not be in the future",
                severity: Severity::Error,
                check: |data| not_future(data, "date"),
            },
            Rule {
                field: "payment_method",
                message: "unrecognized payment method",
                severity: Severity::Info,
                check: |data| {
                    let Some(method) = string_field(data, "payment_method") else {
                        return RuleOutcome::Inapplicable;
                    };
                    let normalized = method.to_lowercase();
                    if PAYMENT_METHODS.iter().any(|m| normalized.contains(m)) {
                        RuleOutcome::Pass
                    } else {
                        RuleOutcome::Fail
                    }
                },
            },
            Rule {
                field: "tax",
                message: "tax should be less than the total",
                severity: Severity::Warning,
                check: |data| amount_less_than_total(data, "tax"),
            },
            Rule {
                field: "tip",
                message: "tip should be less than the total",
                severity: Severity::Warning,
                check: |data| amount_less_than_total(data, "tip"),
            },
        ],
    }
}

/// Check `data[field] < data.total` when both are present.
fn amount_less_than_total(data: &Map<String, Value>, field: &str) -> RuleOutcome {
    if !has_content(data, field) {
        return RuleOutcome::Inapplicable;
    }
    match (number_field(data, field), number_field(data, "total")) {
        (Some(v), Some(total)) if v < total => RuleOutcome::Pass,
        (Some(_), Some(_)) => RuleOutcome::Fail,
        _ => RuleOutcome::Unknown,
    }
}

// ── PAYSLIP ──────────────────────────────────────────────────────────

fn payslip_rules() -> TypeRules {
    TypeRules {
        required_fields: &[
            "employee_name",
            "period",
            "gross_salary",
            "net_salary",
            "currency",
        ],
        optional_fields: &["deductions", "employer", "payment_date"],
        rules: vec![
            Rule {
                field: "gross_salary",
                message: "gross salary must be greater than zero",
                severity: Severity::Error,
                check: |data| positive(data, "gross_salary"),
            },
            Rule {
                field: "net_salary",
                message: "net salary must be positive and not exceed gross salary",
                severity: Severity::Error,
                check: |data| {
                    if !has_content(data, "net_salary") {
                        return RuleOutcome::Inapplicable;
                    }
                    match (
                        number_field(data, "net_salary"),
                        number_field(data, "gross_salary"),
                    ) {
                        (Some(net), Some(gross)) if net > 0.0 && net <= gross + super::AMOUNT_TOLERANCE => {
                            RuleOutcome::Pass
                        }
                        (Some(net), None) if net > 0.0 => RuleOutcome::Pass,
                        (Some(_), _) => RuleOutcome::Fail,
                        (None, _) => RuleOutcome::Unknown,
                    }
                },
            },
            Rule {
                field: "net_salary",
                message: "gross salary minus deductions must equal net salary",
                severity: Severity::Error,
                check: |data| {
                    if !has_content(data, "deductions") {
                        return RuleOutcome::Inapplicable;
                    }
                    match (
                        number_field(data, "gross_salary"),
                        number_field(data, "deductions"),
                        number_field(data, "net_salary"),
                    ) {
                        (Some(gross), Some(deductions), Some(net)) => {
                            if approx_eq(gross - deductions, net) {
                                RuleOutcome::Pass
                            } else {
                                RuleOutcome::Fail
                            }
                        }
                        _ => RuleOutcome::Unknown,
                    }
                },
            },
            Rule {
                field: "employee_name",
                message: "employee name must be between 1 and 199 characters",
                severity: Severity::Error,
                check: |data| length_in(data, "employee_name", 1, 200),
            },
            Rule {
                field: "period",
                message: "pay period must not be empty",
                severity: Severity::Error,
                check: |data| {
                    if lookup(data, "period").is_none() {
                        return RuleOutcome::Inapplicable;
                    }
                    if has_content(data, "period") {
                        RuleOutcome::Pass
                    } else {
                        RuleOutcome::Fail
                    }
                },
            },
        ],
    }
}

// ── BANK_STATEMENT ───────────────────────────────────────────────────

fn bank_statement_rules() -> TypeRules {
    TypeRules {
        required_fields: &["account_number", "period_start", "period_end", "currency"],
        optional_fields: &["opening_balance", "closing_balance", "transactions"],
        rules: vec![
            Rule {
                field: "period_end",
                message: "statement period end must not precede its start",
                severity: Severity::Error,
                check: |data| date_ordered(data, "period_start", "period_end"),
            },
            Rule {
                field: "period_start",
                message: "statement period must not start in the future",
                severity: Severity::Error,
                check: |data| not_future(data, "period_start"),
            },
            Rule {
                field: "closing_balance",
                message: "opening balance plus transactions should equal closing balance",
                severity: Severity::Warning,
                check: |data| {
                    let (Some(opening), Some(closing)) = (
                        number_field(data, "opening_balance"),
                        number_field(data, "closing_balance"),
                    ) else {
                        return RuleOutcome::Inapplicable;
                    };
                    let Some(Value::Array(transactions)) = lookup(data, "transactions") else {
                        return RuleOutcome::Inapplicable;
                    };
                    let mut sum = 0.0;
                    for tx in transactions {
                        let amount = tx
                            .as_object()
                            .and_then(|t| number_field(t, "amount"))
                            .or_else(|| tx.as_f64());
                        match amount {
                            Some(a) => sum += a,
                            None => return RuleOutcome::Unknown,
                        }
                    }
                    if approx_eq(opening + sum, closing) {
                        RuleOutcome::Pass
                    } else {
                        RuleOutcome::Fail
                    }
                },
            },
        ],
    }
}

// ── TAX_FORM ─────────────────────────────────────────────────────────

fn tax_form_rules() -> TypeRules {
    TypeRules {
        required_fields: &["tax_year", "taxpayer_name"],
        optional_fields: &["total_tax", "total_income", "filing_status"],
        rules: vec![
            Rule {
                field: "tax_year",
                message: "tax year is implausibly far from the current year",
                severity: Severity::Warning,
                check: |data| {
                    if !has_content(data, "tax_year") {
                        return RuleOutcome::Inapplicable;
                    }
                    match number_field(data, "tax_year") {
                        Some(year) => {
                            let year = year as i32;
                            let now = current_year();
                            if (now - 10..=now + 1).contains(&year) {
                                RuleOutcome::Pass
                            } else {
                                RuleOutcome::Fail
                            }
                        }
                        None => RuleOutcome::Unknown,
                    }
                },
            },
            Rule {
                field: "total_tax",
                message: "total tax must not be negative",
                severity: Severity::Error,
                check: |data| {
                    if !has_content(data, "total_tax") {
                        return RuleOutcome::Inapplicable;
                    }
                    match number_field(data, "total_tax") {
                        Some(v) if v >= 0.0 => RuleOutcome::Pass,
                        Some(_) => RuleOutcome::Fail,
                        None => RuleOutcome::Unknown,
                    }
                },
            },
        ],
    }
}

// ── CONTRACT ─────────────────────────────────────────────────────────

fn contract_rules() -> TypeRules {
    TypeRules {
        required_fields: &["parties", "effective_date"],
        optional_fields: &["expiration_date", "governing_law", "signatures"],
        rules: vec![
            Rule {
                field: "effective_date",
                message: "effective date must be a recognizable date",
                severity: Severity::Error,
                check: |data| {
                    if !has_content(data, "effective_date") {
                        return RuleOutcome::Inapplicable;
                    }
                    match date_field(data, "effective_date") {
                        Some(_) => RuleOutcome::Pass,
                        None => RuleOutcome::Fail,
                    }
                },
            },
            Rule {
                field: "expiration_date",
                message: "expiration date should not precede the effective date",
                severity: Severity::Warning,
                check: |data| date_ordered(data, "effective_date", "expiration_date"),
            },
        ],
    }
}
