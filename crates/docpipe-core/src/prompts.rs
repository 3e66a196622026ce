//! Prompt registry for pipeline stages.
//!
//! Prompts are data, not string concatenation scattered through the
//! code: each stage resolves a versioned template keyed by
//! `(stage, document type)`, and the template id is recorded in the
//! audit trail so any response can be reproduced later.

use crate::document::{DocumentType, PipelineStage};

/// A versioned prompt template with `{placeholder}` slots.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    /// Stable identifier recorded in audit rows, e.g. `extract.invoice.v1`.
    pub id: &'static str,
    /// System prompt.
    pub system: &'static str,
    /// User-message template.
    pub template: &'static str,
}

impl PromptTemplate {
    /// Substitute `{name}` slots with the given values.
    ///
    /// Unknown slots are left intact; prompts must stay inspectable
    /// even when a variable is missing.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut out = self.template.to_string();
        for (name, value) in vars {
            out = out.replace(&format!("{{{name}}}"), value);
        }
        out
    }
}

const CLASSIFY_V1: PromptTemplate = PromptTemplate {
    id: "classify.v1",
    system: "You are a document classification engine. You answer with a single JSON object and nothing else.",
    template: "Classify the attached document into exactly one of these types: {types}.\n\
               Respond with JSON: {\"document_type\": \"<TYPE>\", \"confidence\": <0.0-1.0>, \"reasoning\": \"<one sentence>\"}",
};

const EXTRACT_V1: PromptTemplate = PromptTemplate {
    id: "extract.v1",
    system: "You are a document data extraction engine. You answer with a single JSON object and nothing else.",
    template: "Extract the data fields of this {document_type} document.\n\
               Expected fields (extract others you find as well): {fields}.\n\
               Respond with JSON: {\"fields\": [{\"name\": \"<field>\", \"value\": <value>, \"confidence\": <0.0-1.0>}], \"confidence\": <overall 0.0-1.0>}.\n\
               Use null for values you cannot read. Dates as YYYY-MM-DD. Amounts as plain numbers.",
};

const EXTRACT_INVOICE_V2: PromptTemplate = PromptTemplate {
    id: "extract.invoice.v2",
    system: "You are a document data extraction engine. You answer with a single JSON object and nothing else.",
    template: "Extract the data fields of this invoice.\n\
               Expected fields (extract others you find as well): {fields}.\n\
               Line items go under \"line_items\" as an array of {\"description\", \"quantity\", \"unit_price\", \"amount\"}.\n\
               Respond with JSON: {\"fields\": [{\"name\": \"<field>\", \"value\": <value>, \"confidence\": <0.0-1.0>}], \"confidence\": <overall 0.0-1.0>}.\n\
               Use null for values you cannot read. Dates as YYYY-MM-DD. Amounts as plain numbers without currency symbols.",
};

const VALIDATE_V1: PromptTemplate = PromptTemplate {
    id: "validate.v1",
    system: "You are a document validation engine. Cross-check extracted data against the document image when one is attached. You answer with a single JSON object and nothing else.",
    template: "Validate this extracted {document_type} data:\n{data}\n\n\
               Apply these rules:\n{rules}\n\
               Respond with JSON: {\"is_valid\": <bool>, \"confidence\": <0.0-1.0>, \"issues\": [{\"field\": \"<field>\", \"issue\": \"<description>\", \"severity\": \"error|warning|info\", \"suggested_fix\": \"<value or omit>\"}]}",
};

const CORRECT_V1: PromptTemplate = PromptTemplate {
    id: "correct.v1",
    system: "You are a document correction engine. Fix only the reported issues; never invent data that is not visible in the document. You answer with a single JSON object and nothing else.",
    template: "This extracted {document_type} data failed validation:\n{data}\n\n\
               Issues:\n{issues}\n\
               Respond with JSON: {\"corrected_data\": {<full corrected map>}, \"confidence\": <0.0-1.0>, \"changes\": [{\"field\": \"<field>\", \"old_value\": <value>, \"new_value\": <value>, \"reasoning\": \"<one sentence>\"}]}",
};

/// Resolve the template for a stage, preferring a type-specific entry.
pub fn template(stage: PipelineStage, doc_type: Option<DocumentType>) -> &'static PromptTemplate {
    match (stage, doc_type) {
        (PipelineStage::Extraction, Some(DocumentType::Invoice)) => &EXTRACT_INVOICE_V2,
        (PipelineStage::Extraction, _) => &EXTRACT_V1,
        (PipelineStage::Validation | PipelineStage::Revalidation, _) => &VALIDATE_V1,
        (PipelineStage::Correction, _) => &CORRECT_V1,
        _ => &CLASSIFY_V1,
    }
}
