//! Permissive JSON extraction from raw LLM text.
//!
//! Models wrap JSON in markdown fences, prepend prose, or append
//! commentary. Parsing strips fences first, then falls back to the
//! outermost brace span before giving up with a typed parse error.

use serde_json::{Map, Value};

use crate::error::LlmError;

/// Extract a JSON value from LLM output.
pub fn extract_json(text: &str) -> Result<Value, LlmError> {
    let stripped = strip_code_fences(text);

    if let Ok(value) = serde_json::from_str(stripped) {
        return Ok(value);
    }

    // Fallback: the outermost object span.
    if let (Some(start), Some(end)) = (stripped.find('{'), stripped.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&stripped[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(LlmError::Parse(format!(
        "response is not valid JSON: {}",
        truncate(text, 200)
    )))
}

/// Extract a JSON object, rejecting bare arrays/scalars.
pub fn extract_object(text: &str) -> Result<Map<String, Value>, LlmError> {
    match extract_json(text)? {
        Value::Object(map) => Ok(map),
        other => Err(LlmError::Parse(format!(
            "expected a JSON object, got {}",
            type_name(&other)
        ))),
    }
}

/// Remove a surrounding markdown code fence, if any.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", …) on the opening fence line.
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bare_json() {
        let value = extract_json(r#"{"confidence": 0.9}"#).expect("parse");
        assert_eq!(value, json!({"confidence": 0.9}));
    }

    #[test]
    fn unwraps_json_fence() {
        let text = "```json\n{\"document_type\": \"INVOICE\"}\n```";
        let value = extract_json(text).expect("parse");
        assert_eq!(value["document_type"], "INVOICE");
    }

    #[test]
    fn unwraps_plain_fence() {
        let text = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json(text).expect("parse"), json!({"a": 1}));
    }

    #[test]
    fn slices_object_out_of_prose() {
        let text = "Here is the result you asked for:\n{\"a\": 1}\nLet me know if you need more.";
        assert_eq!(extract_json(text).expect("parse"), json!({"a": 1}));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = extract_json("no json here").unwrap_err();
        assert!(matches!(err, LlmError::Parse(_)));
    }

    #[test]
    fn object_extraction_rejects_arrays() {
        let err = extract_object("[1, 2, 3]").unwrap_err();
        match err {
            LlmError::Parse(msg) => assert!(msg.contains("an array")),
            other => panic!("expected Parse, got: {other}"),
        }
    }

    #[test]
    fn nested_fences_inside_strings_survive() {
        let text = "```json\n{\"note\": \"use ``` for code\"}\n```";
        let value = extract_json(text).expect("parse");
        assert_eq!(value["note"], "use ``` for code");
    }
}
