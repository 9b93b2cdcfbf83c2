//! Tolerant parsing of JSON embedded in model completions.

use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("model output contains no JSON object")]
    NoJsonObject,
    #[error("model output JSON is missing `{0}`")]
    MissingField(&'static str),
    #[error("model output field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Find and parse the first balanced `{...}` object in `text`, skipping code
/// fences and any prose around it.
pub fn extract_json_object(text: &str) -> Result<JsonValue, ParseError> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = matching_brace(bytes, start) {
            if let Ok(value) = serde_json::from_str::<JsonValue>(&text[start..=end]) {
                if value.is_object() {
                    return Ok(value);
                }
            }
        }
        search_from = start + 1;
    }
    Err(ParseError::NoJsonObject)
}

fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Render a field as text whether the model produced a string, list or number.
pub fn text_field(value: &JsonValue, key: &str) -> String {
    match value.get(key) {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(scalar_text)
            .collect::<Vec<_>>()
            .join("; "),
        Some(other) => scalar_text(other).unwrap_or_default(),
        None => String::new(),
    }
}

pub fn list_field(value: &JsonValue, key: &str) -> Vec<String> {
    match value.get(key) {
        Some(JsonValue::Array(items)) => items.iter().filter_map(scalar_text).collect(),
        Some(JsonValue::String(s)) => s
            .split([',', ';', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Read a numeric field that may arrive as a number or a numeric string.
pub fn number_field(value: &JsonValue, key: &'static str) -> Result<f64, ParseError> {
    match value.get(key) {
        Some(JsonValue::Number(n)) => n.as_f64().ok_or(ParseError::InvalidField {
            field: key,
            reason: "not representable as f64".into(),
        }),
        Some(JsonValue::String(s)) => s.trim().trim_end_matches('%').parse::<f64>().map_err(|e| {
            ParseError::InvalidField {
                field: key,
                reason: e.to_string(),
            }
        }),
        Some(other) => Err(ParseError::InvalidField {
            field: key,
            reason: format!("unexpected type {other}"),
        }),
        None => Err(ParseError::MissingField(key)),
    }
}
