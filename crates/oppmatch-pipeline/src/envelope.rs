//! Inbound queue batch and outbound partial-failure response.
//!
//! A message body points at one raw opportunity object. Three body shapes are
//! accepted: a bare `{bucket, key}` pointer, a storage-event notification, and
//! a fan-out wrapper whose `Message` field holds either of the other two as a
//! JSON string.

use oppmatch_core::{ProcessingError, SourceLocation, Stage};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<QueueMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attributes: MessageAttributes,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageAttributes {
    #[serde(rename = "ApproximateReceiveCount", default, skip_serializing_if = "Option::is_none")]
    pub approximate_receive_count: Option<String>,
}

impl QueueMessage {
    /// Delivery count reported by the queue; 1 when absent or unreadable.
    pub fn receive_count(&self) -> u32 {
        self.attributes
            .approximate_receive_count
            .as_deref()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(rename = "batchItemFailures")]
    pub batch_item_failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemFailure {
    #[serde(rename = "itemIdentifier")]
    pub item_identifier: String,
}

impl BatchResponse {
    pub fn failed_ids(&self) -> Vec<&str> {
        self.batch_item_failures
            .iter()
            .map(|f| f.item_identifier.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeContent {
    Object(SourceLocation),
    /// Control messages such as a storage-notification test event.
    Ignorable(String),
}

const MAX_NESTING: usize = 3;

/// Resolve a message body to the storage pointer it carries.
pub fn parse_envelope(body: &str) -> Result<EnvelopeContent, ProcessingError> {
    let value: JsonValue = serde_json::from_str(body)
        .map_err(|e| ProcessingError::permanent(Stage::Envelope, format!("message body is not JSON: {e}")))?;
    resolve(&value, 0)
}

fn resolve(value: &JsonValue, depth: usize) -> Result<EnvelopeContent, ProcessingError> {
    if depth > MAX_NESTING {
        return Err(invalid("envelope nested too deeply"));
    }
    if !value.is_object() {
        return Err(invalid("message body is not a JSON object"));
    }
    if let Some(event) = value.get("Event").and_then(JsonValue::as_str) {
        if event.ends_with("TestEvent") {
            return Ok(EnvelopeContent::Ignorable(event.to_string()));
        }
    }
    if let Some(message) = value.get("Message") {
        let inner = match message {
            JsonValue::String(raw) => serde_json::from_str::<JsonValue>(raw)
                .map_err(|e| invalid(&format!("wrapped Message is not JSON: {e}")))?,
            other => other.clone(),
        };
        return resolve(&inner, depth + 1);
    }
    if let Some(records) = value.get("Records").and_then(JsonValue::as_array) {
        return from_notification(records);
    }
    if let Some(detail) = value.get("detail").filter(|d| d.is_object()) {
        return resolve(detail, depth + 1);
    }
    let bucket = value.get("bucket").and_then(|b| {
        b.as_str()
            .or_else(|| b.get("name").and_then(JsonValue::as_str))
    });
    let key = value
        .get("key")
        .and_then(JsonValue::as_str)
        .or_else(|| value.pointer("/object/key").and_then(JsonValue::as_str));
    match (bucket, key) {
        (Some(bucket), Some(key)) => pointer(bucket, key),
        _ => Err(invalid("message body carries no bucket/key pointer")),
    }
}

fn from_notification(records: &[JsonValue]) -> Result<EnvelopeContent, ProcessingError> {
    let objects = records
        .iter()
        .filter_map(|r| r.get("s3"))
        .map(|s3| {
            let bucket = s3.pointer("/bucket/name").and_then(JsonValue::as_str);
            let key = s3.pointer("/object/key").and_then(JsonValue::as_str);
            match (bucket, key) {
                (Some(bucket), Some(key)) => pointer(bucket, &url_decode_key(key)),
                _ => Err(invalid("notification record missing bucket name or object key")),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mut objects = objects.into_iter();
    match (objects.next(), objects.next()) {
        (Some(only), None) => Ok(only),
        (None, _) => Err(invalid("notification carries no object records")),
        (Some(_), Some(_)) => Err(invalid(&format!(
            "notification carries {} object records; expected one per message",
            records.len()
        ))),
    }
}

fn pointer(bucket: &str, key: &str) -> Result<EnvelopeContent, ProcessingError> {
    let bucket = bucket.trim();
    let key = key.trim().trim_start_matches('/');
    if bucket.is_empty() || key.is_empty() {
        return Err(invalid("empty bucket or key"));
    }
    Ok(EnvelopeContent::Object(SourceLocation {
        bucket: bucket.to_string(),
        key: key.to_string(),
    }))
}

fn invalid(message: &str) -> ProcessingError {
    ProcessingError::permanent(Stage::Envelope, message)
}

/// Notification keys are form-encoded: `+` is a space and `%XX` a byte.
pub fn url_decode_key(key: &str) -> String {
    let bytes = key.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
