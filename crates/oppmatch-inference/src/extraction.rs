//! Extraction stage: raw opportunity + attachments in, [`ExtractedSummary`] out.

use std::sync::Arc;
use std::time::Duration;

use oppmatch_core::{
    truncate_chars, ExtractedSummary, OpportunityReference, ProcessingError, Stage, TextLimits,
};
use oppmatch_storage::{ObjectStore, StorageError};
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backend::{GenerativeModel, InferenceError, Prompt};
use crate::parse::{extract_json_object, list_field, text_field, ParseError};
use crate::{into_processing_error, CallOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionLimits {
    pub max_document_chars: usize,
    pub max_attachments: usize,
    pub max_attachment_chars: usize,
    pub attachment_concurrency: usize,
    pub summary: TextLimits,
}

impl Default for ExtractionLimits {
    fn default() -> Self {
        Self {
            max_document_chars: 20_000,
            max_attachments: 5,
            max_attachment_chars: 10_000,
            attachment_concurrency: 4,
            summary: TextLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentText {
    pub name: String,
    pub text: String,
}

/// A raw opportunity record as read from the document store.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOpportunity {
    pub reference: OpportunityReference,
    pub record: JsonValue,
    pub document_text: String,
    pub attachment_keys: Vec<String>,
}

const SOLICITATION_ID_FIELDS: &[&str] = &[
    "solicitationNumber",
    "solicitation_number",
    "noticeId",
    "notice_id",
];

impl RawOpportunity {
    /// Parse the raw object. Anything but a JSON object is a permanent failure.
    pub fn from_json_bytes(reference: OpportunityReference, bytes: &[u8]) -> Result<Self, ProcessingError> {
        let record: JsonValue = serde_json::from_slice(bytes).map_err(|e| {
            ProcessingError::permanent(
                Stage::Fetch,
                format!("{} is not valid JSON: {e}", reference.source_location.key),
            )
        })?;
        if !record.is_object() {
            return Err(ProcessingError::permanent(
                Stage::Fetch,
                format!("{} is not a JSON object", reference.source_location.key),
            ));
        }
        let attachment_keys = attachment_keys(&record);
        let document_text = serde_json::to_string_pretty(&record).unwrap_or_default();
        Ok(Self {
            reference,
            record,
            document_text,
            attachment_keys,
        })
    }

    /// Solicitation number from the record, falling back to the opportunity id.
    pub fn solicitation_id(&self) -> String {
        SOLICITATION_ID_FIELDS
            .iter()
            .map(|field| text_field(&self.record, field))
            .find(|value| !value.is_empty())
            .unwrap_or_else(|| self.reference.opportunity_id.clone())
    }

    /// Metadata the source record already states, preferred over model output.
    fn metadata_summary(&self) -> ExtractedSummary {
        let first = |fields: &[&str]| {
            fields
                .iter()
                .map(|f| text_field(&self.record, f))
                .find(|v| !v.is_empty())
                .unwrap_or_default()
        };
        ExtractedSummary {
            title: first(&["title"]),
            agency: first(&["fullParentPathName", "department", "agency"]),
            notice_type: first(&["type", "noticeType", "notice_type"]),
            naics_code: first(&["naicsCode", "naics_code", "naics"]),
            set_aside: first(&["typeOfSetAsideDescription", "typeOfSetAside", "set_aside"]),
            response_deadline: first(&["responseDeadLine", "response_deadline"]),
            ..Default::default()
        }
    }
}

fn attachment_keys(record: &JsonValue) -> Vec<String> {
    let Some(items) = record.get("attachments").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            JsonValue::String(key) => Some(key.clone()),
            JsonValue::Object(_) => ["key", "s3_key", "object_key"]
                .iter()
                .find_map(|f| item.get(*f).and_then(JsonValue::as_str))
                .map(str::to_string),
            _ => None,
        })
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .collect()
}

/// Reduce an attachment body to plain text. Markup is stripped; binary bodies yield `None`.
pub fn attachment_to_text(key: &str, bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8(bytes.to_vec()).ok()?;
    let lower = key.to_ascii_lowercase();
    let text = if lower.ends_with(".html") || lower.ends_with(".htm") {
        let document = Html::parse_document(&text);
        document
            .root_element()
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        text
    };
    let text = text.trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Fetch up to `max_attachments` attachments concurrently through a bounded pool.
///
/// Missing or binary attachments are skipped; transient storage failures and
/// reads slower than `read_timeout` fail the stage.
pub async fn fetch_attachments(
    store: Arc<dyn ObjectStore>,
    bucket: &str,
    keys: &[String],
    limits: &ExtractionLimits,
    read_timeout: Duration,
) -> Result<Vec<AttachmentText>, ProcessingError> {
    if keys.len() > limits.max_attachments {
        info!(
            total = keys.len(),
            kept = limits.max_attachments,
            "attachment count over limit; extra attachments ignored"
        );
    }
    let permits = Arc::new(Semaphore::new(limits.attachment_concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for (index, key) in keys.iter().take(limits.max_attachments).cloned().enumerate() {
        let store = Arc::clone(&store);
        let permits = Arc::clone(&permits);
        let bucket = bucket.to_string();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            let result = tokio::time::timeout(read_timeout, store.get(&bucket, &key)).await;
            (index, key, result)
        });
    }

    let mut fetched = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (index, key, result) = joined.map_err(|e| {
            ProcessingError::transient(Stage::Fetch, format!("attachment task failed: {e}"))
        })?;
        let Ok(result) = result else {
            return Err(ProcessingError::transient(
                Stage::Fetch,
                format!("reading attachment {key} timed out after {}s", read_timeout.as_secs_f64()),
            ));
        };
        match result {
            Ok(object) => match attachment_to_text(&key, &object.body) {
                Some(text) => fetched.push((
                    index,
                    AttachmentText {
                        name: key,
                        text: truncate_chars(&text, limits.max_attachment_chars),
                    },
                )),
                None => warn!(attachment = %key, "attachment has no extractable text; skipped"),
            },
            Err(StorageError::NotFound { .. }) => {
                warn!(attachment = %key, "attachment listed but not found; skipped")
            }
            Err(err) if err.is_transient() => {
                return Err(ProcessingError::transient(
                    Stage::Fetch,
                    format!("reading attachment {key}: {err}"),
                ))
            }
            Err(err) => warn!(attachment = %key, error = %err, "attachment unreadable; skipped"),
        }
    }
    fetched.sort_by_key(|(index, _)| *index);
    Ok(fetched.into_iter().map(|(_, a)| a).collect())
}

const EXTRACTION_SYSTEM: &str = "You summarise government contracting opportunities for a capture team. \
Respond with a single JSON object and nothing else.";

pub fn build_extraction_prompt(
    raw: &RawOpportunity,
    attachments: &[AttachmentText],
    limits: &ExtractionLimits,
) -> Prompt {
    let mut user = String::from(
        "Extract the following fields from the opportunity below and return them as JSON:\n\
         {\"title\": str, \"agency\": str, \"notice_type\": str, \"naics_code\": str, \
         \"set_aside\": str, \"response_deadline\": str, \"requirements\": str, \"scope\": str, \
         \"technical_specs\": str, \"required_skills\": [str]}\n\
         Use an empty string or empty list when the document does not say.\n\n\
         ## Opportunity\n",
    );
    user.push_str(&truncate_chars(&raw.document_text, limits.max_document_chars));
    for (i, attachment) in attachments.iter().take(limits.max_attachments).enumerate() {
        user.push_str(&format!("\n\n## Attachment {}: {}\n", i + 1, attachment.name));
        user.push_str(&truncate_chars(&attachment.text, limits.max_attachment_chars));
    }
    Prompt {
        system: EXTRACTION_SYSTEM.to_string(),
        user,
    }
}

pub fn parse_extraction(output: &str) -> Result<ExtractedSummary, ParseError> {
    let value = extract_json_object(output)?;
    Ok(ExtractedSummary {
        title: text_field(&value, "title"),
        agency: text_field(&value, "agency"),
        notice_type: text_field(&value, "notice_type"),
        naics_code: text_field(&value, "naics_code"),
        set_aside: text_field(&value, "set_aside"),
        response_deadline: text_field(&value, "response_deadline"),
        requirements: text_field(&value, "requirements"),
        scope: text_field(&value, "scope"),
        technical_specs: text_field(&value, "technical_specs"),
        required_skills: list_field(&value, "required_skills"),
    })
}

fn merge_metadata(extracted: ExtractedSummary, metadata: ExtractedSummary) -> ExtractedSummary {
    let pick = |meta: String, model: String| if meta.is_empty() { model } else { meta };
    ExtractedSummary {
        title: pick(metadata.title, extracted.title),
        agency: pick(metadata.agency, extracted.agency),
        notice_type: pick(metadata.notice_type, extracted.notice_type),
        naics_code: pick(metadata.naics_code, extracted.naics_code),
        set_aside: pick(metadata.set_aside, extracted.set_aside),
        response_deadline: pick(metadata.response_deadline, extracted.response_deadline),
        ..extracted
    }
}

/// Run the extraction model with in-invocation retries and return a truncated summary.
pub async fn extract_summary(
    model: &dyn GenerativeModel,
    raw: &RawOpportunity,
    attachments: &[AttachmentText],
    limits: &ExtractionLimits,
    options: &CallOptions,
) -> Result<ExtractedSummary, ProcessingError> {
    let prompt = build_extraction_prompt(raw, attachments, limits);
    debug!(
        prompt_chars = prompt.user.chars().count(),
        attachments = attachments.len(),
        "extraction prompt built"
    );
    let extracted = oppmatch_storage::retry_with_backoff(&options.backoff, options.timeout, |attempt| {
        let prompt = &prompt;
        async move {
            if attempt > 0 {
                debug!(attempt, "retrying extraction");
            }
            let text = model.generate(prompt).await?;
            parse_extraction(&text).map_err(|e| InferenceError::UnusableOutput(e.to_string()))
        }
    })
    .await
    .map_err(|e| into_processing_error(Stage::Extraction, e))?;

    Ok(merge_metadata(extracted, raw.metadata_summary()).truncated(&limits.summary))
}
