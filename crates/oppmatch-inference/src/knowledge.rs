//! Knowledge-base retrieval of company capability evidence.

use std::time::Duration;

use async_trait::async_trait;
use oppmatch_core::{truncate_chars, ExtractedSummary, ProcessingError, Stage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::backend::{post_json, InferenceError};
use crate::{into_processing_error, CallOptions};

/// Knowledge-base queries longer than this are rejected by typical retrieval APIs.
pub const MAX_QUERY_CHARS: usize = 1_000;

/// One retrieved passage with its source identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub document_name: String,
    pub text: String,
    pub source_uri: String,
    #[serde(default)]
    pub score: Option<f64>,
}

impl Passage {
    pub fn new(source_uri: &str, text: &str, score: Option<f64>) -> Self {
        Self {
            document_name: document_name_from_uri(source_uri),
            text: text.to_string(),
            source_uri: source_uri.to_string(),
            score,
        }
    }
}

pub fn document_name_from_uri(uri: &str) -> String {
    let name = uri
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    if name.is_empty() {
        "unknown-document".to_string()
    } else {
        name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBaseSettings {
    /// Empty id disables retrieval.
    #[serde(default)]
    pub knowledge_base_id: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub min_score: Option<f64>,
}

fn default_top_k() -> usize {
    5
}

impl Default for KnowledgeBaseSettings {
    fn default() -> Self {
        Self {
            knowledge_base_id: String::new(),
            endpoint: String::new(),
            top_k: default_top_k(),
            min_score: None,
        }
    }
}

impl KnowledgeBaseSettings {
    pub fn is_enabled(&self) -> bool {
        !self.knowledge_base_id.trim().is_empty()
    }
}

/// The knowledge-retrieval collaborator: query in, ranked passages out.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Passage>, InferenceError>;
}

/// Stand-in when no knowledge base is configured. Always yields no evidence.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledKnowledgeBase;

#[async_trait]
impl KnowledgeBase for DisabledKnowledgeBase {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn retrieve(&self, _query: &str, _top_k: usize) -> Result<Vec<Passage>, InferenceError> {
        Ok(Vec::new())
    }
}

/// Fixed passage set; used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticKnowledgeBase {
    passages: Vec<Passage>,
}

impl StaticKnowledgeBase {
    pub fn new(passages: Vec<Passage>) -> Self {
        Self { passages }
    }
}

#[async_trait]
impl KnowledgeBase for StaticKnowledgeBase {
    async fn retrieve(&self, _query: &str, top_k: usize) -> Result<Vec<Passage>, InferenceError> {
        Ok(self.passages.iter().take(top_k).cloned().collect())
    }
}

#[derive(Debug)]
pub struct HttpKnowledgeBase {
    client: reqwest::Client,
    url: String,
}

impl HttpKnowledgeBase {
    pub fn new(settings: &KnowledgeBaseSettings, request_timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| InferenceError::Connection(format!("building http client: {e}")))?;
        let url = format!(
            "{}/knowledgebases/{}/retrieve",
            settings.endpoint.trim_end_matches('/'),
            settings.knowledge_base_id.trim()
        );
        Ok(Self { client, url })
    }
}

#[derive(Debug, Deserialize)]
struct RetrieveResponse {
    #[serde(default, rename = "retrievalResults")]
    retrieval_results: Vec<RetrievalResult>,
}

#[derive(Debug, Deserialize)]
struct RetrievalResult {
    content: RetrievalContent,
    #[serde(default)]
    location: Option<JsonValue>,
    #[serde(default)]
    score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RetrievalContent {
    #[serde(default)]
    text: String,
}

fn location_uri(location: Option<&JsonValue>) -> String {
    let Some(location) = location else {
        return String::new();
    };
    for pointer in ["/s3Location/uri", "/webLocation/url", "/uri"] {
        if let Some(uri) = location.pointer(pointer).and_then(JsonValue::as_str) {
            return uri.to_string();
        }
    }
    String::new()
}

#[async_trait]
impl KnowledgeBase for HttpKnowledgeBase {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Passage>, InferenceError> {
        let body = json!({
            "retrievalQuery": {"text": query},
            "retrievalConfiguration": {
                "vectorSearchConfiguration": {"numberOfResults": top_k}
            },
        });
        let response = post_json(&self.client, &self.url, &body).await?;
        let parsed: RetrieveResponse = serde_json::from_value(response)
            .map_err(|e| InferenceError::MalformedResponse(e.to_string()))?;
        Ok(parsed
            .retrieval_results
            .into_iter()
            .map(|r| Passage::new(&location_uri(r.location.as_ref()), &r.content.text, r.score))
            .collect())
    }
}

/// Build the retrieval query from the summary's requirement-bearing fields.
pub fn build_query(summary: &ExtractedSummary) -> String {
    let mut parts = Vec::new();
    for field in [&summary.requirements, &summary.scope, &summary.technical_specs] {
        if !field.trim().is_empty() {
            parts.push(field.trim().to_string());
        }
    }
    if !summary.required_skills.is_empty() {
        parts.push(format!("Skills: {}", summary.required_skills.join(", ")));
    }
    if parts.is_empty() && !summary.title.trim().is_empty() {
        parts.push(summary.title.trim().to_string());
    }
    truncate_chars(&parts.join("\n"), MAX_QUERY_CHARS)
}

/// Retrieval stage. A disabled knowledge base or an empty query yields no
/// evidence rather than an error.
pub async fn retrieve_evidence(
    kb: &dyn KnowledgeBase,
    settings: &KnowledgeBaseSettings,
    summary: &ExtractedSummary,
    options: &CallOptions,
) -> Result<Vec<Passage>, ProcessingError> {
    if !kb.is_enabled() {
        info!("knowledge base not configured; continuing without capability evidence");
        return Ok(Vec::new());
    }
    let query = build_query(summary);
    if query.is_empty() {
        warn!("extracted summary has no requirement text to query with");
        return Ok(Vec::new());
    }

    let top_k = settings.top_k.max(1);
    let passages = oppmatch_storage::retry_with_backoff(&options.backoff, options.timeout, |_| {
        kb.retrieve(&query, top_k)
    })
    .await
    .map_err(|e| into_processing_error(Stage::Retrieval, e))?;

    let passages = passages
        .into_iter()
        .filter(|p| !p.text.trim().is_empty())
        .filter(|p| match (settings.min_score, p.score) {
            (Some(min), Some(score)) => score >= min,
            _ => true,
        })
        .take(top_k)
        .collect::<Vec<_>>();
    info!(passages = passages.len(), "retrieved capability evidence");
    Ok(passages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oppmatch_core::ErrorKind;
    use oppmatch_storage::BackoffPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyKb {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl KnowledgeBase for FlakyKb {
        async fn retrieve(&self, _query: &str, _top_k: usize) -> Result<Vec<Passage>, InferenceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(InferenceError::Throttled { status: 429 })
            } else {
                Ok(vec![Passage::new("s3://kb/past-performance.pdf", "Delivered cloud migration", Some(0.9))])
            }
        }
    }

    fn options() -> CallOptions {
        CallOptions {
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            timeout: Duration::from_secs(1),
        }
    }

    fn summary() -> ExtractedSummary {
        ExtractedSummary {
            title: "Cloud migration support".into(),
            requirements: "Migrate legacy workloads".into(),
            required_skills: vec!["AWS".into(), "Terraform".into()],
            ..Default::default()
        }
    }

    #[test]
    fn document_names_come_from_uri_tail() {
        assert_eq!(document_name_from_uri("s3://kb/docs/capabilities.pdf"), "capabilities.pdf");
        assert_eq!(document_name_from_uri(""), "unknown-document");
    }

    #[test]
    fn query_uses_requirements_then_falls_back_to_title() {
        let query = build_query(&summary());
        assert!(query.starts_with("Migrate legacy workloads"));
        assert!(query.contains("Skills: AWS, Terraform"));

        let title_only = ExtractedSummary {
            title: "Janitorial services".into(),
            ..Default::default()
        };
        assert_eq!(build_query(&title_only), "Janitorial services");
        assert!(build_query(&ExtractedSummary::default()).is_empty());
    }

    #[test]
    fn empty_id_means_disabled() {
        assert!(!KnowledgeBaseSettings::default().is_enabled());
        let settings = KnowledgeBaseSettings {
            knowledge_base_id: "  ".into(),
            ..Default::default()
        };
        assert!(!settings.is_enabled());
    }

    #[tokio::test]
    async fn disabled_knowledge_base_short_circuits() {
        let passages = retrieve_evidence(&DisabledKnowledgeBase, &KnowledgeBaseSettings::default(), &summary(), &options())
            .await
            .unwrap();
        assert!(passages.is_empty());
    }

    #[tokio::test]
    async fn throttled_retrieval_is_retried() {
        let kb = FlakyKb {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        };
        let passages = retrieve_evidence(&kb, &KnowledgeBaseSettings::default(), &summary(), &options())
            .await
            .unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].document_name, "past-performance.pdf");
        assert_eq!(kb.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retrieval_is_transient() {
        let kb = FlakyKb {
            calls: AtomicUsize::new(0),
            fail_first: 10,
        };
        let err = retrieve_evidence(&kb, &KnowledgeBaseSettings::default(), &summary(), &options())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
        assert_eq!(err.stage, Stage::Retrieval);
    }

    #[tokio::test]
    async fn low_scoring_and_empty_passages_are_dropped() {
        let kb = StaticKnowledgeBase::new(vec![
            Passage::new("s3://kb/a.pdf", "relevant", Some(0.8)),
            Passage::new("s3://kb/b.pdf", "weak", Some(0.1)),
            Passage::new("s3://kb/c.pdf", "  ", Some(0.9)),
        ]);
        let settings = KnowledgeBaseSettings {
            min_score: Some(0.5),
            ..Default::default()
        };
        let passages = retrieve_evidence(&kb, &settings, &summary(), &options()).await.unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].document_name, "a.pdf");
    }

    #[test]
    fn retrieve_response_locations_are_read() {
        let value = json!({"s3Location": {"uri": "s3://kb/x.docx"}});
        assert_eq!(location_uri(Some(&value)), "s3://kb/x.docx");
        assert_eq!(location_uri(None), "");
    }
}
