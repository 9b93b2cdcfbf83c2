//! Generative-model backends.
//!
//! Each supported model family is one [`ModelBackend`] variant owning its own
//! request encoding and response decoding. The variant is chosen once from
//! configuration; nothing downstream inspects model ids.

use std::time::Duration;

use async_trait::async_trait;
use oppmatch_storage::{RetryDisposition, Retryable};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("request timed out")]
    Timeout,
    #[error("throttled by backend (http {status})")]
    Throttled { status: u16 },
    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("unusable model output: {0}")]
    UnusableOutput(String),
}

impl Retryable for InferenceError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Timeout | Self::Throttled { .. } | Self::Connection(_) | Self::UnusableOutput(_) => {
                RetryDisposition::Retryable
            }
            Self::Http { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::MalformedResponse(_) => RetryDisposition::NonRetryable,
        }
    }
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> InferenceError {
    if err.is_timeout() {
        InferenceError::Timeout
    } else if err.is_decode() {
        InferenceError::MalformedResponse(err.to_string())
    } else {
        InferenceError::Connection(err.to_string())
    }
}

/// Send a JSON POST and decode a JSON body, mapping failures onto [`InferenceError`].
pub(crate) async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &JsonValue,
) -> Result<JsonValue, InferenceError> {
    let resp = client.post(url).json(body).send().await.map_err(map_reqwest_error)?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(InferenceError::Throttled {
                status: status.as_u16(),
            });
        }
        return Err(InferenceError::Http {
            status: status.as_u16(),
            body: text.chars().take(500).collect(),
        });
    }
    resp.json::<JsonValue>().await.map_err(map_reqwest_error)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelBackend {
    /// Messages API: `content[].text` blocks.
    AnthropicMessages,
    /// Instruction-wrapped prompt in, `generation` out.
    Llama,
    /// Local `/api/generate` endpoint.
    Ollama,
}

impl ModelBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "anthropic_messages" | "anthropic" => Some(Self::AnthropicMessages),
            "llama" => Some(Self::Llama),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    pub fn invoke_url(&self, endpoint: &str, model_id: &str) -> String {
        let base = endpoint.trim_end_matches('/');
        match self {
            Self::AnthropicMessages | Self::Llama => format!("{base}/model/{model_id}/invoke"),
            Self::Ollama => format!("{base}/api/generate"),
        }
    }

    pub fn encode_request(&self, model_id: &str, prompt: &Prompt, params: &GenerationParams) -> JsonValue {
        match self {
            Self::AnthropicMessages => json!({
                "anthropic_version": "bedrock-2023-05-31",
                "max_tokens": params.max_tokens,
                "temperature": params.temperature,
                "system": prompt.system,
                "messages": [
                    {"role": "user", "content": [{"type": "text", "text": prompt.user}]}
                ],
            }),
            Self::Llama => json!({
                "prompt": llama_instruction(prompt),
                "max_gen_len": params.max_tokens,
                "temperature": params.temperature,
            }),
            Self::Ollama => json!({
                "model": model_id,
                "prompt": prompt.user,
                "system": prompt.system,
                "stream": false,
                "options": {"temperature": params.temperature, "num_predict": params.max_tokens},
            }),
        }
    }

    pub fn decode_response(&self, body: &JsonValue) -> Result<String, InferenceError> {
        let text = match self {
            Self::AnthropicMessages => body
                .get("content")
                .and_then(JsonValue::as_array)
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(JsonValue::as_str).unwrap_or("text") == "text")
                        .filter_map(|b| b.get("text").and_then(JsonValue::as_str))
                        .collect::<Vec<_>>()
                        .join("")
                }),
            Self::Llama => body
                .get("generation")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            Self::Ollama => body
                .get("response")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
        };
        match text {
            Some(t) if !t.trim().is_empty() => Ok(t),
            Some(_) => Err(InferenceError::MalformedResponse("empty completion".into())),
            None => Err(InferenceError::MalformedResponse(format!(
                "{self:?} response missing completion text"
            ))),
        }
    }
}

fn llama_instruction(prompt: &Prompt) -> String {
    format!(
        "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n{}<|eot_id|>\
         <|start_header_id|>user<|end_header_id|>\n\n{}<|eot_id|>\
         <|start_header_id|>assistant<|end_header_id|>\n\n",
        prompt.system, prompt.user
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub backend: ModelBackend,
    pub endpoint: String,
    pub model_id: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    2_048
}

impl ModelSettings {
    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// The generative-inference collaborator: prompt in, text out.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn generate(&self, prompt: &Prompt) -> Result<String, InferenceError>;
}

#[derive(Debug)]
pub struct HttpGenerativeModel {
    client: reqwest::Client,
    settings: ModelSettings,
    url: String,
}

impl HttpGenerativeModel {
    pub fn new(settings: ModelSettings, request_timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| InferenceError::Connection(format!("building http client: {e}")))?;
        let url = settings.backend.invoke_url(&settings.endpoint, &settings.model_id);
        Ok(Self {
            client,
            settings,
            url,
        })
    }
}

#[async_trait]
impl GenerativeModel for HttpGenerativeModel {
    fn model_id(&self) -> &str {
        &self.settings.model_id
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, InferenceError> {
        let backend = self.settings.backend;
        let body = backend.encode_request(&self.settings.model_id, prompt, &self.settings.params());
        debug!(model_id = %self.settings.model_id, ?backend, "invoking model");
        let response = post_json(&self.client, &self.url, &body).await?;
        backend.decode_response(&response)
    }
}
