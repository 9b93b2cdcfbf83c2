//! Inference collaborators and the extraction / retrieval / scoring stages.

use std::time::Duration;

use oppmatch_core::{ProcessingError, Stage};
use oppmatch_storage::{BackoffPolicy, RetryError};

pub mod backend;
pub mod extraction;
pub mod knowledge;
pub mod mock;
pub mod parse;
pub mod scoring;

pub use backend::{
    GenerationParams, GenerativeModel, HttpGenerativeModel, InferenceError, ModelBackend, ModelSettings,
    Prompt,
};
pub use extraction::{
    extract_summary, fetch_attachments, AttachmentText, ExtractionLimits, RawOpportunity,
};
pub use knowledge::{
    retrieve_evidence, DisabledKnowledgeBase, HttpKnowledgeBase, KnowledgeBase, KnowledgeBaseSettings,
    Passage, StaticKnowledgeBase,
};
pub use scoring::{no_evidence_assessment, score_opportunity, NO_EVIDENCE_RATIONALE};

pub const CRATE_NAME: &str = "oppmatch-inference";

/// Per-call retry budget: attempts are individually bounded by `timeout`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallOptions {
    pub backoff: BackoffPolicy,
    pub timeout: Duration,
}

impl CallOptions {
    pub fn worst_case(&self) -> Duration {
        self.backoff.worst_case(self.timeout)
    }
}

/// Fold a retry outcome into the pipeline's error taxonomy. Client-side HTTP
/// rejections are permanent; everything else may succeed on redelivery.
pub fn into_processing_error(stage: Stage, err: RetryError<InferenceError>) -> ProcessingError {
    match err {
        RetryError::TimedOut { attempts, timeout } => ProcessingError::transient(
            stage,
            format!("timed out on all {attempts} attempts ({}ms each)", timeout.as_millis()),
        ),
        RetryError::Exhausted { attempts, last } => {
            ProcessingError::transient(stage, format!("failed after {attempts} attempts: {last}"))
        }
        RetryError::Fatal { last, .. } => match &last {
            InferenceError::Http { status, .. } if (400..500).contains(status) && *status != 429 => {
                ProcessingError::permanent(stage, last.to_string())
            }
            _ => ProcessingError::transient(stage, last.to_string()),
        },
    }
}
