//! Core domain model, result-key scheme and validation for the opportunity-match pipeline.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppmatch-core";

const OPPORTUNITY_EXTENSIONS: &[&str] = &["json", "txt", "html", "htm"];

/// Pointer to a raw opportunity object in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub bucket: String,
    pub key: String,
}

/// One unit of work. Built once per message; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityReference {
    pub opportunity_id: String,
    pub source_location: SourceLocation,
}

impl OpportunityReference {
    pub fn from_location(bucket: &str, key: &str) -> Result<Self, ModelError> {
        let opportunity_id = derive_opportunity_id(key).ok_or_else(|| ModelError::EmptyOpportunityId {
            key: key.to_string(),
        })?;
        Ok(Self {
            opportunity_id,
            source_location: SourceLocation {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
        })
    }
}

/// Derive a stable opportunity id from a storage key.
///
/// Takes the final path segment, drops a known document extension and keeps only
/// `[A-Za-z0-9._-]`. The same key always yields the same id, so retries of one
/// message land on the same result key.
pub fn derive_opportunity_id(key: &str) -> Option<String> {
    let segment = key.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    let stem = match segment.rsplit_once('.') {
        Some((stem, ext)) if OPPORTUNITY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => stem,
        _ => segment,
    };
    let id = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    let id = id.trim_matches(|c| c == '_' || c == '.').to_string();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextLimits {
    pub field_chars: usize,
    pub list_item_chars: usize,
    pub max_list_items: usize,
}

impl Default for TextLimits {
    fn default() -> Self {
        Self {
            field_chars: 2_000,
            list_item_chars: 200,
            max_list_items: 25,
        }
    }
}

/// Normalized output of the extraction stage. Embedded on a [`MatchResult`] as
/// `opportunity_summary`; never written on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExtractedSummary {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub agency: String,
    #[serde(default)]
    pub notice_type: String,
    #[serde(default)]
    pub naics_code: String,
    #[serde(default)]
    pub set_aside: String,
    #[serde(default)]
    pub response_deadline: String,
    #[serde(default)]
    pub requirements: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub technical_specs: String,
    #[serde(default)]
    pub required_skills: Vec<String>,
}

impl ExtractedSummary {
    pub fn truncated(self, limits: &TextLimits) -> Self {
        let field = |s: String| truncate_chars(s.trim(), limits.field_chars);
        Self {
            title: field(self.title),
            agency: field(self.agency),
            notice_type: field(self.notice_type),
            naics_code: field(self.naics_code),
            set_aside: field(self.set_aside),
            response_deadline: field(self.response_deadline),
            requirements: field(self.requirements),
            scope: field(self.scope),
            technical_specs: field(self.technical_specs),
            required_skills: truncate_list(self.required_skills, limits),
        }
    }
}

pub fn truncate_list(items: Vec<String>, limits: &TextLimits) -> Vec<String> {
    items
        .into_iter()
        .map(|s| truncate_chars(s.trim(), limits.list_item_chars))
        .filter(|s| !s.is_empty())
        .take(limits.max_list_items)
        .collect()
}

/// Capability evidence attached to a result for auditability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceCitation {
    pub document_name: String,
    pub excerpt: String,
    pub source_uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Matches,
    NoMatches,
    Errors,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Matches, Category::NoMatches, Category::Errors];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matches => "matches",
            Self::NoMatches => "no_matches",
            Self::Errors => "errors",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clamp a model-reported score into `[0.0, 1.0]`; non-finite values become 0.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn categorize(match_score: f64, match_threshold: f64) -> Category {
    if match_score >= match_threshold {
        Category::Matches
    } else {
        Category::NoMatches
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, throttling, temporary storage faults. Redelivery may succeed.
    Transient,
    /// Malformed input or missing required fields.
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Envelope,
    Fetch,
    Extraction,
    Retrieval,
    Scoring,
    Write,
    Budget,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Envelope => "envelope",
            Self::Fetch => "fetch",
            Self::Extraction => "extraction",
            Self::Retrieval => "retrieval",
            Self::Scoring => "scoring",
            Self::Write => "write",
            Self::Budget => "budget",
        };
        f.write_str(s)
    }
}

/// Failure of one stage of one opportunity's pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} failure in {stage} stage: {message}")]
pub struct ProcessingError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
}

impl ProcessingError {
    pub fn transient(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            stage,
            message: message.into(),
        }
    }

    pub fn permanent(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            stage,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            kind: self.kind,
            stage: self.stage,
            message: self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
}

/// The durable per-opportunity output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub solicitation_id: String,
    pub opportunity_id: String,
    pub processed_timestamp: DateTime<Utc>,
    pub match_threshold: f64,
    pub is_match: bool,
    pub match_score: f64,
    pub rationale: String,
    #[serde(default)]
    pub citations: Vec<EvidenceCitation>,
    #[serde(default)]
    pub opportunity_required_skills: Vec<String>,
    #[serde(default)]
    pub company_skills: Vec<String>,
    #[serde(default)]
    pub opportunity_summary: ExtractedSummary,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// Score-stage output before categorization and timestamping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Assessment {
    pub match_score: f64,
    pub rationale: String,
    pub citations: Vec<EvidenceCitation>,
    pub opportunity_required_skills: Vec<String>,
    pub company_skills: Vec<String>,
}

impl MatchResult {
    /// Build a scored result; the category follows from score and threshold.
    pub fn scored(
        solicitation_id: &str,
        opportunity_id: &str,
        processed_timestamp: DateTime<Utc>,
        match_threshold: f64,
        summary: ExtractedSummary,
        assessment: Assessment,
    ) -> Self {
        let match_score = clamp_score(assessment.match_score);
        let category = categorize(match_score, match_threshold);
        Self {
            solicitation_id: solicitation_id.to_string(),
            opportunity_id: opportunity_id.to_string(),
            processed_timestamp,
            match_threshold,
            is_match: category == Category::Matches,
            match_score,
            rationale: assessment.rationale,
            citations: assessment.citations,
            opportunity_required_skills: assessment.opportunity_required_skills,
            company_skills: assessment.company_skills,
            opportunity_summary: summary,
            category,
            error: None,
        }
    }

    /// Build an `errors` result carrying whatever partial data was produced.
    pub fn failed(
        solicitation_id: &str,
        opportunity_id: &str,
        processed_timestamp: DateTime<Utc>,
        match_threshold: f64,
        summary: Option<ExtractedSummary>,
        error: &ProcessingError,
    ) -> Self {
        let summary = summary.unwrap_or_default();
        Self {
            solicitation_id: solicitation_id.to_string(),
            opportunity_id: opportunity_id.to_string(),
            processed_timestamp,
            match_threshold,
            is_match: false,
            match_score: 0.0,
            rationale: format!("processing failed in {} stage: {}", error.stage, error.message),
            citations: Vec::new(),
            opportunity_required_skills: summary.required_skills.clone(),
            company_skills: Vec::new(),
            opportunity_summary: summary,
            category: Category::Errors,
            error: Some(error.detail()),
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.solicitation_id.trim().is_empty() {
            return Err(ModelError::EmptySolicitationId);
        }
        if self.opportunity_id.trim().is_empty() {
            return Err(ModelError::EmptyOpportunityId {
                key: self.solicitation_id.clone(),
            });
        }
        if !(0.0..=1.0).contains(&self.match_threshold) {
            return Err(ModelError::ThresholdOutOfRange(self.match_threshold));
        }
        if !(0.0..=1.0).contains(&self.match_score) {
            return Err(ModelError::ScoreOutOfRange(self.match_score));
        }
        let expected = self.match_score >= self.match_threshold;
        if self.category != Category::Errors && self.is_match != expected {
            return Err(ModelError::MatchFlagMismatch {
                score: self.match_score,
                threshold: self.match_threshold,
                is_match: self.is_match,
            });
        }
        match (self.category, &self.error) {
            (Category::Errors, None) => Err(ModelError::MissingErrorDetail),
            (Category::Errors, Some(_)) if self.is_match => Err(ModelError::MatchFlagMismatch {
                score: self.match_score,
                threshold: self.match_threshold,
                is_match: self.is_match,
            }),
            (Category::Errors, Some(_)) => Ok(()),
            (category, _) if category != categorize(self.match_score, self.match_threshold) => {
                Err(ModelError::CategoryMismatch(category))
            }
            _ => Ok(()),
        }
    }

    /// Relative result key `{YYYY-MM-DD}/{category}/{opportunity_id}.json`.
    pub fn result_key(&self) -> String {
        result_key(self.processed_timestamp.date_naive(), self.category, &self.opportunity_id)
    }
}

/// Deterministic result key. Reprocessing on the same day overwrites.
pub fn result_key(date: NaiveDate, category: Category, opportunity_id: &str) -> String {
    format!("{}/{}/{}.json", date.format("%Y-%m-%d"), category.as_str(), opportunity_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub processed_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub current_window_count: usize,
    pub carryover_count: usize,
    pub stray_count: usize,
    pub records: Vec<MatchResult>,
}

impl RunSummary {
    pub fn category_counts(&self) -> [(Category, usize); 3] {
        Category::ALL.map(|c| (c, self.records.iter().filter(|r| r.category == c).count()))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("no opportunity id can be derived from key {key:?}")]
    EmptyOpportunityId { key: String },
    #[error("solicitation_id must be non-empty")]
    EmptySolicitationId,
    #[error("match_score {0} outside [0, 1]")]
    ScoreOutOfRange(f64),
    #[error("match_threshold {0} outside [0, 1]")]
    ThresholdOutOfRange(f64),
    #[error("is_match={is_match} disagrees with score {score} vs threshold {threshold}")]
    MatchFlagMismatch {
        score: f64,
        threshold: f64,
        is_match: bool,
    },
    #[error("category {0} disagrees with score and threshold")]
    CategoryMismatch(Category),
    #[error("errors-category result carries no error detail")]
    MissingErrorDetail,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant; used for reproducible keys and windows in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
