//! Process-wide configuration: defaults, then an optional YAML file, then
//! `OPPMATCH_*` environment overrides. Built once and shared read-only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use oppmatch_inference::{CallOptions, ExtractionLimits, KnowledgeBaseSettings, ModelBackend, ModelSettings};
use oppmatch_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CONFIG_PATH_ENV: &str = "OPPMATCH_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: String, value: String },
    #[error(
        "{batch_size} message(s) x (processing budget {budget_secs}s + error-record write {write_secs}s) \
         must be below the queue visibility timeout ({visibility_secs}s)"
    )]
    BudgetExceedsVisibility {
        batch_size: usize,
        budget_secs: u64,
        write_secs: u64,
        visibility_secs: u64,
    },
    #[error("{call} timeout ({timeout_secs}s) must be below the processing budget ({budget_secs}s)")]
    CallTimeoutExceedsBudget {
        call: &'static str,
        timeout_secs: u64,
        budget_secs: u64,
    },
    #[error("match threshold {0} must be in (0, 1]")]
    ThresholdOutOfRange(f64),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory of the filesystem object store.
    pub root: PathBuf,
    pub results_bucket: String,
    pub staging_prefix: String,
    pub archive_prefix: String,
    pub summaries_prefix: String,
    pub quarantine_prefix: String,
    pub state_prefix: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            results_bucket: "opportunity-results".to_string(),
            staging_prefix: "raw/".to_string(),
            archive_prefix: "archive/".to_string(),
            summaries_prefix: "summaries/".to_string(),
            quarantine_prefix: "quarantine/".to_string(),
            state_prefix: "reconciler/".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub visibility_timeout_secs: u64,
    pub max_receive_count: u32,
    pub batch_size: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 5_400,
            max_receive_count: 3,
            batch_size: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub processing_budget_secs: u64,
    pub extraction_secs: u64,
    pub retrieval_secs: u64,
    pub scoring_secs: u64,
    /// Raw opportunity and attachment reads.
    pub fetch_secs: u64,
    pub write_secs: u64,
    pub visibility_safety_factor: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            processing_budget_secs: 900,
            extraction_secs: 120,
            retrieval_secs: 30,
            scoring_secs: 120,
            fetch_secs: 30,
            write_secs: 15,
            visibility_safety_factor: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
        }
    }
}

impl RetrySettings {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerSettings {
    pub scheduler_enabled: bool,
    /// Six-field cron expression (seconds first).
    pub cron: String,
    /// Window length used when no previous window end is recorded.
    pub interval_secs: u64,
    pub lease_ttl_secs: u64,
    pub export_parquet: bool,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            scheduler_enabled: false,
            cron: "0 */15 * * * *".to_string(),
            interval_secs: 900,
            lease_ttl_secs: 600,
            export_parquet: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub match_threshold: f64,
    pub storage: StorageSettings,
    pub queue: QueueSettings,
    pub timeouts: TimeoutSettings,
    pub retry: RetrySettings,
    pub limits: ExtractionLimits,
    pub extraction_model: ModelSettings,
    /// Falls back to the extraction model when unset.
    pub scoring_model: Option<ModelSettings>,
    pub knowledge_base: KnowledgeBaseSettings,
    pub reconciler: ReconcilerSettings,
}

fn default_model() -> ModelSettings {
    ModelSettings {
        backend: ModelBackend::AnthropicMessages,
        endpoint: "http://localhost:8080".to_string(),
        model_id: "anthropic.claude-3-haiku-20240307-v1:0".to_string(),
        max_tokens: 2_048,
        temperature: 0.0,
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.7,
            storage: StorageSettings::default(),
            queue: QueueSettings::default(),
            timeouts: TimeoutSettings::default(),
            retry: RetrySettings::default(),
            limits: ExtractionLimits::default(),
            extraction_model: default_model(),
            scoring_model: None,
            knowledge_base: KnowledgeBaseSettings::default(),
            reconciler: ReconcilerSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults, then `path` (or `$OPPMATCH_CONFIG`), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env_path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env_path) {
            Some(path) => Self::from_yaml_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    /// Apply `OPPMATCH_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OPPMATCH_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Some(v) = get("OPPMATCH_RESULTS_BUCKET") {
            self.storage.results_bucket = v;
        }
        if let Some(v) = get("OPPMATCH_MATCH_THRESHOLD") {
            self.match_threshold = parse_var("OPPMATCH_MATCH_THRESHOLD", &v)?;
        }
        if let Some(v) = get("OPPMATCH_VISIBILITY_TIMEOUT_SECS") {
            self.queue.visibility_timeout_secs = parse_var("OPPMATCH_VISIBILITY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("OPPMATCH_BATCH_SIZE") {
            self.queue.batch_size = parse_var("OPPMATCH_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("OPPMATCH_MAX_RECEIVE_COUNT") {
            self.queue.max_receive_count = parse_var("OPPMATCH_MAX_RECEIVE_COUNT", &v)?;
        }
        if let Some(v) = get("OPPMATCH_PROCESSING_BUDGET_SECS") {
            self.timeouts.processing_budget_secs = parse_var("OPPMATCH_PROCESSING_BUDGET_SECS", &v)?;
        }
        if let Some(v) = get("OPPMATCH_MAX_RETRIES") {
            self.retry.max_retries = parse_var("OPPMATCH_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("OPPMATCH_MODEL_BACKEND") {
            let backend = ModelBackend::parse(&v).ok_or_else(|| ConfigError::InvalidValue {
                var: "OPPMATCH_MODEL_BACKEND".to_string(),
                value: v.clone(),
            })?;
            self.extraction_model.backend = backend;
            if let Some(scoring) = self.scoring_model.as_mut() {
                scoring.backend = backend;
            }
        }
        if let Some(v) = get("OPPMATCH_MODEL_ENDPOINT") {
            self.extraction_model.endpoint = v.clone();
            if let Some(scoring) = self.scoring_model.as_mut() {
                scoring.endpoint = v;
            }
        }
        if let Some(v) = get("OPPMATCH_EXTRACTION_MODEL_ID") {
            self.extraction_model.model_id = v;
        }
        if let Some(v) = get("OPPMATCH_SCORING_MODEL_ID") {
            let mut scoring = self.scoring_model();
            scoring.model_id = v;
            self.scoring_model = Some(scoring);
        }
        if let Some(v) = lookup("OPPMATCH_KNOWLEDGE_BASE_ID") {
            // An explicitly empty id disables retrieval.
            self.knowledge_base.knowledge_base_id = v.trim().to_string();
        }
        if let Some(v) = get("OPPMATCH_KNOWLEDGE_BASE_ENDPOINT") {
            self.knowledge_base.endpoint = v;
        }
        if let Some(v) = get("OPPMATCH_SCHEDULER_ENABLED") {
            self.reconciler.scheduler_enabled = matches!(v.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(v) = get("OPPMATCH_RECONCILE_CRON") {
            self.reconciler.cron = v;
        }
        Ok(())
    }

    /// Structural checks run before any work is accepted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold > 0.0 && self.match_threshold <= 1.0) {
            return Err(ConfigError::ThresholdOutOfRange(self.match_threshold));
        }
        if self.queue.max_receive_count < 1 {
            return Err(ConfigError::Invalid("queue.max_receive_count must be at least 1".into()));
        }
        if self.queue.batch_size < 1 {
            return Err(ConfigError::Invalid("queue.batch_size must be at least 1".into()));
        }
        let t = &self.timeouts;
        if t.processing_budget_secs == 0 {
            return Err(ConfigError::Invalid("timeouts.processing_budget_secs must be positive".into()));
        }
        // Messages in one batch are handled in turn, and all of their visibility
        // timers start when the batch is received.
        let batch_secs = t
            .processing_budget_secs
            .checked_add(t.write_secs)
            .and_then(|per_message| per_message.checked_mul(self.queue.batch_size as u64));
        if !batch_secs.is_some_and(|total| total < self.queue.visibility_timeout_secs) {
            return Err(ConfigError::BudgetExceedsVisibility {
                batch_size: self.queue.batch_size,
                budget_secs: t.processing_budget_secs,
                write_secs: t.write_secs,
                visibility_secs: self.queue.visibility_timeout_secs,
            });
        }
        for (call, timeout_secs) in [
            ("extraction", t.extraction_secs),
            ("retrieval", t.retrieval_secs),
            ("scoring", t.scoring_secs),
            ("fetch", t.fetch_secs),
            ("write", t.write_secs),
        ] {
            if timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!("{call} timeout must be positive")));
            }
            if timeout_secs >= t.processing_budget_secs {
                return Err(ConfigError::CallTimeoutExceedsBudget {
                    call,
                    timeout_secs,
                    budget_secs: t.processing_budget_secs,
                });
            }
        }
        if self.storage.results_bucket.trim().is_empty() {
            return Err(ConfigError::Invalid("storage.results_bucket must be set".into()));
        }
        let prefixes = [
            &self.storage.staging_prefix,
            &self.storage.archive_prefix,
            &self.storage.summaries_prefix,
            &self.storage.quarantine_prefix,
            &self.storage.state_prefix,
        ];
        for (i, prefix) in prefixes.iter().enumerate() {
            if prefix.is_empty() || !prefix.ends_with('/') {
                return Err(ConfigError::Invalid(format!("storage prefix {prefix:?} must end with '/'")));
            }
            if prefixes[i + 1..].iter().any(|other| other.starts_with(prefix.as_str()) || prefix.starts_with(other.as_str())) {
                return Err(ConfigError::Invalid(format!("storage prefix {prefix:?} overlaps another prefix")));
            }
        }
        if self.reconciler.interval_secs == 0 || self.reconciler.lease_ttl_secs == 0 {
            return Err(ConfigError::Invalid("reconciler interval and lease ttl must be positive".into()));
        }
        self.lease_ttl()?;
        self.reconcile_interval()?;
        if self.knowledge_base.is_enabled() && self.knowledge_base.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "knowledge_base.endpoint is required when knowledge_base_id is set".into(),
            ));
        }

        let recommended = t.processing_budget_secs.saturating_mul(t.visibility_safety_factor);
        if self.queue.visibility_timeout_secs < recommended {
            warn!(
                visibility_secs = self.queue.visibility_timeout_secs,
                budget_secs = t.processing_budget_secs,
                recommended_secs = recommended,
                "visibility timeout below the recommended multiple of the processing budget"
            );
        }
        let worst_case = self.extraction_call().worst_case()
            + self.retrieval_call().worst_case()
            + self.scoring_call().worst_case();
        if worst_case > self.processing_budget() {
            warn!(
                worst_case_secs = worst_case.as_secs(),
                budget_secs = t.processing_budget_secs,
                "retry worst case exceeds the processing budget; the budget will cut slow messages short"
            );
        }
        Ok(())
    }

    pub fn scoring_model(&self) -> ModelSettings {
        self.scoring_model.clone().unwrap_or_else(|| self.extraction_model.clone())
    }

    pub fn processing_budget(&self) -> Duration {
        Duration::from_secs(self.timeouts.processing_budget_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.write_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.fetch_secs)
    }

    pub fn lease_ttl(&self) -> Result<TimeDelta, ConfigError> {
        seconds_delta("reconciler.lease_ttl_secs", self.reconciler.lease_ttl_secs)
    }

    /// Window length used when no previous window end is recorded.
    pub fn reconcile_interval(&self) -> Result<TimeDelta, ConfigError> {
        seconds_delta("reconciler.interval_secs", self.reconciler.interval_secs)
    }

    pub fn extraction_call(&self) -> CallOptions {
        self.call(self.timeouts.extraction_secs)
    }

    pub fn retrieval_call(&self) -> CallOptions {
        self.call(self.timeouts.retrieval_secs)
    }

    pub fn scoring_call(&self) -> CallOptions {
        self.call(self.timeouts.scoring_secs)
    }

    fn call(&self, timeout_secs: u64) -> CallOptions {
        CallOptions {
            backoff: self.retry.backoff(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

fn seconds_delta(var: &str, secs: u64) -> Result<TimeDelta, ConfigError> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| ConfigError::InvalidValue {
            var: var.to_string(),
            value: secs.to_string(),
        })
}

fn parse_var<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_validate() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn budget_at_or_above_visibility_refuses_to_start() {
        let mut config = PipelineConfig::default();
        config.queue.visibility_timeout_secs = 900;
        config.timeouts.processing_budget_secs = 900;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BudgetExceedsVisibility { .. })
        ));

        config.timeouts.processing_budget_secs = 1_200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn batch_of_sequential_messages_must_fit_in_visibility() {
        let mut config = PipelineConfig::default();
        config.queue.batch_size = 5;
        // 5 x (900 + 15) = 4575 < 5400
        config.validate().unwrap();

        config.queue.batch_size = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BudgetExceedsVisibility { batch_size: 10, .. })
        ));
    }

    #[test]
    fn oversized_values_are_errors_not_overflows() {
        let mut config = PipelineConfig::default();
        config.timeouts.processing_budget_secs = u64::MAX;
        config.queue.visibility_timeout_secs = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BudgetExceedsVisibility { .. })
        ));

        let mut config = PipelineConfig::default();
        config.reconciler.lease_ttl_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));

        let mut config = PipelineConfig::default();
        config.reconciler.interval_secs = i64::MAX as u64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn per_call_timeouts_must_fit_in_budget() {
        let mut config = PipelineConfig::default();
        config.timeouts.scoring_secs = config.timeouts.processing_budget_secs;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CallTimeoutExceedsBudget { call: "scoring", .. })
        ));
    }

    #[test]
    fn threshold_must_leave_room_below_it() {
        let mut config = PipelineConfig::default();
        config.match_threshold = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::ThresholdOutOfRange(_))));
        config.match_threshold = 1.5;
        assert!(config.validate().is_err());
        config.match_threshold = 1.0;
        config.validate().unwrap();
    }

    #[test]
    fn overlapping_prefixes_are_rejected() {
        let mut config = PipelineConfig::default();
        config.storage.archive_prefix = "raw/archive/".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let config = PipelineConfig::from_yaml_str(
            "match_threshold: 0.65\nqueue:\n  visibility_timeout_secs: 7200\nknowledge_base:\n  knowledge_base_id: KB123\n  endpoint: https://kb.example\n",
        )
        .unwrap();
        assert_eq!(config.match_threshold, 0.65);
        assert_eq!(config.queue.visibility_timeout_secs, 7_200);
        assert_eq!(config.queue.max_receive_count, 3);
        assert_eq!(config.timeouts.processing_budget_secs, 900);
        assert!(config.knowledge_base.is_enabled());
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_win() {
        let mut config = PipelineConfig::default();
        config
            .apply_overrides(env(&[
                ("OPPMATCH_MATCH_THRESHOLD", "0.8"),
                ("OPPMATCH_MODEL_BACKEND", "llama"),
                ("OPPMATCH_SCORING_MODEL_ID", "meta.llama3-70b"),
                ("OPPMATCH_KNOWLEDGE_BASE_ID", ""),
            ]))
            .unwrap();
        assert_eq!(config.match_threshold, 0.8);
        assert_eq!(config.extraction_model.backend, ModelBackend::Llama);
        assert_eq!(config.scoring_model().model_id, "meta.llama3-70b");
        assert_eq!(config.scoring_model().backend, ModelBackend::Llama);
        assert!(!config.knowledge_base.is_enabled());
    }

    #[test]
    fn bad_env_values_are_reported_by_name() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_overrides(env(&[("OPPMATCH_MATCH_THRESHOLD", "high")]))
            .unwrap_err();
        assert!(err.to_string().contains("OPPMATCH_MATCH_THRESHOLD"));
        let err = config
            .apply_overrides(env(&[("OPPMATCH_MODEL_BACKEND", "gpt")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
