#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use oppmatch_core::{Assessment, Clock, ExtractedSummary, MatchResult};
use oppmatch_inference::mock::ScriptedModel;
use oppmatch_inference::{GenerativeModel, KnowledgeBase, Passage};
use oppmatch_pipeline::{BatchEvent, PipelineConfig, QueueMessage, QueueWorker, WorkerDeps};
use oppmatch_pipeline::envelope::MessageAttributes;
use oppmatch_storage::{MemoryObjectStore, ObjectStore};
use serde_json::json;

pub const INBOX: &str = "inbox";
pub const RESULTS: &str = "opportunity-results";

/// Clock tests can move forward between operations.
pub struct StepClock(Mutex<DateTime<Utc>>);

impl StepClock {
    pub fn at(t: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(t)))
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.0.lock().unwrap() = t;
    }
}

impl Clock for StepClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

pub fn ts(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, h, m, 0).single().unwrap()
}

pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 10;
    config.timeouts.extraction_secs = 1;
    config.timeouts.retrieval_secs = 1;
    config.timeouts.scoring_secs = 1;
    config.timeouts.fetch_secs = 1;
    config.timeouts.write_secs = 1;
    config
}

pub struct Harness {
    pub clock: Arc<StepClock>,
    pub store: Arc<MemoryObjectStore>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = StepClock::at(ts(12, 0));
        let store = Arc::new(MemoryObjectStore::new(clock.clone()));
        Self { clock, store }
    }

    pub async fn seed_opportunity(&self, id: &str) {
        let record = json!({
            "noticeId": format!("SOL-{id}"),
            "title": format!("Cloud migration support {id}"),
            "fullParentPathName": "DEPT OF DEFENSE.DEPT OF THE AIR FORCE",
            "naicsCode": "541512",
            "description": "Migrate legacy workloads to a government cloud region."
        });
        self.store
            .put(INBOX, &format!("notices/{id}.json"), record.to_string().as_bytes())
            .await
            .unwrap();
    }

    pub fn worker(
        &self,
        config: PipelineConfig,
        extraction: Arc<dyn GenerativeModel>,
        scoring: Arc<dyn GenerativeModel>,
        knowledge_base: Arc<dyn KnowledgeBase>,
    ) -> QueueWorker {
        QueueWorker::new(
            Arc::new(config),
            WorkerDeps {
                store: self.store.clone(),
                extraction_model: extraction,
                scoring_model: scoring,
                knowledge_base,
                clock: self.clock.clone(),
            },
        )
        .unwrap()
    }

    pub async fn result(&self, key: &str) -> MatchResult {
        let object = self.store.get(RESULTS, key).await.unwrap();
        serde_json::from_slice(&object.body).unwrap()
    }

    pub async fn keys_under(&self, prefix: &str) -> Vec<String> {
        self.store
            .keys(RESULTS)
            .await
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect()
    }

    /// Stage a valid scored result directly, with an explicit modification time.
    pub async fn stage_result(&self, id: &str, score: f64, modified: DateTime<Utc>) -> String {
        let result = MatchResult::scored(
            &format!("SOL-{id}"),
            id,
            modified,
            0.7,
            ExtractedSummary::default(),
            Assessment {
                match_score: score,
                rationale: "staged for reconciliation".into(),
                ..Default::default()
            },
        );
        let key = format!("raw/{}", result.result_key());
        let body = serde_json::to_vec(&result).unwrap();
        self.store.insert_at(RESULTS, &key, &body, modified).await;
        key
    }
}

pub fn extraction_model() -> Arc<ScriptedModel> {
    Arc::new(ScriptedModel::replying(
        r#"Here is the summary:
        {"title": "Cloud migration support", "requirements": "Migrate 40 workloads to GovCloud",
         "scope": "Design, migrate and operate", "technical_specs": "FedRAMP High",
         "required_skills": ["AWS GovCloud", "Terraform", "FedRAMP"]}"#,
    ))
}

pub fn capability_passages() -> Vec<Passage> {
    vec![
        Passage::new(
            "s3://capabilities/past-performance.pdf",
            "Migrated 60 mission workloads to AWS GovCloud for an Air Force program office.",
            Some(0.83),
        ),
        Passage::new(
            "s3://capabilities/certifications.pdf",
            "Team holds FedRAMP High authorization experience and Terraform certifications.",
            Some(0.79),
        ),
    ]
}

pub fn pointer_message(id: &str, opportunity: &str) -> QueueMessage {
    QueueMessage {
        message_id: id.to_string(),
        body: json!({"bucket": INBOX, "key": format!("notices/{opportunity}.json")}).to_string(),
        attributes: MessageAttributes::default(),
    }
}

pub fn batch(messages: Vec<QueueMessage>) -> BatchEvent {
    BatchEvent { records: messages }
}
