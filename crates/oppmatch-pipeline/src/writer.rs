//! Categorize and persist [`MatchResult`]s under deterministic date-partitioned keys.

use std::sync::Arc;
use std::time::Duration;

use oppmatch_core::{
    result_key, Assessment, Category, Clock, ExtractedSummary, MatchResult, OpportunityReference,
    ProcessingError, Stage,
};
use oppmatch_storage::{ObjectStore, StorageError};
use tracing::{debug, info};

/// Builds results with the configured threshold and the injected clock.
pub struct Categorizer {
    threshold: f64,
    clock: Arc<dyn Clock>,
}

impl Categorizer {
    pub fn new(threshold: f64, clock: Arc<dyn Clock>) -> Self {
        Self { threshold, clock }
    }

    pub fn scored(
        &self,
        reference: &OpportunityReference,
        solicitation_id: &str,
        summary: ExtractedSummary,
        assessment: Assessment,
    ) -> MatchResult {
        MatchResult::scored(
            solicitation_id,
            &reference.opportunity_id,
            self.clock.now(),
            self.threshold,
            summary,
            assessment,
        )
    }

    pub fn failed(
        &self,
        reference: &OpportunityReference,
        solicitation_id: &str,
        summary: Option<ExtractedSummary>,
        error: &ProcessingError,
    ) -> MatchResult {
        MatchResult::failed(
            solicitation_id,
            &reference.opportunity_id,
            self.clock.now(),
            self.threshold,
            summary,
            error,
        )
    }
}

pub struct ResultWriter {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    staging_prefix: String,
    timeout: Duration,
}

impl ResultWriter {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: &str, staging_prefix: &str, timeout: Duration) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            staging_prefix: staging_prefix.to_string(),
            timeout,
        }
    }

    pub fn key_for(&self, result: &MatchResult) -> String {
        format!("{}{}", self.staging_prefix, result.result_key())
    }

    /// Validate, serialize and put. Same opportunity, same day, same category
    /// lands on the same key and overwrites. A scored result also removes that
    /// day's records for the opportunity in the other categories, so one
    /// opportunity has one outcome per day.
    pub async fn write(&self, result: &MatchResult) -> Result<String, ProcessingError> {
        result
            .validate()
            .map_err(|e| ProcessingError::permanent(Stage::Write, format!("refusing to write invalid result: {e}")))?;
        let key = self.key_for(result);
        let body = serde_json::to_vec_pretty(result)
            .map_err(|e| ProcessingError::permanent(Stage::Write, format!("serializing result: {e}")))?;

        match tokio::time::timeout(self.timeout, self.store.put(&self.bucket, &key, &body)).await {
            Ok(Ok(meta)) => {
                debug!(bucket = %self.bucket, %key, bytes = meta.size, "result written");
                info!(
                    opportunity_id = %result.opportunity_id,
                    category = %result.category,
                    score = result.match_score,
                    %key,
                    "match result persisted"
                );
            }
            Ok(Err(err)) => return Err(self.storage_error(&key, err)),
            Err(_) => return Err(self.timed_out(&key)),
        }

        if result.category != Category::Errors {
            self.remove_superseded(result).await?;
        }
        Ok(key)
    }

    async fn remove_superseded(&self, result: &MatchResult) -> Result<(), ProcessingError> {
        let date = result.processed_timestamp.date_naive();
        let stale = Category::ALL
            .into_iter()
            .filter(|category| *category != result.category)
            .map(|category| format!("{}{}", self.staging_prefix, result_key(date, category, &result.opportunity_id)));
        for key in stale {
            match tokio::time::timeout(self.timeout, self.store.delete(&self.bucket, &key)).await {
                Ok(Ok(())) => debug!(bucket = %self.bucket, %key, "superseded result cleared"),
                Ok(Err(err)) => return Err(self.storage_error(&key, err)),
                Err(_) => return Err(self.timed_out(&key)),
            }
        }
        Ok(())
    }

    fn storage_error(&self, key: &str, err: StorageError) -> ProcessingError {
        let message = format!("writing {key}: {err}");
        if err.is_transient() {
            ProcessingError::transient(Stage::Write, message)
        } else {
            ProcessingError::permanent(Stage::Write, message)
        }
    }

    fn timed_out(&self, key: &str) -> ProcessingError {
        ProcessingError::transient(
            Stage::Write,
            format!("writing {key} timed out after {}s", self.timeout.as_secs_f64()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use oppmatch_core::{Category, FixedClock};
    use oppmatch_storage::MemoryObjectStore;

    fn reference() -> OpportunityReference {
        OpportunityReference::from_location("inbox", "notices/W912-26-Q-0042.json").unwrap()
    }

    fn assessment(score: f64) -> Assessment {
        Assessment {
            match_score: score,
            rationale: "relevant past performance".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn same_day_reprocessing_overwrites_one_key() {
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).single().unwrap()));
        let store = Arc::new(MemoryObjectStore::new(clock.clone()));
        let categorizer = Categorizer::new(0.7, clock);
        let writer = ResultWriter::new(store.clone(), "results", "raw/", Duration::from_secs(1));

        let first = categorizer.scored(&reference(), "W912-26-Q-0042", ExtractedSummary::default(), assessment(0.9));
        let second = categorizer.scored(&reference(), "W912-26-Q-0042", ExtractedSummary::default(), assessment(0.95));
        let k1 = writer.write(&first).await.unwrap();
        let k2 = writer.write(&second).await.unwrap();

        assert_eq!(k1, "raw/2026-05-04/matches/W912-26-Q-0042.json");
        assert_eq!(k1, k2);
        assert_eq!(store.keys("results").await, vec![k1.clone()]);
        let stored: MatchResult =
            serde_json::from_slice(&store.get("results", &k1).await.unwrap().body).unwrap();
        assert_eq!(stored.match_score, 0.95);
    }

    #[tokio::test]
    async fn scored_write_clears_other_categories_but_failures_do_not() {
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).single().unwrap()));
        let store = Arc::new(MemoryObjectStore::new(clock.clone()));
        let categorizer = Categorizer::new(0.7, clock);
        let writer = ResultWriter::new(store.clone(), "results", "raw/", Duration::from_secs(1));
        let id = "W912-26-Q-0042";

        writer
            .write(&categorizer.scored(&reference(), id, ExtractedSummary::default(), assessment(0.9)))
            .await
            .unwrap();
        let err = ProcessingError::transient(Stage::Scoring, "timed out");
        writer.write(&categorizer.failed(&reference(), id, None, &err)).await.unwrap();
        assert_eq!(store.keys("results").await.len(), 2);

        let key = writer
            .write(&categorizer.scored(&reference(), id, ExtractedSummary::default(), assessment(0.2)))
            .await
            .unwrap();
        assert_eq!(key, "raw/2026-05-04/no_matches/W912-26-Q-0042.json");
        assert_eq!(store.keys("results").await, vec![key]);
    }

    #[tokio::test]
    async fn failed_results_land_in_errors() {
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).single().unwrap()));
        let store = Arc::new(MemoryObjectStore::new(clock.clone()));
        let categorizer = Categorizer::new(0.7, clock);
        let writer = ResultWriter::new(store, "results", "raw/", Duration::from_secs(1));
        let err = ProcessingError::transient(Stage::Scoring, "timed out");

        let result = categorizer.failed(&reference(), "W912-26-Q-0042", None, &err);
        assert_eq!(result.category, Category::Errors);
        let key = writer.write(&result).await.unwrap();
        assert_eq!(key, "raw/2026-05-04/errors/W912-26-Q-0042.json");
    }

    #[tokio::test]
    async fn storage_faults_are_transient_write_failures() {
        let store = Arc::new(MemoryObjectStore::default());
        store.fail_writes_under(Some("raw/")).await;
        let categorizer = Categorizer::new(0.7, Arc::new(oppmatch_core::SystemClock));
        let writer = ResultWriter::new(store, "results", "raw/", Duration::from_secs(1));
        let result = categorizer.scored(&reference(), "W912", ExtractedSummary::default(), assessment(0.1));

        let err = writer.write(&result).await.unwrap_err();
        assert_eq!(err.stage, Stage::Write);
        assert!(err.is_transient());
    }
}
