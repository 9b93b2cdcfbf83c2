//! Queue worker: one opportunity per message, partial batch failure reporting.

use std::sync::Arc;

use oppmatch_core::{
    Category, Clock, ErrorKind, ExtractedSummary, OpportunityReference, ProcessingError, Stage,
};
use oppmatch_inference::{
    extract_summary, fetch_attachments, retrieve_evidence, score_opportunity, GenerativeModel, KnowledgeBase,
    RawOpportunity,
};
use oppmatch_storage::{ObjectStore, StorageError};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{ConfigError, PipelineConfig};
use crate::envelope::{parse_envelope, BatchEvent, BatchItemFailure, BatchResponse, EnvelopeContent, QueueMessage};
use crate::writer::{Categorizer, ResultWriter};

/// External collaborators, injected so tests can run fully in memory.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn ObjectStore>,
    pub extraction_model: Arc<dyn GenerativeModel>,
    pub scoring_model: Arc<dyn GenerativeModel>,
    pub knowledge_base: Arc<dyn KnowledgeBase>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Written { key: String, category: Category },
    Ignored(String),
}

/// What is known about an opportunity so far; survives a budget timeout.
#[derive(Debug, Default)]
struct Progress {
    solicitation_id: Option<String>,
    summary: Option<ExtractedSummary>,
}

pub struct QueueWorker {
    config: Arc<PipelineConfig>,
    deps: WorkerDeps,
    categorizer: Categorizer,
    writer: ResultWriter,
}

impl QueueWorker {
    /// Refuses to start on a configuration the queue cannot honour.
    pub fn new(config: Arc<PipelineConfig>, deps: WorkerDeps) -> Result<Self, ConfigError> {
        config.validate()?;
        let categorizer = Categorizer::new(config.match_threshold, Arc::clone(&deps.clock));
        let writer = ResultWriter::new(
            Arc::clone(&deps.store),
            &config.storage.results_bucket,
            &config.storage.staging_prefix,
            config.write_timeout(),
        );
        info!(
            threshold = config.match_threshold,
            budget_secs = config.timeouts.processing_budget_secs,
            visibility_secs = config.queue.visibility_timeout_secs,
            knowledge_base = deps.knowledge_base.is_enabled(),
            extraction_model = deps.extraction_model.model_id(),
            scoring_model = deps.scoring_model.model_id(),
            "queue worker ready"
        );
        Ok(Self {
            config,
            deps,
            categorizer,
            writer,
        })
    }

    /// Process every message independently and report only the failed ones.
    pub async fn handle_batch(&self, batch: &BatchEvent) -> BatchResponse {
        if batch.records.len() > self.config.queue.batch_size {
            warn!(
                received = batch.records.len(),
                configured = self.config.queue.batch_size,
                "batch larger than configured batch size"
            );
        }
        let mut response = BatchResponse::default();
        for message in &batch.records {
            let span = info_span!(
                "message",
                message_id = %message.message_id,
                receive_count = message.receive_count()
            );
            let outcome = self.handle_message(message).instrument(span).await;
            if outcome.is_err() {
                response.batch_item_failures.push(BatchItemFailure {
                    item_identifier: message.message_id.clone(),
                });
            }
        }
        info!(
            messages = batch.records.len(),
            failed = response.batch_item_failures.len(),
            "batch complete"
        );
        response
    }

    pub async fn handle_message(&self, message: &QueueMessage) -> Result<MessageOutcome, ProcessingError> {
        let location = match parse_envelope(&message.body) {
            Ok(EnvelopeContent::Object(location)) => location,
            Ok(EnvelopeContent::Ignorable(reason)) => {
                info!(%reason, "control message acknowledged without processing");
                return Ok(MessageOutcome::Ignored(reason));
            }
            Err(err) => {
                self.log_failure(message, &err);
                return Err(err);
            }
        };
        let reference = match OpportunityReference::from_location(&location.bucket, &location.key) {
            Ok(reference) => reference,
            Err(err) => {
                let err = ProcessingError::permanent(Stage::Envelope, err.to_string());
                self.log_failure(message, &err);
                return Err(err);
            }
        };

        let span = info_span!("opportunity", opportunity_id = %reference.opportunity_id);
        async {
            let mut progress = Progress::default();
            let budget = self.config.processing_budget();
            let outcome = match tokio::time::timeout(budget, self.process(&reference, &mut progress)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProcessingError::transient(
                    Stage::Budget,
                    format!("processing budget of {}s exhausted", budget.as_secs()),
                )),
            };
            match outcome {
                Ok((key, category)) => Ok(MessageOutcome::Written { key, category }),
                Err(err) => {
                    self.log_failure(message, &err);
                    self.record_failure(&reference, progress, &err).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn process(
        &self,
        reference: &OpportunityReference,
        progress: &mut Progress,
    ) -> Result<(String, Category), ProcessingError> {
        let raw = self.fetch_raw(reference).await?;
        let solicitation_id = raw.solicitation_id();
        progress.solicitation_id = Some(solicitation_id.clone());

        let attachments = fetch_attachments(
            Arc::clone(&self.deps.store),
            &reference.source_location.bucket,
            &raw.attachment_keys,
            &self.config.limits,
            self.config.fetch_timeout(),
        )
        .await?;
        let summary = extract_summary(
            self.deps.extraction_model.as_ref(),
            &raw,
            &attachments,
            &self.config.limits,
            &self.config.extraction_call(),
        )
        .await?;
        progress.summary = Some(summary.clone());
        debug!(title = %summary.title, skills = summary.required_skills.len(), "summary extracted");

        let passages = retrieve_evidence(
            self.deps.knowledge_base.as_ref(),
            &self.config.knowledge_base,
            &summary,
            &self.config.retrieval_call(),
        )
        .await?;
        let assessment = score_opportunity(
            self.deps.scoring_model.as_ref(),
            &summary,
            &passages,
            &self.config.limits.summary,
            &self.config.scoring_call(),
        )
        .await?;

        let result = self.categorizer.scored(reference, &solicitation_id, summary, assessment);
        let category = result.category;
        let key = self.writer.write(&result).await?;
        Ok((key, category))
    }

    async fn fetch_raw(&self, reference: &OpportunityReference) -> Result<RawOpportunity, ProcessingError> {
        let location = &reference.source_location;
        let timeout = self.config.fetch_timeout();
        let object = match tokio::time::timeout(timeout, self.deps.store.get(&location.bucket, &location.key)).await {
            Ok(Ok(object)) => object,
            Ok(Err(err @ (StorageError::NotFound { .. } | StorageError::InvalidKey(_)))) => {
                return Err(ProcessingError::permanent(
                    Stage::Fetch,
                    format!("raw opportunity unreadable: {err}"),
                ))
            }
            Ok(Err(err)) => {
                return Err(ProcessingError::transient(
                    Stage::Fetch,
                    format!("reading raw opportunity: {err}"),
                ))
            }
            Err(_) => {
                return Err(ProcessingError::transient(
                    Stage::Fetch,
                    format!("reading {} timed out", location.key),
                ))
            }
        };
        RawOpportunity::from_json_bytes(reference.clone(), &object.body)
    }

    /// Best effort: the message already failed, a failed error write only gets logged.
    async fn record_failure(&self, reference: &OpportunityReference, progress: Progress, err: &ProcessingError) {
        let solicitation_id = progress
            .solicitation_id
            .unwrap_or_else(|| reference.opportunity_id.clone());
        let result = self.categorizer.failed(reference, &solicitation_id, progress.summary, err);
        if let Err(write_err) = self.writer.write(&result).await {
            warn!(error = %write_err, "could not record failure in the errors category");
        }
    }

    fn log_failure(&self, message: &QueueMessage, err: &ProcessingError) {
        let final_attempt = message.receive_count() >= self.config.queue.max_receive_count;
        match err.kind {
            ErrorKind::Permanent => error!(
                stage = %err.stage,
                error = %err.message,
                "permanent failure; redelivery will not help"
            ),
            ErrorKind::Transient => warn!(
                stage = %err.stage,
                error = %err.message,
                "transient failure; message returned to the queue"
            ),
        }
        if final_attempt {
            error!(
                receive_count = message.receive_count(),
                max_receive_count = self.config.queue.max_receive_count,
                "final delivery attempt failed; message moves to the dead-letter queue"
            );
        }
    }
}
