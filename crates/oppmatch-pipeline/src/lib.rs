//! Opportunity-match pipeline orchestration: queue worker, result writer,
//! backlog reconciler and their wiring from configuration.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use oppmatch_core::{Clock, SystemClock};
use oppmatch_inference::{
    DisabledKnowledgeBase, GenerativeModel, HttpGenerativeModel, HttpKnowledgeBase, KnowledgeBase,
};
use oppmatch_storage::{LocalObjectStore, ObjectStore};
use tracing::info;

pub mod config;
pub mod envelope;
pub mod export;
pub mod reconciler;
pub mod worker;
pub mod writer;

pub use config::{ConfigError, PipelineConfig};
pub use envelope::{parse_envelope, BatchEvent, BatchItemFailure, BatchResponse, EnvelopeContent, QueueMessage};
pub use reconciler::{ReconcileOutcome, ReconcileReport, Reconciler, ReconcilerState, SkipReason};
pub use worker::{MessageOutcome, QueueWorker, WorkerDeps};
pub use writer::{Categorizer, ResultWriter};

pub const CRATE_NAME: &str = "oppmatch-pipeline";

/// Production collaborators built from configuration.
pub fn build_deps(config: &PipelineConfig) -> Result<WorkerDeps> {
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(config.storage.root.clone()));
    let extraction_model: Arc<dyn GenerativeModel> = Arc::new(
        HttpGenerativeModel::new(config.extraction_model.clone(), config.extraction_call().timeout)
            .context("building extraction model client")?,
    );
    let scoring_model: Arc<dyn GenerativeModel> = Arc::new(
        HttpGenerativeModel::new(config.scoring_model(), config.scoring_call().timeout)
            .context("building scoring model client")?,
    );
    let knowledge_base: Arc<dyn KnowledgeBase> = if config.knowledge_base.is_enabled() {
        Arc::new(
            HttpKnowledgeBase::new(&config.knowledge_base, config.retrieval_call().timeout)
                .context("building knowledge base client")?,
        )
    } else {
        Arc::new(DisabledKnowledgeBase)
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Ok(WorkerDeps {
        store,
        extraction_model,
        scoring_model,
        knowledge_base,
        clock,
    })
}

pub fn load_config(path: Option<&Path>) -> Result<Arc<PipelineConfig>> {
    let config = PipelineConfig::load(path).context("loading pipeline configuration")?;
    Ok(Arc::new(config))
}

/// Read a batch event from JSON, process it, and return the partial-failure response.
pub async fn process_batch_json(config_path: Option<&Path>, event_json: &str) -> Result<BatchResponse> {
    let config = load_config(config_path)?;
    let deps = build_deps(&config)?;
    let worker = QueueWorker::new(config, deps).context("queue worker refused to start")?;
    let batch: BatchEvent = serde_json::from_str(event_json).context("parsing batch event")?;
    Ok(worker.handle_batch(&batch).await)
}

pub async fn reconcile_once(config_path: Option<&Path>) -> Result<ReconcileOutcome> {
    let config = load_config(config_path)?;
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(config.storage.root.clone()));
    let reconciler = Reconciler::new(config, store, Arc::new(SystemClock));
    reconciler.run_once().await
}

/// Run the reconciler on its cron schedule until interrupted.
pub async fn run_scheduler(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    if !config.reconciler.scheduler_enabled {
        info!("reconciler scheduler disabled (set OPPMATCH_SCHEDULER_ENABLED=true to enable)");
        return Ok(());
    }
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(config.storage.root.clone()));
    let cron = config.reconciler.cron.clone();
    let reconciler = Arc::new(Reconciler::new(config, store, Arc::new(SystemClock)));
    let mut sched = reconciler.build_scheduler().await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "reconciler scheduler started");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("reconciler scheduler stopped");
    Ok(())
}
