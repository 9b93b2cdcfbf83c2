//! Backlog reconciler.
//!
//! Each tick merges every staged result into one append-only run summary and
//! moves the staged objects into the archive. Staged objects are partitioned by
//! modification time relative to the current window so that late arrivals and
//! strays from missed ticks are merged rather than stranded.
//!
//! Crash safety comes from a write-ahead journal kept in the state object: the
//! journal lists every staged object (with its content hash) that the summary
//! about to be written contains. A tick that finds a journal left behind either
//! finishes its archive moves (summary present) or discards it (summary absent,
//! so the objects are still staged and get merged again).

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use oppmatch_core::{Clock, MatchResult, RunSummary};
use oppmatch_storage::{sha256_hex, ObjectMeta, ObjectStore, StorageError};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::export::{encode_records, SnapshotFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    /// Modified inside the current window.
    Current,
    /// Older than the window but inside the span already covered by earlier windows.
    Carryover,
    /// Older than any window boundary ever recorded.
    Stray,
}

/// Classify a staged object by modification time.
pub fn partition(
    last_modified: DateTime<Utc>,
    window_start: DateTime<Utc>,
    oldest_boundary: Option<DateTime<Utc>>,
) -> Partition {
    if last_modified >= window_start {
        Partition::Current
    } else if oldest_boundary.is_some_and(|oldest| last_modified >= oldest) {
        Partition::Carryover
    } else {
        Partition::Stray
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerState {
    pub oldest_window_start: Option<DateTime<Utc>>,
    pub last_window_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending: Option<PendingRun>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRun {
    pub run_id: Uuid,
    pub summary_key: String,
    pub entries: Vec<PendingEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub staging_key: String,
    pub archive_key: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Lease {
    holder: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

const UNKNOWN_HOLDER: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another tick is running in this process.
    InProgress,
    /// Another process holds an unexpired lease.
    LeaseHeld { holder: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub run_id: Uuid,
    pub summary_key: Option<String>,
    pub snapshot: Option<SnapshotFile>,
    pub merged: usize,
    pub current: usize,
    pub carryover: usize,
    pub stray: usize,
    pub archived: usize,
    /// Staged copies whose archived twin was already present and identical.
    pub already_archived: usize,
    pub quarantined: usize,
    /// Archive moves finished on behalf of a crashed earlier tick.
    pub recovered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Completed(ReconcileReport),
    Skipped(SkipReason),
}

struct StagedRecord {
    result: MatchResult,
    entry: PendingEntry,
    partition: Partition,
}

pub struct Reconciler {
    config: Arc<PipelineConfig>,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    holder: String,
    guard: Mutex<()>,
}

impl Reconciler {
    pub fn new(config: Arc<PipelineConfig>, store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
            holder: format!("reconciler-{}", Uuid::new_v4()),
            guard: Mutex::new(()),
        }
    }

    fn bucket(&self) -> &str {
        &self.config.storage.results_bucket
    }

    fn state_key(&self) -> String {
        format!("{}state.json", self.config.storage.state_prefix)
    }

    fn lease_key(&self) -> String {
        format!("{}lease.json", self.config.storage.state_prefix)
    }

    /// Run one tick unless another one is already in flight.
    pub async fn run_once(&self) -> Result<ReconcileOutcome> {
        let Ok(_in_process) = self.guard.try_lock() else {
            info!("reconciler tick already running in this process; skipping");
            return Ok(ReconcileOutcome::Skipped(SkipReason::InProgress));
        };
        if let Some(holder) = self.acquire_lease().await? {
            info!(%holder, "reconciler lease held elsewhere; skipping");
            return Ok(ReconcileOutcome::Skipped(SkipReason::LeaseHeld { holder }));
        }
        let result = self.reconcile().await;
        if let Err(err) = self.release_lease().await {
            warn!(error = %err, "failed to release reconciler lease; it will expire");
        }
        result.map(ReconcileOutcome::Completed)
    }

    /// Returns the current holder when the lease could not be taken.
    async fn acquire_lease(&self) -> Result<Option<String>> {
        let now = self.clock.now();
        let ttl = self.config.lease_ttl()?;
        let lease = Lease {
            holder: self.holder.clone(),
            acquired_at: now,
            expires_at: now.checked_add_signed(ttl).context("lease expiry out of range")?,
        };
        let body = serde_json::to_vec(&lease).context("serializing lease")?;
        let key = self.lease_key();
        for _ in 0..2 {
            if self
                .store
                .put_if_absent(self.bucket(), &key, &body)
                .await
                .context("creating reconciler lease")?
            {
                return Ok(None);
            }
            let existing = match self.store.get(self.bucket(), &key).await {
                Ok(object) => object,
                Err(StorageError::NotFound { .. }) => continue,
                Err(err) => return Err(err).context("reading reconciler lease"),
            };
            let recently_written = existing
                .meta
                .last_modified
                .checked_add_signed(ttl)
                .map_or(true, |until| until > now);
            match serde_json::from_slice::<Lease>(&existing.body) {
                Ok(current) if current.expires_at > now => return Ok(Some(current.holder)),
                Ok(current) => {
                    warn!(holder = %current.holder, expired_at = %current.expires_at, "taking over expired lease")
                }
                // An unreadable lease is judged by its age alone.
                Err(err) if recently_written => {
                    debug!(error = %err, "unreadable lease is still fresh");
                    return Ok(Some(UNKNOWN_HOLDER.to_string()));
                }
                Err(err) => warn!(error = %err, "replacing unreadable lease"),
            }
            self.store
                .delete(self.bucket(), &key)
                .await
                .context("removing stale lease")?;
        }
        Ok(Some(UNKNOWN_HOLDER.to_string()))
    }

    async fn release_lease(&self) -> Result<()> {
        let key = self.lease_key();
        match self.store.get(self.bucket(), &key).await {
            Ok(object) => {
                let lease: Lease = serde_json::from_slice(&object.body).context("parsing lease")?;
                if lease.holder == self.holder {
                    self.store.delete(self.bucket(), &key).await?;
                }
                Ok(())
            }
            Err(StorageError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn load_state(&self) -> Result<ReconcilerState> {
        match self.store.get(self.bucket(), &self.state_key()).await {
            Ok(object) => serde_json::from_slice(&object.body).context("parsing reconciler state"),
            Err(StorageError::NotFound { .. }) => Ok(ReconcilerState::default()),
            Err(err) => Err(err).context("reading reconciler state"),
        }
    }

    async fn save_state(&self, state: &ReconcilerState) -> Result<()> {
        let body = serde_json::to_vec_pretty(state).context("serializing reconciler state")?;
        self.store
            .put(self.bucket(), &self.state_key(), &body)
            .await
            .context("writing reconciler state")?;
        Ok(())
    }

    async fn reconcile(&self) -> Result<ReconcileReport> {
        let now = self.clock.now();
        let run_id = Uuid::new_v4();
        let mut state = self.load_state().await?;
        let mut report = ReconcileReport {
            run_id,
            ..Default::default()
        };

        if let Some(pending) = state.pending.take() {
            report.recovered = self.recover(&pending).await?;
            self.save_state(&state).await?;
        }

        let interval = self.config.reconcile_interval()?;
        let window_start = match state.last_window_end {
            Some(end) => end,
            None => now.checked_sub_signed(interval).context("reconcile window start out of range")?,
        }
        .min(now);
        let prior_oldest = state.oldest_window_start;
        info!(%run_id, %window_start, window_end = %now, "reconciling staged results");

        let staging = &self.config.storage.staging_prefix;
        let listed = self
            .store
            .list(self.bucket(), staging)
            .await
            .context("listing staged results")?;

        let mut staged = Vec::new();
        let mut finished = Vec::new();
        for meta in listed {
            let Some(record) = self.stage(&meta, window_start, prior_oldest, &mut report).await? else {
                continue;
            };
            match record {
                Staged::Merge(record) => staged.push(record),
                Staged::AlreadyArchived(key) => finished.push(key),
            }
        }

        if !staged.is_empty() {
            let records = self.write_run(run_id, now, window_start, &mut state, staged, &mut report).await?;
            report.merged = records;
        }
        for key in &finished {
            self.store
                .delete(self.bucket(), key)
                .await
                .with_context(|| format!("removing archived staging copy {key}"))?;
        }
        report.already_archived = finished.len();

        state.pending = None;
        state.last_window_end = Some(now);
        state.oldest_window_start = Some(prior_oldest.map_or(window_start, |o| o.min(window_start)));
        self.save_state(&state).await?;

        info!(
            %run_id,
            merged = report.merged,
            current = report.current,
            carryover = report.carryover,
            stray = report.stray,
            archived = report.archived,
            already_archived = report.already_archived,
            quarantined = report.quarantined,
            recovered = report.recovered,
            "reconciler tick complete"
        );
        Ok(report)
    }

    /// Read, hash and classify one staged object.
    async fn stage(
        &self,
        meta: &ObjectMeta,
        window_start: DateTime<Utc>,
        prior_oldest: Option<DateTime<Utc>>,
        report: &mut ReconcileReport,
    ) -> Result<Option<Staged>> {
        let staging = &self.config.storage.staging_prefix;
        let relative = meta.key.strip_prefix(staging.as_str()).unwrap_or(&meta.key);
        let archive_key = format!("{}{}", self.config.storage.archive_prefix, relative);

        let object = match self.store.get(self.bucket(), &meta.key).await {
            Ok(object) => object,
            Err(StorageError::NotFound { .. }) => {
                debug!(key = %meta.key, "staged object vanished before it was read");
                return Ok(None);
            }
            Err(err) => return Err(err).with_context(|| format!("reading staged {}", meta.key)),
        };
        let sha256 = sha256_hex(&object.body);

        match self.store.get(self.bucket(), &archive_key).await {
            Ok(twin) if sha256_hex(&twin.body) == sha256 => {
                return Ok(Some(Staged::AlreadyArchived(meta.key.clone())));
            }
            Ok(_) | Err(StorageError::NotFound { .. }) => {}
            Err(err) => return Err(err).with_context(|| format!("checking archive twin {archive_key}")),
        }

        let parsed = serde_json::from_slice::<MatchResult>(&object.body)
            .map_err(|e| e.to_string())
            .and_then(|result| result.validate().map(|_| result).map_err(|e| e.to_string()));
        let result = match parsed {
            Ok(result) => result,
            Err(reason) => {
                self.quarantine(&meta.key, relative, &object.body, &reason).await?;
                report.quarantined += 1;
                return Ok(None);
            }
        };

        let partition = partition(meta.last_modified, window_start, prior_oldest);
        match partition {
            Partition::Current => report.current += 1,
            Partition::Carryover => report.carryover += 1,
            Partition::Stray => {
                report.stray += 1;
                warn!(key = %meta.key, last_modified = %meta.last_modified, "stray staged result merged");
            }
        }
        Ok(Some(Staged::Merge(StagedRecord {
            result,
            entry: PendingEntry {
                staging_key: meta.key.clone(),
                archive_key,
                sha256,
            },
            partition,
        })))
    }

    async fn quarantine(&self, key: &str, relative: &str, body: &[u8], reason: &str) -> Result<()> {
        let target = format!("{}{}", self.config.storage.quarantine_prefix, relative);
        error!(%key, %target, %reason, "invalid staged object quarantined");
        self.store
            .put(self.bucket(), &target, body)
            .await
            .with_context(|| format!("writing quarantine copy {target}"))?;
        self.store
            .delete(self.bucket(), key)
            .await
            .with_context(|| format!("removing quarantined {key}"))?;
        Ok(())
    }

    /// Journal, summary, snapshot, archive moves. Returns the merged record count.
    async fn write_run(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        state: &mut ReconcilerState,
        staged: Vec<StagedRecord>,
        report: &mut ReconcileReport,
    ) -> Result<usize> {
        let summaries = &self.config.storage.summaries_prefix;
        let stem = format!("{}{}/run-{}", summaries, now.format("%Y-%m-%d"), now.format("%Y%m%dT%H%M%SZ"));
        let summary_key = format!("{stem}.json");

        let count = |p: Partition| staged.iter().filter(|s| s.partition == p).count();
        let (current, carryover, stray) = (count(Partition::Current), count(Partition::Carryover), count(Partition::Stray));
        let (records, entries): (Vec<_>, Vec<_>) = staged.into_iter().map(|s| (s.result, s.entry)).unzip();

        state.pending = Some(PendingRun {
            run_id,
            summary_key: summary_key.clone(),
            entries: entries.clone(),
        });
        self.save_state(state).await?;

        let summary = RunSummary {
            run_id,
            processed_at: now,
            window_start,
            window_end: now,
            current_window_count: current,
            carryover_count: carryover,
            stray_count: stray,
            records,
        };
        let body = serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
        self.store
            .put(self.bucket(), &summary_key, &body)
            .await
            .with_context(|| format!("writing run summary {summary_key}"))?;
        for (category, n) in summary.category_counts() {
            debug!(%run_id, %category, records = n, "run summary category count");
        }

        if self.config.reconciler.export_parquet {
            let snapshot_key = format!("{stem}.parquet");
            let bytes = encode_records(&summary.records)?;
            self.store
                .put(self.bucket(), &snapshot_key, &bytes)
                .await
                .with_context(|| format!("writing parquet snapshot {snapshot_key}"))?;
            report.snapshot = Some(SnapshotFile::describe("match_results", &snapshot_key, &bytes));
        }

        for entry in &entries {
            if self.archive(entry).await? {
                report.archived += 1;
            }
        }
        report.summary_key = Some(summary_key);
        Ok(summary.records.len())
    }

    /// Move one journaled object, unless it changed since it was merged.
    async fn archive(&self, entry: &PendingEntry) -> Result<bool> {
        let object = match self.store.get(self.bucket(), &entry.staging_key).await {
            Ok(object) => object,
            Err(StorageError::NotFound { .. }) => return Ok(false),
            Err(err) => return Err(err).with_context(|| format!("reading {}", entry.staging_key)),
        };
        if sha256_hex(&object.body) != entry.sha256 {
            info!(key = %entry.staging_key, "staged result rewritten since merge; left for the next tick");
            return Ok(false);
        }
        self.store
            .put(self.bucket(), &entry.archive_key, &object.body)
            .await
            .with_context(|| format!("writing archive copy {}", entry.archive_key))?;
        self.store
            .delete(self.bucket(), &entry.staging_key)
            .await
            .with_context(|| format!("removing staged {}", entry.staging_key))?;
        Ok(true)
    }

    async fn recover(&self, pending: &PendingRun) -> Result<usize> {
        let summary = self
            .store
            .head(self.bucket(), &pending.summary_key)
            .await
            .context("checking journaled run summary")?;
        if summary.is_none() {
            warn!(run_id = %pending.run_id, "discarding journal of a run whose summary was never written");
            return Ok(0);
        }
        let mut moved = 0;
        for entry in &pending.entries {
            if self.archive(entry).await? {
                moved += 1;
            }
        }
        warn!(run_id = %pending.run_id, moved, "finished archive moves of an interrupted run");
        Ok(moved)
    }

    /// Cron job running [`Reconciler::run_once`]. Overlapping ticks are skipped.
    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.reconciler.cron.clone();
        let reconciler = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let reconciler = Arc::clone(&reconciler);
            Box::pin(async move {
                match reconciler.run_once().await {
                    Ok(ReconcileOutcome::Completed(report)) => {
                        info!(run_id = %report.run_id, merged = report.merged, "scheduled reconcile finished")
                    }
                    Ok(ReconcileOutcome::Skipped(reason)) => info!(?reason, "scheduled reconcile skipped"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled reconcile failed"),
                }
            })
        })
        .with_context(|| format!("creating reconcile job for cron `{cron}`"))?;
        sched.add(job).await.context("adding reconcile job")?;
        Ok(sched)
    }
}

enum Staged {
    Merge(StagedRecord),
    AlreadyArchived(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, h, m, 0).single().unwrap()
    }

    #[test]
    fn partitions_follow_window_and_oldest_boundary() {
        let start = at(12, 0);
        assert_eq!(partition(at(12, 5), start, Some(at(9, 0))), Partition::Current);
        assert_eq!(partition(at(12, 0), start, Some(at(9, 0))), Partition::Current);
        assert_eq!(partition(at(10, 0), start, Some(at(9, 0))), Partition::Carryover);
        assert_eq!(partition(at(8, 59), start, Some(at(9, 0))), Partition::Stray);
        assert_eq!(partition(at(11, 0), start, None), Partition::Stray);
    }

    #[test]
    fn state_round_trips_without_pending() {
        let state: ReconcilerState =
            serde_json::from_str(r#"{"oldest_window_start": null, "last_window_end": "2026-07-01T12:00:00Z"}"#)
                .unwrap();
        assert_eq!(state.last_window_end, Some(at(12, 0)));
        assert!(state.pending.is_none());
    }
}
