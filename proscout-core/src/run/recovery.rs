//! Startup reconciliation between durable run rows and the live job queue.
//!
//! The reconciler only moves `pending`/`running` rows to `error`, re-enqueues
//! resumable runs, finalizes resumable rows that are over the retry ceiling,
//! and drops queue entries whose run is gone or finished. It never touches
//! `success` or `cancelled` rows. A second pass with no activity in between
//! changes nothing.
//!
//! Rows are written with [`RunStore::update_if`] against the `updated_at`
//! seen in the scan, so a row a live worker moved on in the meantime is left
//! alone and counted in `skipped`.

use super::control::can_resume;
use super::phases::GraphConfig;
use super::types::{Job, ResearchRun, RunKind, RunStatus, job_key};
use crate::config::RecoveryConfig;
use crate::error::{RunError, ScoutError};
use crate::queue::{EnqueueOutcome, JobQueue};
use crate::store::RunStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    /// Pending runs whose job was lost, now `error`.
    pub lost_pending: usize,
    /// Stale running runs demoted to `error`.
    pub demoted_stale: usize,
    pub requeued: usize,
    /// Runs with nothing to resume from, finalized as `error`.
    pub unrecoverable: usize,
    /// Resumable runs over the retry ceiling, finalized as `error`.
    pub retry_limited: usize,
    pub orphans_removed: usize,
    /// Rows that changed between the scan and the write, left untouched.
    #[serde(default)]
    pub skipped: usize,
}

impl ReconcileReport {
    /// Number of rows or queue entries this pass changed.
    pub fn changes(&self) -> usize {
        self.lost_pending
            + self.demoted_stale
            + self.requeued
            + self.unrecoverable
            + self.retry_limited
            + self.orphans_removed
    }
}

pub struct Reconciler {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn JobQueue>,
    graph: GraphConfig,
    config: RecoveryConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<dyn JobQueue>,
        graph: GraphConfig,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            queue,
            graph,
            config,
        }
    }

    /// Wait out the startup grace delay, then reconcile once.
    pub async fn run_at_startup(&self) -> Result<ReconcileReport, ScoutError> {
        if self.config.grace_delay_secs > 0 {
            tokio::time::sleep(Duration::from_secs(self.config.grace_delay_secs)).await;
        }
        self.reconcile().await
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, ScoutError> {
        self.reconcile_at(Utc::now()).await
    }

    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport, ScoutError> {
        let mut report = ReconcileReport::default();
        let queued: HashSet<String> = self
            .queue
            .list()
            .await?
            .into_iter()
            .map(|entry| entry.key)
            .collect();

        let mut runs: HashMap<Uuid, ResearchRun> = HashMap::new();
        for mut run in self.store.list().await? {
            report.scanned += 1;
            let key = job_key(run.id);
            let has_job = queued.contains(&key);

            let written = match run.status {
                RunStatus::Pending if !has_job && self.past_grace(&run, now) => {
                    let seen = run.updated_at;
                    run.mark_error("job lost before dispatch", false);
                    let written = self.write(&run, seen).await?;
                    if written {
                        warn!(run_id = %run.id, "Pending run has no queued job, marked error");
                        report.lost_pending += 1;
                    }
                    written
                }
                RunStatus::Running if self.is_stale(&run, now) => {
                    self.recover_stale(&mut run, &key, &mut report).await?
                }
                RunStatus::Error if run.completed_at.is_none() && !has_job => {
                    if self.config.auto_resume || run.checkpoint.is_none() {
                        self.requeue(&mut run, &mut report).await?
                    } else {
                        true
                    }
                }
                _ => true,
            };
            if !written {
                report.skipped += 1;
                match self.store.get(run.id).await? {
                    Some(current) => run = current,
                    None => continue,
                }
            }
            runs.insert(run.id, run);
        }

        for entry in self.queue.list().await? {
            let orphaned = runs
                .get(&entry.job.run_id)
                .is_none_or(|run| !run.is_open());
            if orphaned && self.queue.remove(&entry.key).await? {
                info!(key = %entry.key, "Removed orphaned queue entry");
                report.orphans_removed += 1;
            }
        }

        if report.changes() > 0 {
            info!(
                scanned = report.scanned,
                lost_pending = report.lost_pending,
                demoted_stale = report.demoted_stale,
                requeued = report.requeued,
                unrecoverable = report.unrecoverable,
                retry_limited = report.retry_limited,
                orphans_removed = report.orphans_removed,
                skipped = report.skipped,
                "Reconciliation repaired drift"
            );
        }
        Ok(report)
    }

    /// Write `run` unless the stored row moved past `seen` since the scan.
    async fn write(&self, run: &ResearchRun, seen: DateTime<Utc>) -> Result<bool, ScoutError> {
        let written = self.store.update_if(run, seen).await?;
        if !written {
            debug!(run_id = %run.id, "Run changed since the scan, leaving it alone");
        }
        Ok(written)
    }

    fn past_grace(&self, run: &ResearchRun, now: DateTime<Utc>) -> bool {
        now - run.created_at >= seconds(self.config.grace_delay_secs)
    }

    fn is_stale(&self, run: &ResearchRun, now: DateTime<Utc>) -> bool {
        now - run.updated_at > seconds(self.config.stale_after_secs)
    }

    /// Returns false when the row changed under the scan and was left alone.
    async fn recover_stale(
        &self,
        run: &mut ResearchRun,
        key: &str,
        report: &mut ReconcileReport,
    ) -> Result<bool, ScoutError> {
        let seen = run.updated_at;
        let message = format!(
            "run stalled in phase {} with no activity since {}",
            run.current_phase.map(|p| p.to_string()).unwrap_or_else(|| "none".into()),
            run.updated_at.to_rfc3339()
        );

        let restartable = run.step_count > 0 && self.config.auto_resume;
        if run.checkpoint.is_some() {
            run.mark_error(message, true);
        } else if restartable {
            // No checkpoint to resume from; the next attempt starts over.
            run.mark_error(message, false);
            run.completed_at = None;
        } else {
            run.mark_error(format!("{message}; unrecoverable"), false);
            if !self.write(run, seen).await? {
                return Ok(false);
            }
            self.queue.remove(key).await?;
            warn!(run_id = %run.id, "Stale run has no checkpoint or progress, unrecoverable");
            report.unrecoverable += 1;
            return Ok(true);
        }
        if !self.write(run, seen).await? {
            return Ok(false);
        }
        // The entry belongs to a worker that is no longer making progress.
        self.queue.remove(key).await?;
        warn!(run_id = %run.id, step_count = run.step_count, "Stale run demoted to error");
        report.demoted_stale += 1;

        if self.config.auto_resume {
            return self.requeue(run, report).await;
        }
        Ok(true)
    }

    /// Enqueue a resume job, or finalize the run if it is over the retry ceiling.
    async fn requeue(
        &self,
        run: &mut ResearchRun,
        report: &mut ReconcileReport,
    ) -> Result<bool, ScoutError> {
        let check = if run.checkpoint.is_some() {
            can_resume(run, &self.graph)
        } else {
            self.within_ceiling(run)
        };
        match check {
            Ok(()) => {
                if self.queue.enqueue(Job::for_run(run, RunKind::Resume)).await?
                    == EnqueueOutcome::Enqueued
                {
                    info!(run_id = %run.id, step_count = run.step_count, "Re-enqueued run for resume");
                    report.requeued += 1;
                }
            }
            Err(err) => {
                let seen = run.updated_at;
                run.mark_error(err.to_string(), false);
                if !self.write(run, seen).await? {
                    return Ok(false);
                }
                warn!(run_id = %run.id, error = %err, "Run cannot be resumed, finalized");
                report.retry_limited += 1;
            }
        }
        Ok(true)
    }

    fn within_ceiling(&self, run: &ResearchRun) -> Result<(), RunError> {
        let ceiling = self.graph.retry_ceiling();
        if run.step_count >= ceiling {
            return Err(RunError::RetryLimitExceeded {
                steps: run.step_count,
                ceiling,
            });
        }
        Ok(())
    }
}

fn seconds(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}
