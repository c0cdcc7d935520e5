//! Operator control surface: trigger, pause, resume, cancel.
//!
//! Each operation validates the run's current status against the legal
//! transitions before touching the run row or the queue. Pause and cancel of a
//! running run only set a durable flag; the orchestrator acts on it at the next
//! phase boundary.

use super::phases::GraphConfig;
use super::types::{Job, ResearchRun, RunKind, RunStatus, job_key};
use crate::error::{RunError, ScoutError};
use crate::events::{EventBus, EventKind, LifecycleEvent};
use crate::queue::{EnqueueOutcome, JobQueue, JobState};
use crate::store::RunStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Whether `run` may be resumed under `graph`'s retry ceiling.
pub fn can_resume(run: &ResearchRun, graph: &GraphConfig) -> Result<(), RunError> {
    let resumable_state = match run.status {
        RunStatus::Paused => true,
        RunStatus::Error => run.checkpoint.is_some(),
        _ => false,
    };
    if !resumable_state {
        return Err(RunError::InvalidTransition {
            from: run.status.to_string(),
            to: RunStatus::Running.to_string(),
        });
    }
    let ceiling = graph.retry_ceiling();
    if run.step_count >= ceiling {
        return Err(RunError::RetryLimitExceeded {
            steps: run.step_count,
            ceiling,
        });
    }
    Ok(())
}

fn invalid(run: &ResearchRun, to: RunStatus) -> ScoutError {
    RunError::InvalidTransition {
        from: run.status.to_string(),
        to: to.to_string(),
    }
    .into()
}

pub struct RunController {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn JobQueue>,
    events: EventBus,
    graph: GraphConfig,
    /// Serializes the check-then-create of `trigger` within this process.
    trigger_lock: Mutex<()>,
}

impl RunController {
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<dyn JobQueue>,
        events: EventBus,
        graph: GraphConfig,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            graph,
            trigger_lock: Mutex::new(()),
        }
    }

    async fn load(&self, run_id: Uuid) -> Result<ResearchRun, ScoutError> {
        self.store
            .get(run_id)
            .await?
            .ok_or_else(|| RunError::RunNotFound { run_id }.into())
    }

    /// Create a pending run for `subject_id` and enqueue its first job.
    pub async fn trigger(&self, subject_id: &str, owner_id: &str) -> Result<ResearchRun, ScoutError> {
        let _guard = self.trigger_lock.lock().await;
        let existing = self.store.list().await?;
        if let Some(active) = existing
            .iter()
            .find(|r| r.subject_id == subject_id && r.status.is_active())
        {
            return Err(RunError::AlreadyActive {
                subject_id: subject_id.to_string(),
                run_id: active.id,
            }
            .into());
        }

        let run = ResearchRun::new(subject_id, owner_id);
        self.store.create(&run).await?;
        self.queue.enqueue(Job::for_run(&run, RunKind::Fresh)).await?;
        info!(run_id = %run.id, subject_id, owner_id, "Research run triggered");
        Ok(run)
    }

    /// Ask a running run to pause at its next phase boundary.
    pub async fn pause(&self, run_id: Uuid) -> Result<ResearchRun, ScoutError> {
        let run = self.load(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(invalid(&run, RunStatus::Paused));
        }
        self.store.set_pause_requested(run_id, true).await?;
        info!(run_id = %run_id, "Pause requested");
        self.load(run_id).await
    }

    /// Re-enqueue a paused or failed run from its checkpoint.
    ///
    /// Fails with [`RunError::JobAlreadyQueued`] while a job for the run is
    /// still waiting. A job that is being delivered gets one more delivery.
    pub async fn resume(&self, run_id: Uuid) -> Result<ResearchRun, ScoutError> {
        let run = self.load(run_id).await?;
        can_resume(&run, &self.graph)?;

        let job = Job::for_run(&run, RunKind::Resume);
        let key = job.key();
        if let Some(entry) = self.queue.get(&key).await?
            && entry.state == JobState::Waiting
        {
            return Err(RunError::JobAlreadyQueued { key }.into());
        }

        self.store.set_pause_requested(run_id, false).await?;
        match self.queue.enqueue(job).await? {
            EnqueueOutcome::Enqueued => {
                info!(run_id = %run_id, step_count = run.step_count, "Resume enqueued");
            }
            EnqueueOutcome::Deduplicated => {
                info!(run_id = %run_id, key = %key, "Resume queued behind the active delivery");
            }
        }
        self.load(run_id).await
    }

    /// Cancel a run. Running runs stop at the next phase boundary; idle runs
    /// are cancelled immediately and their queued job is dropped.
    pub async fn cancel(&self, run_id: Uuid) -> Result<ResearchRun, ScoutError> {
        let mut run = self.load(run_id).await?;
        if !run.status.can_transition_to(RunStatus::Cancelled) || !run.is_open() {
            return Err(invalid(&run, RunStatus::Cancelled));
        }

        let key = job_key(run_id);
        let in_flight = self
            .queue
            .get(&key)
            .await?
            .is_some_and(|entry| entry.state == JobState::Active);

        if run.status == RunStatus::Running || in_flight {
            self.store.set_cancel_requested(run_id, true).await?;
            info!(run_id = %run_id, "Cancel requested");
            return self.load(run_id).await;
        }

        self.queue.remove(&key).await?;
        run.mark_cancelled();
        self.store.update(&run).await?;
        self.store.set_pause_requested(run_id, false).await?;
        self.events
            .publish(LifecycleEvent::for_run(&run, EventKind::RunCancelled));
        info!(run_id = %run_id, "Research run cancelled");
        self.load(run_id).await
    }

    pub async fn status(&self, run_id: Uuid) -> Result<ResearchRun, ScoutError> {
        self.load(run_id).await
    }

    pub async fn list(&self) -> Result<Vec<ResearchRun>, ScoutError> {
        Ok(self.store.list().await?)
    }
}
