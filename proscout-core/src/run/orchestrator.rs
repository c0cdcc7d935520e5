//! Run orchestrator: drives one run through the research graph.
//!
//! The orchestrator is the only writer of a run's status while it executes.
//! It checks the durable pause/cancel flags before every phase, writes a
//! phase's evidence and checkpoint only after the phase succeeds, and enforces
//! the per-attempt step ceiling, salvaging whatever evidence exists when the
//! graph fails to finish.
//!
//! `step_count` advances when a phase finishes, whether it succeeded or failed,
//! so a phase that keeps failing still exhausts the retry ceiling.

use super::checkpoint::WorkingState;
use super::phases::{GraphConfig, Phase, PhaseContext, Transition, run_phase};
use super::types::{
    Disposition, Job, ResearchResult, ResearchRun, RunStatus, StepOutcome, StepRecord,
};
use crate::config::ScoutConfig;
use crate::error::{RunError, ScoutError};
use crate::events::{EventBus, EventKind, LifecycleEvent, PhaseOutcome, RunOutcome};
use crate::research::fields::FieldStateStore;
use crate::research::planner::ResearchPlanner;
use crate::store::RunStore;
use crate::tools::ResearchTools;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How one `execute` call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed { disposition: Disposition },
    /// The graph hit its step ceiling and a partial result was kept.
    Salvaged { evidence: usize },
    Paused { phase: Phase },
    Cancelled,
    Failed { message: String, resumable: bool },
    /// The run was already finished; nothing was done.
    Skipped { status: RunStatus },
}

pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    tools: Arc<dyn ResearchTools>,
    events: EventBus,
    config: Arc<ScoutConfig>,
    planner: ResearchPlanner,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        tools: Arc<dyn ResearchTools>,
        events: EventBus,
        config: Arc<ScoutConfig>,
    ) -> Self {
        let planner = ResearchPlanner::new(config.research.budget.clone());
        Self {
            store,
            tools,
            events,
            config,
            planner,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn graph(&self) -> &GraphConfig {
        &self.config.graph
    }

    fn emit(&self, run: &ResearchRun, kind: EventKind) {
        self.events.publish(LifecycleEvent::for_run(run, kind));
    }

    /// Execute (or continue) the run named by `job`.
    ///
    /// Store failures propagate; every other failure is recorded on the run row
    /// and reported through the returned outcome.
    pub async fn execute(&self, job: &Job) -> Result<ExecutionOutcome, ScoutError> {
        let Some(mut run) = self.store.get(job.run_id).await? else {
            return Err(RunError::RunNotFound { run_id: job.run_id }.into());
        };

        let resuming = match run.status {
            RunStatus::Pending => false,
            RunStatus::Paused | RunStatus::Running => true,
            RunStatus::Error if run.completed_at.is_none() => true,
            status => {
                debug!(run_id = %run.id, status = %status, "Run already finished, skipping");
                return Ok(ExecutionOutcome::Skipped { status });
            }
        };

        if resuming {
            let ceiling = self.graph().retry_ceiling();
            if run.step_count >= ceiling {
                let err = RunError::RetryLimitExceeded {
                    steps: run.step_count,
                    ceiling,
                };
                return self.fail(&mut run, err).await;
            }
        }

        let (state, start) = match run.checkpoint.as_ref().filter(|_| resuming) {
            Some(checkpoint) => {
                let decoded = WorkingState::from_checkpoint(checkpoint).and_then(|state| {
                    self.graph()
                        .index_of(checkpoint.phase)
                        .map(|index| (state, index))
                        .ok_or_else(|| RunError::CheckpointCorrupt {
                            message: format!(
                                "phase '{}' is not part of the configured graph",
                                checkpoint.phase
                            ),
                        })
                });
                match decoded {
                    Ok(decoded) => decoded,
                    Err(err) => return self.fail(&mut run, err).await,
                }
            }
            // Fresh runs, and restarts of runs that never got a checkpoint.
            None => (WorkingState::default(), 0),
        };

        if run.checkpoint.is_none() {
            match state.to_checkpoint(self.graph().phases[start]) {
                Ok(checkpoint) => run.checkpoint = Some(checkpoint),
                Err(err) => return self.fail(&mut run, err).await,
            }
        }

        let was_started = run.started_at.is_some();
        run.mark_running();
        self.store.update(&run).await?;
        if resuming {
            info!(
                run_id = %run.id,
                phase = %self.graph().phases[start],
                step_count = run.step_count,
                "Resuming research run"
            );
            self.emit(
                &run,
                EventKind::RunResumed {
                    step_count: run.step_count,
                },
            );
        } else {
            info!(
                run_id = %run.id,
                subject_id = %run.subject_id,
                restarted = was_started,
                "Starting research run"
            );
        }

        self.drive(run, state, start).await
    }

    async fn drive(
        &self,
        mut run: ResearchRun,
        mut state: WorkingState,
        mut cursor: usize,
    ) -> Result<ExecutionOutcome, ScoutError> {
        let graph = self.graph();
        let ctx = PhaseContext {
            run_id: run.id,
            subject_id: run.subject_id.clone(),
            owner_id: run.owner_id.clone(),
            tools: self.tools.as_ref(),
            store: self.store.as_ref(),
            planner: &self.planner,
            research: &self.config.research,
        };
        let mut attempt_steps = 0u32;

        while let Some(&phase) = graph.phases.get(cursor) {
            let flags = self.store.get_required(run.id).await?;
            if flags.cancel_requested {
                return self.cancel(&mut run).await;
            }
            if flags.pause_requested {
                return self.pause(&mut run, &state, phase).await;
            }
            if attempt_steps >= graph.steps_per_attempt {
                return self.salvage(&mut run, attempt_steps).await;
            }

            attempt_steps += 1;
            let step = run.step_count + 1;
            self.emit(&run, EventKind::PhaseStarted { phase, step });
            debug!(run_id = %run.id, phase = %phase, step, "Phase started");

            let started_at = Utc::now();
            let timer = Instant::now();
            let result = run_phase(phase, &ctx, state.clone()).await;
            let elapsed_ms = timer.elapsed().as_millis() as u64;
            let ended_at = Utc::now();
            run.step_count = step;

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) => {
                    run.history.push(StepRecord {
                        phase,
                        started_at,
                        ended_at,
                        outcome: StepOutcome::Failed,
                        detail: Some(err.to_string()),
                    });
                    self.emit(
                        &run,
                        EventKind::PhaseCompleted {
                            phase,
                            step,
                            outcome: PhaseOutcome::Error,
                            error: Some(err.to_string()),
                        },
                    );
                    return self.fail(&mut run, err).await;
                }
            };

            state = outcome.state;
            state.active_elapsed_ms += elapsed_ms;
            self.flush_evidence(run.id, &mut state).await?;
            cursor = match outcome.next {
                Transition::Next => cursor + 1,
                Transition::Jump(target) => graph.index_of(target).unwrap_or(graph.phases.len()),
            };

            run.history.push(StepRecord {
                phase,
                started_at,
                ended_at,
                outcome: StepOutcome::Completed,
                detail: None,
            });
            run.cost_spent = state.cost_spent;
            if let Some(&next) = graph.phases.get(cursor) {
                match state.to_checkpoint(next) {
                    Ok(checkpoint) => run.checkpoint = Some(checkpoint),
                    Err(err) => return self.fail(&mut run, err).await,
                }
                run.current_phase = Some(next);
            }
            run.touch();
            self.store.update(&run).await?;
            self.emit(
                &run,
                EventKind::PhaseCompleted {
                    phase,
                    step,
                    outcome: PhaseOutcome::Success,
                    error: None,
                },
            );
        }

        self.finish(&mut run, &state).await
    }

    /// Write the evidence a successful phase staged as the next batch.
    ///
    /// The batch number only advances through the checkpoint, so a phase
    /// replayed after a lost checkpoint write overwrites its own batch.
    async fn flush_evidence(
        &self,
        run_id: Uuid,
        state: &mut WorkingState,
    ) -> Result<(), ScoutError> {
        if state.staged_evidence.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut state.staged_evidence);
        self.store
            .put_evidence_batch(run_id, state.evidence_batches, &staged)
            .await?;
        debug!(
            run_id = %run_id,
            batch = state.evidence_batches,
            records = staged.len(),
            "Evidence batch written"
        );
        state.evidence_batches += 1;
        Ok(())
    }

    async fn finish(
        &self,
        run: &mut ResearchRun,
        state: &WorkingState,
    ) -> Result<ExecutionOutcome, ScoutError> {
        let fields = FieldStateStore::restore(&self.config.research.fields, state.fields.clone());
        let confidence = fields.overall_confidence();
        let disposition = self.config.disposition.route(confidence, state.evidence_count);
        let complete = fields.snapshot_all().values().filter(|f| f.complete).count();
        let reason = state
            .done_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "graph finished".into());
        let summary = format!(
            "Researched {complete}/{} fields with overall confidence {confidence:.2} from {} evidence records ({reason})",
            self.config.research.fields.len(),
            state.evidence_count,
        );

        run.mark_success(summary.clone(), disposition);
        self.store.update(run).await?;
        info!(
            run_id = %run.id,
            disposition = %disposition,
            confidence,
            steps = run.step_count,
            "Research run completed"
        );
        self.emit(
            run,
            EventKind::RunCompleted {
                outcome: RunOutcome::Success,
                message: Some(summary),
            },
        );
        Ok(ExecutionOutcome::Completed { disposition })
    }

    async fn pause(
        &self,
        run: &mut ResearchRun,
        state: &WorkingState,
        phase: Phase,
    ) -> Result<ExecutionOutcome, ScoutError> {
        let checkpoint = match state.to_checkpoint(phase) {
            Ok(checkpoint) => checkpoint,
            Err(err) => return self.fail(run, err).await,
        };
        run.mark_paused(checkpoint);
        run.pause_requested = false;
        self.store.update(run).await?;
        self.store.set_pause_requested(run.id, false).await?;
        info!(run_id = %run.id, phase = %phase, step_count = run.step_count, "Research run paused");
        self.emit(run, EventKind::RunPaused { phase });
        self.emit(
            run,
            EventKind::RunCompleted {
                outcome: RunOutcome::Paused,
                message: None,
            },
        );
        Ok(ExecutionOutcome::Paused { phase })
    }

    async fn cancel(&self, run: &mut ResearchRun) -> Result<ExecutionOutcome, ScoutError> {
        run.mark_cancelled();
        run.cancel_requested = false;
        run.pause_requested = false;
        self.store.update(run).await?;
        self.store.set_cancel_requested(run.id, false).await?;
        self.store.set_pause_requested(run.id, false).await?;
        info!(run_id = %run.id, step_count = run.step_count, "Research run cancelled");
        self.emit(run, EventKind::RunCancelled);
        Ok(ExecutionOutcome::Cancelled)
    }

    /// Keep a partial result from durable evidence, or fail terminally.
    async fn salvage(
        &self,
        run: &mut ResearchRun,
        steps: u32,
    ) -> Result<ExecutionOutcome, ScoutError> {
        let stalled = RunError::NonTermination { steps };
        warn!(run_id = %run.id, steps, "Research graph did not terminate, salvaging");

        let evidence = self.store.load_evidence(run.id).await?;
        let usable: Vec<_> = evidence.into_iter().filter(|e| e.is_usable()).collect();
        let required = self.config.salvage.min_evidence.max(1);
        if usable.len() < required {
            let err = RunError::InsufficientEvidence {
                found: usable.len(),
                required,
            };
            let message = format!("{stalled}; {err}");
            run.mark_error(message.clone(), false);
            self.store.update(run).await?;
            error!(run_id = %run.id, error = %message, "Salvage failed");
            self.emit(
                run,
                EventKind::RunCompleted {
                    outcome: RunOutcome::Error,
                    message: Some(message.clone()),
                },
            );
            return Ok(ExecutionOutcome::Failed {
                message,
                resumable: false,
            });
        }

        let specs = &self.config.research.fields;
        let fields = match self.store.load_conclusions(run.id).await? {
            Some(conclusions) => FieldStateStore::restore(specs, conclusions.fields),
            None => {
                let mut fields = FieldStateStore::new(specs);
                for record in &usable {
                    fields.upsert_source_at(&record.field, record.source.clone(), record.recorded_at);
                }
                fields
            }
        };
        let result = ResearchResult::from_fields(
            run.id,
            &run.subject_id,
            &fields.snapshot_all(),
            fields.overall_confidence(),
            usable.len(),
            true,
        );
        self.store.save_result(&result).await?;

        let summary = format!(
            "{stalled}; results may be partial ({} evidence records, overall confidence {:.2})",
            usable.len(),
            result.overall_confidence
        );
        run.mark_success(summary.clone(), Disposition::FullReview);
        self.store.update(run).await?;
        info!(run_id = %run.id, evidence = usable.len(), "Salvaged partial research result");
        self.emit(
            run,
            EventKind::RunCompleted {
                outcome: RunOutcome::Success,
                message: Some(summary),
            },
        );
        Ok(ExecutionOutcome::Salvaged {
            evidence: usable.len(),
        })
    }

    /// Record a failure. Resumable errors keep the last good checkpoint.
    async fn fail(
        &self,
        run: &mut ResearchRun,
        err: RunError,
    ) -> Result<ExecutionOutcome, ScoutError> {
        let message = err.to_string();
        run.mark_error(message.clone(), err.is_resumable());
        self.store.update(run).await?;
        let resumable = run.checkpoint.is_some();
        error!(run_id = %run.id, error = %message, resumable, "Research run failed");
        self.emit(
            run,
            EventKind::RunCompleted {
                outcome: RunOutcome::Error,
                message: Some(message.clone()),
            },
        );
        Ok(ExecutionOutcome::Failed { message, resumable })
    }
}
