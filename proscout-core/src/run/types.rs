//! Run rows, jobs and research artifacts.

use super::checkpoint::Checkpoint;
use super::phases::Phase;
use crate::research::fields::FieldState;
use crate::research::planner::Strategy;
use crate::research::sources::{FieldValue, Source};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a research run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Success,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Error | RunStatus::Cancelled)
    }

    /// Statuses that block a new trigger for the same subject.
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running | RunStatus::Paused)
    }

    /// Legal transitions of the run state machine.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Error)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Success)
                | (Running, Error)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Error)
                | (Paused, Cancelled)
                | (Error, Running)
                | (Error, Error)
                | (Error, Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Paused => write!(f, "paused"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Error => write!(f, "error"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a job asks the orchestrator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// First dispatch of a freshly triggered run.
    Fresh,
    /// Continue from the retained checkpoint.
    Resume,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Fresh => write!(f, "fresh"),
            RunKind::Resume => write!(f, "resume"),
        }
    }
}

/// Queue message consumed by the orchestrator entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub run_id: Uuid,
    pub subject_id: String,
    pub owner_id: String,
    pub run_kind: RunKind,
}

impl Job {
    pub fn for_run(run: &ResearchRun, run_kind: RunKind) -> Self {
        Self {
            run_id: run.id,
            subject_id: run.subject_id.clone(),
            owner_id: run.owner_id.clone(),
            run_kind,
        }
    }

    pub fn key(&self) -> String {
        job_key(self.run_id)
    }
}

/// Stable deduplicating job key for a run.
pub fn job_key(run_id: Uuid) -> String {
    format!("resume-{run_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed,
}

/// One finished phase execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Where a finished subject goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    AutoApprove,
    SpotCheck,
    FullReview,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::AutoApprove => write!(f, "auto_approve"),
            Disposition::SpotCheck => write!(f, "spot_check"),
            Disposition::FullReview => write!(f, "full_review"),
        }
    }
}

/// One research attempt for one subject, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRun {
    pub id: Uuid,
    pub subject_id: String,
    pub owner_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub current_phase: Option<Phase>,
    pub step_count: u32,
    #[serde(default)]
    pub history: Vec<StepRecord>,
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub pause_requested: bool,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub cost_spent: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub disposition: Option<Disposition>,
}

impl ResearchRun {
    pub fn new(subject_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            subject_id: subject_id.into(),
            owner_id: owner_id.into(),
            status: RunStatus::Pending,
            current_phase: None,
            step_count: 0,
            history: Vec::new(),
            checkpoint: None,
            error: None,
            pause_requested: false,
            cancel_requested: false,
            cost_spent: 0.0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            summary: None,
            disposition: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn mark_running(&mut self) {
        self.status = RunStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.completed_at = None;
        self.error = None;
        self.touch();
    }

    pub fn mark_paused(&mut self, checkpoint: Checkpoint) {
        self.status = RunStatus::Paused;
        self.current_phase = Some(checkpoint.phase);
        self.checkpoint = Some(checkpoint);
        self.completed_at = None;
        self.touch();
    }

    pub fn mark_success(&mut self, summary: String, disposition: Disposition) {
        self.status = RunStatus::Success;
        self.checkpoint = None;
        self.error = None;
        self.summary = Some(summary);
        self.disposition = Some(disposition);
        self.current_phase = None;
        self.touch();
        self.completed_at = Some(self.updated_at);
    }

    /// Record a failure. A kept checkpoint leaves the run resumable; otherwise
    /// the run is finished.
    pub fn mark_error(&mut self, message: impl Into<String>, keep_checkpoint: bool) {
        self.status = RunStatus::Error;
        self.error = Some(message.into());
        if !keep_checkpoint {
            self.checkpoint = None;
        }
        self.touch();
        self.completed_at = if self.checkpoint.is_some() {
            None
        } else {
            Some(self.updated_at)
        };
    }

    pub fn mark_cancelled(&mut self) {
        self.status = RunStatus::Cancelled;
        self.checkpoint = None;
        self.current_phase = None;
        self.touch();
        self.completed_at = Some(self.updated_at);
    }

    /// Whether the row still represents work that may continue.
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal() || self.completed_at.is_none()
    }

    /// Checks the row-level invariants, returning the first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.completed_at.is_some() && !self.status.is_terminal() {
            return Err(format!("{} run has completed_at set", self.status));
        }
        if self.completed_at.is_some() && self.checkpoint.is_some() {
            return Err("completed run still holds a checkpoint".into());
        }
        if self.status == RunStatus::Paused && self.checkpoint.is_none() {
            return Err("paused run has no checkpoint".into());
        }
        if matches!(self.status, RunStatus::Success | RunStatus::Cancelled)
            && self.completed_at.is_none()
        {
            return Err(format!("{} run has no completed_at", self.status));
        }
        if self.status == RunStatus::Error
            && self.checkpoint.is_some()
            && self.completed_at.is_some()
        {
            return Err("resumable error run has completed_at set".into());
        }
        Ok(())
    }
}

/// One tool finding, stored once the phase that recorded it succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub run_id: Uuid,
    pub field: String,
    pub source: Source,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub query: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl Evidence {
    /// Evidence with a non-null value counts toward salvage.
    pub fn is_usable(&self) -> bool {
        !self.source.value.is_null()
    }
}

/// Field snapshot written by the evaluate phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conclusions {
    pub run_id: Uuid,
    pub fields: BTreeMap<String, FieldState>,
    pub overall_confidence: f64,
    pub written_at: DateTime<Utc>,
}

/// Final structured output of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchResult {
    pub run_id: Uuid,
    pub subject_id: String,
    pub values: BTreeMap<String, FieldValue>,
    pub confidences: BTreeMap<String, f64>,
    pub overall_confidence: f64,
    pub evidence_count: usize,
    /// Set when the result was salvaged from an unfinished graph.
    pub partial: bool,
    pub completed_at: DateTime<Utc>,
}

impl ResearchResult {
    pub fn from_fields(
        run_id: Uuid,
        subject_id: &str,
        fields: &BTreeMap<String, FieldState>,
        overall_confidence: f64,
        evidence_count: usize,
        partial: bool,
    ) -> Self {
        Self {
            run_id,
            subject_id: subject_id.to_string(),
            values: fields
                .iter()
                .map(|(k, v)| (k.clone(), v.value.clone()))
                .collect(),
            confidences: fields
                .iter()
                .map(|(k, v)| (k.clone(), v.confidence))
                .collect(),
            overall_confidence,
            evidence_count,
            partial,
            completed_at: Utc::now(),
        }
    }
}
