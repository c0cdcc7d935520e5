//! Research runs: the state machine, its orchestrator, operator controls,
//! startup recovery and the worker pool that ties them to the job queue.

pub mod checkpoint;
pub mod control;
pub mod orchestrator;
pub mod phases;
pub mod recovery;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod fixtures;

pub use checkpoint::Checkpoint;
pub use control::{RunController, can_resume};
pub use orchestrator::{ExecutionOutcome, Orchestrator};
pub use phases::{GraphConfig, Phase};
pub use recovery::{ReconcileReport, Reconciler};
pub use types::{
    Conclusions, Disposition, Evidence, Job, ResearchResult, ResearchRun, RunKind, RunStatus,
    StepOutcome, StepRecord, job_key,
};
pub use worker::WorkerPool;
