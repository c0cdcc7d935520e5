//! # Proscout Core
//!
//! Core library for Proscout, an autonomous product-research orchestrator.
//! Provides per-field confidence tracking with cross-source corroboration,
//! the budgeted research planner, the resumable checkpointed run graph,
//! operator controls, startup recovery and the queue-driven worker pool.

pub mod config;
pub mod error;
pub mod events;
pub mod persistence;
pub mod queue;
pub mod research;
pub mod run;
pub mod store;
pub mod tools;

// Re-export commonly used types at the crate root.
pub use config::{ScoutConfig, load_config};
pub use error::{ConfigError, QueueError, Result, RunError, ScoutError, StoreError, ToolError};
pub use events::{EventBus, EventKind, LifecycleEvent};
pub use queue::{FileJobQueue, InMemoryJobQueue, JobQueue};
pub use research::{FieldSpec, FieldState, FieldStateStore, FieldValue, ResearchPlanner, Source};
pub use run::{
    ExecutionOutcome, GraphConfig, Job, Orchestrator, Phase, ReconcileReport, Reconciler,
    ResearchRun, RunController, RunStatus, WorkerPool,
};
pub use store::{FileRunStore, InMemoryRunStore, RunStore};
pub use tools::{ResearchTools, ResilientTools, ScriptedTools, ToolScript};
