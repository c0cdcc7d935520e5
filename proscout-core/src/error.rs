//! Error types for the Proscout research core.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering tool calls, run lifecycle, storage, queueing and configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Top-level error type for the Proscout core library.
#[derive(Debug, thiserror::Error)]
pub enum ScoutError {
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Classification of a failed external tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    RateLimit,
    Validation,
    Unknown,
}

impl FailureKind {
    /// Only validation failures are final; everything else may be retried.
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::Validation)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Network => write!(f, "network"),
            FailureKind::RateLimit => write!(f, "rate_limit"),
            FailureKind::Validation => write!(f, "validation"),
            FailureKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Errors from external research tool calls.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum ToolError {
    #[error("Tool '{operation}' failed ({kind}): {message}")]
    Failed {
        operation: String,
        kind: FailureKind,
        message: String,
    },

    #[error("Tool '{operation}' gave up after {attempts} attempts: {message}")]
    Exhausted {
        operation: String,
        attempts: u32,
        message: String,
    },

    #[error("Circuit open for tool '{operation}'")]
    CircuitOpen { operation: String },
}

impl ToolError {
    pub fn network(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failed(operation, FailureKind::Network, message)
    }

    pub fn rate_limited(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failed(operation, FailureKind::RateLimit, message)
    }

    pub fn validation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failed(operation, FailureKind::Validation, message)
    }

    pub fn unknown(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failed(operation, FailureKind::Unknown, message)
    }

    pub fn failed(
        operation: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        ToolError::Failed {
            operation: operation.into(),
            kind,
            message: message.into(),
        }
    }

    /// The failure classification, if this is a raw classified failure.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            ToolError::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether the caller's retry wrapper may try again.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_some_and(FailureKind::is_retryable)
    }
}

/// Errors from the run lifecycle: orchestration, control and recovery.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: Uuid },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Retry limit reached: {steps} steps recorded, ceiling is {ceiling}")]
    RetryLimitExceeded { steps: u32, ceiling: u32 },

    #[error("Subject {subject_id} does not belong to owner {owner_id}")]
    Unauthorized { subject_id: String, owner_id: String },

    #[error("Research graph did not terminate after {steps} steps")]
    NonTermination { steps: u32 },

    #[error("Subject {subject_id} already has an active run {run_id}")]
    AlreadyActive { subject_id: String, run_id: Uuid },

    #[error("A job is already queued under key {key}")]
    JobAlreadyQueued { key: String },

    #[error("Phase '{phase}' failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("Checkpoint could not be decoded: {message}")]
    CheckpointCorrupt { message: String },

    #[error("Insufficient evidence to salvage: found {found}, need {required}")]
    InsufficientEvidence { found: usize, required: usize },
}

impl RunError {
    /// Whether a run that failed with this error keeps its checkpoint for resume.
    pub fn is_resumable(&self) -> bool {
        !matches!(
            self,
            RunError::Unauthorized { .. }
                | RunError::RetryLimitExceeded { .. }
                | RunError::CheckpointCorrupt { .. }
                | RunError::InsufficientEvidence { .. }
        )
    }
}

/// Errors from durable run storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Run already exists: {run_id}")]
    Duplicate { run_id: Uuid },

    #[error("Run not found in store: {run_id}")]
    Missing { run_id: Uuid },

    #[error("Store persistence error: {message}")]
    Persistence { message: String },
}

/// Errors from the job queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job not found in queue: {key}")]
    NotFound { key: String },

    #[error("Queue persistence error: {message}")]
    Persistence { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// A type alias for results using the top-level `ScoutError`.
pub type Result<T> = std::result::Result<T, ScoutError>;
