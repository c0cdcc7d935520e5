//! Lifecycle events for observers of research runs.

use crate::run::phases::Phase;
use crate::run::types::ResearchRun;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Error,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PhaseStarted {
        phase: Phase,
        step: u32,
    },
    PhaseCompleted {
        phase: Phase,
        step: u32,
        outcome: PhaseOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RunCompleted {
        outcome: RunOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    RunPaused {
        phase: Phase,
    },
    RunResumed {
        step_count: u32,
    },
    RunCancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub run_id: Uuid,
    pub subject_id: String,
    pub owner_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl LifecycleEvent {
    pub fn for_run(run: &ResearchRun, kind: EventKind) -> Self {
        Self {
            run_id: run.id,
            subject_id: run.subject_id.clone(),
            owner_id: run.owner_id.clone(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Broadcast fan-out of lifecycle events. Publishing never blocks; slow
/// subscribers lag and lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        tracing::trace!(run_id = %event.run_id, kind = ?event.kind, "Lifecycle event");
        self.tx.send(event).unwrap_or(0)
    }
}
