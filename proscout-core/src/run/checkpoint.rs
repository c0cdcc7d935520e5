//! Checkpoints: an opaque blob on the run row, decoded only by the orchestrator.

use super::phases::Phase;
use super::types::Evidence;
use crate::error::RunError;
use crate::research::fields::FieldState;
use crate::research::planner::{BudgetUsage, DoneReason, PlannedAction};
use crate::research::sources::Identifier;
use crate::tools::SubjectContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Resumption point for a run. One per run; a new write supersedes the old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The phase that runs next on resume.
    pub phase: Phase,
    pub written_at: DateTime<Utc>,
    pub blob: String,
}

/// Orchestrator-internal working state carried between phases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct WorkingState {
    pub subject: Option<SubjectContext>,
    pub fields: BTreeMap<String, FieldState>,
    pub identifiers: Vec<Identifier>,
    pub iteration: u32,
    pub cost_spent: f64,
    pub active_elapsed_ms: u64,
    pub pending_action: Option<PlannedAction>,
    pub attempted: BTreeSet<String>,
    pub evidence_count: usize,
    /// Evidence batches already written to the store; the next phase's batch number.
    pub evidence_batches: u32,
    pub done_reason: Option<DoneReason>,
    /// Evidence recorded by the running phase, written once the phase succeeds.
    #[serde(skip)]
    pub staged_evidence: Vec<Evidence>,
}

impl WorkingState {
    pub fn usage(&self) -> BudgetUsage {
        BudgetUsage {
            iterations: self.iteration,
            cost_spent: self.cost_spent,
            active_elapsed: Duration::from_millis(self.active_elapsed_ms),
        }
    }

    pub fn subject_title(&self) -> &str {
        self.subject.as_ref().map(|s| s.title.as_str()).unwrap_or("")
    }

    pub fn to_checkpoint(&self, phase: Phase) -> Result<Checkpoint, RunError> {
        let blob = serde_json::to_string(self).map_err(|e| RunError::CheckpointCorrupt {
            message: e.to_string(),
        })?;
        Ok(Checkpoint {
            phase,
            written_at: Utc::now(),
            blob,
        })
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Result<Self, RunError> {
        serde_json::from_str(&checkpoint.blob).map_err(|e| RunError::CheckpointCorrupt {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::planner::Strategy;

    #[test]
    fn test_checkpoint_restores_working_state() {
        let mut state = WorkingState {
            iteration: 2,
            cost_spent: 0.06,
            ..Default::default()
        };
        state.attempted.insert("brand|marketplace_search|shoe".into());
        state.pending_action = Some(PlannedAction {
            field: "brand".into(),
            strategy: Strategy::MarketplaceSearch,
            query: "shoe".into(),
            estimated_cost: 0.05,
        });

        let checkpoint = state.to_checkpoint(Phase::Execute).unwrap();
        assert_eq!(checkpoint.phase, Phase::Execute);
        let restored = WorkingState::from_checkpoint(&checkpoint).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_staged_evidence_never_checkpointed() {
        let mut state = WorkingState {
            evidence_batches: 3,
            ..Default::default()
        };
        state.staged_evidence.push(Evidence {
            run_id: uuid::Uuid::new_v4(),
            field: "brand".into(),
            source: crate::research::sources::Source::new("ocr", "Nike", 0.5),
            strategy: None,
            query: None,
            recorded_at: Utc::now(),
        });

        let restored = WorkingState::from_checkpoint(&state.to_checkpoint(Phase::Plan).unwrap())
            .unwrap();
        assert!(restored.staged_evidence.is_empty());
        assert_eq!(restored.evidence_batches, 3);
    }

    #[test]
    fn test_corrupt_blob_is_classified() {
        let checkpoint = Checkpoint {
            phase: Phase::Plan,
            written_at: Utc::now(),
            blob: "not json".into(),
        };
        let err = WorkingState::from_checkpoint(&checkpoint).unwrap_err();
        assert!(matches!(err, RunError::CheckpointCorrupt { .. }));
        assert!(!err.is_resumable());
    }

    #[test]
    fn test_empty_blob_decodes_to_fresh_state() {
        let checkpoint = Checkpoint {
            phase: Phase::LoadContext,
            written_at: Utc::now(),
            blob: "{}".into(),
        };
        let state = WorkingState::from_checkpoint(&checkpoint).unwrap();
        assert_eq!(state, WorkingState::default());
    }
}
