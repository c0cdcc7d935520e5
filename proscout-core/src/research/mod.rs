//! Field research machinery.
//!
//! - [`sources`]: evidence sources and their independence groups
//! - [`validation`]: cross-source corroboration and conflict detection
//! - [`fields`]: per-run field state, re-scored as sources arrive
//! - [`planner`]: chooses the next research action under a budget

pub mod fields;
pub mod planner;
pub mod sources;
pub mod validation;

pub use fields::{CompletenessRule, FieldSpec, FieldState, FieldStateStore};
pub use planner::{
    Budget, BudgetLimit, BudgetUsage, DoneReason, PlanDecision, PlannedAction, PlanningInput,
    ResearchPlanner, Strategy,
};
pub use sources::{FieldValue, Identifier, IndependenceGroup, Source, SourceType};
pub use validation::{Conflict, ConflictSeverity, CrossValidator, ValidationReport};
