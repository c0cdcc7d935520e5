//! Research graph phases.
//!
//! The phase list is configuration ([`GraphConfig`]); each phase is a plain
//! async function from `(context, working state)` to a new working state plus
//! a transition. Phases never touch the run row; the orchestrator owns it.

use super::checkpoint::WorkingState;
use super::types::{Conclusions, Evidence, ResearchResult};
use crate::config::ResearchConfig;
use crate::error::{ConfigError, RunError, ToolError};
use crate::research::fields::FieldStateStore;
use crate::research::planner::{PlanDecision, PlannedAction, PlanningInput, ResearchPlanner, Strategy};
use crate::research::sources::Identifier;
use crate::store::RunStore;
use crate::tools::{
    ComparablesRequest, ExtractRequest, Finding, IdentifierRequest, LoadSubjectRequest,
    MarketplaceRequest, ResearchTools, WebSearchRequest,
};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    LoadContext,
    Extract,
    Identify,
    Plan,
    Execute,
    Evaluate,
    Persist,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::LoadContext => "load_context",
            Phase::Extract => "extract",
            Phase::Identify => "identify",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Evaluate => "evaluate",
            Phase::Persist => "persist",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered phase list plus the step ceilings that bound it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    pub phases: Vec<Phase>,
    /// Hard ceiling on phases executed in one attempt.
    pub steps_per_attempt: u32,
    /// Attempts allowed before resume is refused.
    pub max_retries: u32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self::field_driven()
    }
}

impl GraphConfig {
    /// load_context → extract → plan → execute → evaluate → persist
    pub fn field_driven() -> Self {
        Self {
            phases: vec![
                Phase::LoadContext,
                Phase::Extract,
                Phase::Plan,
                Phase::Execute,
                Phase::Evaluate,
                Phase::Persist,
            ],
            steps_per_attempt: 25,
            max_retries: 3,
        }
    }

    /// Like `field_driven`, with exact-identifier lookups right after extraction.
    pub fn identifier_first() -> Self {
        Self {
            phases: vec![
                Phase::LoadContext,
                Phase::Extract,
                Phase::Identify,
                Phase::Plan,
                Phase::Execute,
                Phase::Evaluate,
                Phase::Persist,
            ],
            ..Self::field_driven()
        }
    }

    /// Total steps after which a run can no longer be resumed.
    pub fn retry_ceiling(&self) -> u32 {
        self.max_retries.saturating_mul(self.steps_per_attempt)
    }

    pub fn index_of(&self, phase: Phase) -> Option<usize> {
        self.phases.iter().position(|p| *p == phase)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });

        if self.steps_per_attempt == 0 || self.max_retries == 0 {
            return invalid("graph ceilings must be greater than zero".into());
        }
        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !seen.insert(*phase) {
                return invalid(format!("phase '{phase}' appears more than once"));
            }
        }
        if self.phases.first() != Some(&Phase::LoadContext) {
            return invalid("graph must start with load_context".into());
        }
        if self.phases.last() != Some(&Phase::Persist) {
            return invalid("graph must end with persist".into());
        }
        match (
            self.index_of(Phase::Plan),
            self.index_of(Phase::Execute),
            self.index_of(Phase::Evaluate),
        ) {
            (Some(p), Some(x), Some(e)) if x == p + 1 && e == x + 1 => Ok(()),
            _ => invalid("graph must contain plan -> execute -> evaluate in order".into()),
        }
    }
}

/// Where the sequencer goes after a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    /// The next phase in the list; finishing if this was the last.
    Next,
    Jump(Phase),
}

#[derive(Debug)]
pub(crate) struct PhaseStep {
    pub state: WorkingState,
    pub next: Transition,
}

impl PhaseStep {
    fn next(state: WorkingState) -> Self {
        Self {
            state,
            next: Transition::Next,
        }
    }

    fn jump(state: WorkingState, phase: Phase) -> Self {
        Self {
            state,
            next: Transition::Jump(phase),
        }
    }
}

/// Everything a phase may use besides its working state.
pub(crate) struct PhaseContext<'a> {
    pub run_id: Uuid,
    pub subject_id: String,
    pub owner_id: String,
    pub tools: &'a dyn ResearchTools,
    pub store: &'a dyn RunStore,
    pub planner: &'a ResearchPlanner,
    pub research: &'a ResearchConfig,
}

impl PhaseContext<'_> {
    fn field_names(&self) -> Vec<String> {
        self.research.fields.iter().map(|f| f.name.clone()).collect()
    }

    fn fields(&self, state: &WorkingState) -> FieldStateStore {
        FieldStateStore::restore(&self.research.fields, state.fields.clone())
    }
}

fn tool_failure(phase: Phase, err: ToolError) -> RunError {
    RunError::PhaseFailed {
        phase: phase.to_string(),
        message: err.to_string(),
    }
}

pub(crate) async fn run_phase(
    phase: Phase,
    ctx: &PhaseContext<'_>,
    state: WorkingState,
) -> Result<PhaseStep, RunError> {
    match phase {
        Phase::LoadContext => load_context(ctx, state).await,
        Phase::Extract => extract(ctx, state).await,
        Phase::Identify => identify(ctx, state).await,
        Phase::Plan => plan(ctx, state),
        Phase::Execute => execute(ctx, state).await,
        Phase::Evaluate => evaluate(ctx, state).await,
        Phase::Persist => persist(ctx, state).await,
    }
}

async fn load_context(
    ctx: &PhaseContext<'_>,
    mut state: WorkingState,
) -> Result<PhaseStep, RunError> {
    let out = ctx
        .tools
        .load_subject(&LoadSubjectRequest {
            subject_id: ctx.subject_id.clone(),
        })
        .await
        .map_err(|e| tool_failure(Phase::LoadContext, e))?;
    state.cost_spent += out.cost;

    let subject = out.value;
    if subject.owner_id != ctx.owner_id {
        warn!(
            run_id = %ctx.run_id,
            subject_id = %subject.subject_id,
            "Subject does not belong to the requesting owner"
        );
        return Err(RunError::Unauthorized {
            subject_id: subject.subject_id,
            owner_id: ctx.owner_id.clone(),
        });
    }

    if state.fields.is_empty() {
        state.fields = FieldStateStore::new(&ctx.research.fields).snapshot_all();
    }
    state.subject = Some(subject);
    Ok(PhaseStep::next(state))
}

async fn extract(ctx: &PhaseContext<'_>, mut state: WorkingState) -> Result<PhaseStep, RunError> {
    let Some(subject) = state.subject.clone() else {
        return Err(RunError::PhaseFailed {
            phase: Phase::Extract.to_string(),
            message: "subject context not loaded".into(),
        });
    };
    let out = ctx
        .tools
        .extract_attributes(&ExtractRequest {
            subject,
            fields: ctx.field_names(),
        })
        .await
        .map_err(|e| tool_failure(Phase::Extract, e))?;
    state.cost_spent += out.cost;

    for id in out.value.identifiers {
        if !state.identifiers.contains(&id) {
            state.identifiers.push(id);
        }
    }
    record_findings(ctx, &mut state, &out.value.findings, None);
    debug!(
        run_id = %ctx.run_id,
        findings = out.value.findings.len(),
        identifiers = state.identifiers.len(),
        "Extraction merged"
    );
    Ok(PhaseStep::next(state))
}

async fn identify(ctx: &PhaseContext<'_>, mut state: WorkingState) -> Result<PhaseStep, RunError> {
    let identifiers = state.identifiers.clone();
    for identifier in identifiers {
        let action = PlannedAction {
            field: String::new(),
            strategy: Strategy::IdentifierLookup,
            query: identifier.value.clone(),
            estimated_cost: Strategy::IdentifierLookup.estimated_cost(),
        };
        let findings = lookup(ctx, &mut state, &identifier, Phase::Identify).await?;
        record_findings(ctx, &mut state, &findings, Some(&action));

        // Every field has now seen this identifier.
        for spec in &ctx.research.fields {
            let key = PlannedAction {
                field: spec.name.clone(),
                ..action.clone()
            }
            .key();
            state.attempted.insert(key);
        }
    }
    Ok(PhaseStep::next(state))
}

fn plan(ctx: &PhaseContext<'_>, mut state: WorkingState) -> Result<PhaseStep, RunError> {
    let fields = ctx.fields(&state);
    let decision = ctx.planner.plan(&PlanningInput {
        fields: &fields,
        identifiers: &state.identifiers,
        subject_title: state.subject_title(),
        attempted: &state.attempted,
        usage: state.usage(),
    });
    match decision {
        PlanDecision::Act(action) => {
            state.pending_action = Some(action);
            state.done_reason = None;
            Ok(PhaseStep::next(state))
        }
        PlanDecision::Done(reason) => {
            info!(run_id = %ctx.run_id, reason = %reason, "Planner finished");
            state.pending_action = None;
            state.done_reason = Some(reason);
            Ok(PhaseStep::jump(state, Phase::Persist))
        }
    }
}

async fn execute(ctx: &PhaseContext<'_>, mut state: WorkingState) -> Result<PhaseStep, RunError> {
    let Some(action) = state.pending_action.take() else {
        return Ok(PhaseStep::next(state));
    };
    state.attempted.insert(action.key());
    state.iteration += 1;

    let findings = match action.strategy {
        Strategy::IdentifierLookup => {
            let identifier = state
                .identifiers
                .iter()
                .find(|id| id.value == action.query)
                .cloned()
                .unwrap_or_else(|| Identifier::new("unknown", action.query.clone()));
            lookup(ctx, &mut state, &identifier, Phase::Execute).await?
        }
        Strategy::MarketplaceSearch => marketplace_fan_out(ctx, &mut state, &action).await?,
        Strategy::PriceComparables => {
            let out = ctx
                .tools
                .fetch_comparables(&ComparablesRequest {
                    query: action.query.clone(),
                    field: action.field.clone(),
                })
                .await
                .map_err(|e| tool_failure(Phase::Execute, e))?;
            state.cost_spent += out.cost;
            out.value
        }
        Strategy::DescriptiveSearch => {
            let out = ctx
                .tools
                .web_search(&WebSearchRequest {
                    query: action.query.clone(),
                    fields: vec![action.field.clone()],
                })
                .await
                .map_err(|e| tool_failure(Phase::Execute, e))?;
            state.cost_spent += out.cost;
            out.value
        }
    };

    info!(
        run_id = %ctx.run_id,
        field = %action.field,
        strategy = %action.strategy,
        findings = findings.len(),
        iteration = state.iteration,
        "Research action executed"
    );
    record_findings(ctx, &mut state, &findings, Some(&action));
    Ok(PhaseStep::next(state))
}

async fn evaluate(ctx: &PhaseContext<'_>, state: WorkingState) -> Result<PhaseStep, RunError> {
    let fields = ctx.fields(&state);
    let conclusions = Conclusions {
        run_id: ctx.run_id,
        fields: fields.snapshot_all(),
        overall_confidence: fields.overall_confidence(),
        written_at: Utc::now(),
    };
    ctx.store
        .save_conclusions(&conclusions)
        .await
        .map_err(|e| RunError::PhaseFailed {
            phase: Phase::Evaluate.to_string(),
            message: e.to_string(),
        })?;
    Ok(PhaseStep::jump(state, Phase::Plan))
}

async fn persist(ctx: &PhaseContext<'_>, state: WorkingState) -> Result<PhaseStep, RunError> {
    let fields = ctx.fields(&state);
    let result = ResearchResult::from_fields(
        ctx.run_id,
        &ctx.subject_id,
        &fields.snapshot_all(),
        fields.overall_confidence(),
        state.evidence_count,
        false,
    );
    ctx.store
        .save_result(&result)
        .await
        .map_err(|e| RunError::PhaseFailed {
            phase: Phase::Persist.to_string(),
            message: e.to_string(),
        })?;
    Ok(PhaseStep::next(state))
}

async fn lookup(
    ctx: &PhaseContext<'_>,
    state: &mut WorkingState,
    identifier: &Identifier,
    phase: Phase,
) -> Result<Vec<Finding>, RunError> {
    let out = ctx
        .tools
        .lookup_identifier(&IdentifierRequest {
            identifier: identifier.clone(),
            fields: ctx.field_names(),
        })
        .await
        .map_err(|e| tool_failure(phase, e))?;
    state.cost_spent += out.cost;
    Ok(out.value)
}

/// Query every configured marketplace concurrently and wait for all of them.
/// Individual failures are tolerated as long as one marketplace answers.
async fn marketplace_fan_out(
    ctx: &PhaseContext<'_>,
    state: &mut WorkingState,
    action: &PlannedAction,
) -> Result<Vec<Finding>, RunError> {
    let requests: Vec<MarketplaceRequest> = ctx
        .research
        .marketplaces
        .iter()
        .map(|marketplace| MarketplaceRequest {
            marketplace: marketplace.clone(),
            query: action.query.clone(),
            fields: vec![action.field.clone()],
        })
        .collect();
    if requests.is_empty() {
        return Ok(Vec::new());
    }

    let results = join_all(requests.iter().map(|r| ctx.tools.search_marketplace(r))).await;

    let mut findings = Vec::new();
    let mut first_error = None;
    let mut answered = 0usize;
    for (request, result) in requests.iter().zip(results) {
        match result {
            Ok(out) => {
                answered += 1;
                state.cost_spent += out.cost;
                findings.extend(out.value);
            }
            Err(e) => {
                warn!(
                    run_id = %ctx.run_id,
                    marketplace = %request.marketplace,
                    error = %e,
                    "Marketplace query failed"
                );
                first_error.get_or_insert(e);
            }
        }
    }
    match (answered, first_error) {
        (0, Some(e)) => Err(tool_failure(Phase::Execute, e)),
        _ => Ok(findings),
    }
}

/// Merge findings into the field state and stage them as evidence.
///
/// Staged evidence reaches the store only after the whole phase succeeds.
fn record_findings(
    ctx: &PhaseContext<'_>,
    state: &mut WorkingState,
    findings: &[Finding],
    action: Option<&PlannedAction>,
) {
    if findings.is_empty() {
        return;
    }
    let mut fields = ctx.fields(state);
    let now = Utc::now();
    for finding in findings {
        fields.upsert_source_at(&finding.field, finding.source.clone(), now);
        state.staged_evidence.push(Evidence {
            run_id: ctx.run_id,
            field: finding.field.clone(),
            source: finding.source.clone(),
            strategy: action.map(|a| a.strategy),
            query: action.map(|a| a.query.clone()),
            recorded_at: now,
        });
    }
    state.evidence_count += findings.len();
    state.fields = fields.snapshot_all();
}
