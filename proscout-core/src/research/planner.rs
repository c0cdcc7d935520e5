//! Research planning.
//!
//! Given the current field states and the budget consumed so far, the planner
//! picks the single next research action or declares the run done. It never
//! performs I/O; the orchestrator executes whatever it returns.

use super::fields::FieldStateStore;
use super::sources::{FieldValue, Identifier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Limits on how much research one run may do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub max_iterations: u32,
    /// Maximum tool spend, in the tools' cost unit. `0.0` disables the limit.
    pub max_cost: f64,
    /// Maximum active research time. `0` disables the limit.
    pub max_wall_clock_secs: u64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_iterations: 6,
            max_cost: 1.0,
            max_wall_clock_secs: 300,
        }
    }
}

impl Budget {
    pub fn max_wall_clock(&self) -> Duration {
        Duration::from_secs(self.max_wall_clock_secs)
    }

    /// The first limit `usage` has reached, if any.
    pub fn exhausted_by(&self, usage: &BudgetUsage) -> Option<BudgetLimit> {
        if usage.iterations >= self.max_iterations {
            return Some(BudgetLimit::Iterations);
        }
        if self.max_cost > 0.0 && usage.cost_spent >= self.max_cost {
            return Some(BudgetLimit::Cost);
        }
        if self.max_wall_clock_secs > 0 && usage.active_elapsed >= self.max_wall_clock() {
            return Some(BudgetLimit::WallClock);
        }
        None
    }

    fn affords(&self, usage: &BudgetUsage, estimated_cost: f64) -> bool {
        self.max_cost <= 0.0 || usage.cost_spent + estimated_cost <= self.max_cost
    }
}

/// Budget consumed so far.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BudgetUsage {
    pub iterations: u32,
    pub cost_spent: f64,
    /// Time spent inside phases; pauses do not count.
    pub active_elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimit {
    Iterations,
    Cost,
    WallClock,
}

impl fmt::Display for BudgetLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetLimit::Iterations => write!(f, "iteration limit"),
            BudgetLimit::Cost => write!(f, "cost limit"),
            BudgetLimit::WallClock => write!(f, "wall-clock limit"),
        }
    }
}

/// How a field gets researched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Exact lookup of a known identifier in a catalog.
    IdentifierLookup,
    /// Keyword search across the configured marketplaces.
    MarketplaceSearch,
    /// Comparable-sales retrieval.
    PriceComparables,
    /// Free-text web search.
    DescriptiveSearch,
}

impl Strategy {
    pub fn default_order() -> Vec<Strategy> {
        vec![
            Strategy::IdentifierLookup,
            Strategy::MarketplaceSearch,
            Strategy::DescriptiveSearch,
        ]
    }

    pub fn estimated_cost(self) -> f64 {
        match self {
            Strategy::IdentifierLookup => 0.01,
            Strategy::MarketplaceSearch => 0.05,
            Strategy::PriceComparables => 0.03,
            Strategy::DescriptiveSearch => 0.02,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::IdentifierLookup => write!(f, "identifier_lookup"),
            Strategy::MarketplaceSearch => write!(f, "marketplace_search"),
            Strategy::PriceComparables => write!(f, "price_comparables"),
            Strategy::DescriptiveSearch => write!(f, "descriptive_search"),
        }
    }
}

/// One research action for the orchestrator to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub field: String,
    pub strategy: Strategy,
    pub query: String,
    pub estimated_cost: f64,
}

impl PlannedAction {
    /// Identity used to avoid re-issuing the same action.
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.field, self.strategy, self.query.to_lowercase())
    }
}

/// Why the planner stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "limit")]
pub enum DoneReason {
    RequiredFieldsComplete,
    BudgetExhausted(BudgetLimit),
    NothingLeftToTry,
}

impl fmt::Display for DoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoneReason::RequiredFieldsComplete => write!(f, "all required fields complete"),
            DoneReason::BudgetExhausted(limit) => write!(f, "budget exhausted ({limit})"),
            DoneReason::NothingLeftToTry => write!(f, "no untried research actions left"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    Act(PlannedAction),
    Done(DoneReason),
}

/// Everything the planner looks at.
#[derive(Debug, Clone, Copy)]
pub struct PlanningInput<'a> {
    pub fields: &'a FieldStateStore,
    pub identifiers: &'a [Identifier],
    /// Free-text description of the subject, used to seed queries.
    pub subject_title: &'a str,
    /// Keys of actions already executed in this run.
    pub attempted: &'a BTreeSet<String>,
    pub usage: BudgetUsage,
}

#[derive(Debug, Clone, Default)]
pub struct ResearchPlanner {
    budget: Budget,
}

impl ResearchPlanner {
    pub fn new(budget: Budget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    /// Choose the next action, or declare done.
    pub fn plan(&self, input: &PlanningInput<'_>) -> PlanDecision {
        if input.fields.required_complete() {
            return PlanDecision::Done(DoneReason::RequiredFieldsComplete);
        }
        if let Some(limit) = self.budget.exhausted_by(&input.usage) {
            return PlanDecision::Done(DoneReason::BudgetExhausted(limit));
        }

        let mut skipped_for_cost = false;
        for field in self.ranked_incomplete(input.fields) {
            for action in self.candidates(&field, input) {
                if input.attempted.contains(&action.key()) {
                    continue;
                }
                if !self.budget.affords(&input.usage, action.estimated_cost) {
                    skipped_for_cost = true;
                    continue;
                }
                tracing::debug!(
                    field = %action.field,
                    strategy = %action.strategy,
                    query = %action.query,
                    "Planned research action"
                );
                return PlanDecision::Act(action);
            }
        }

        if skipped_for_cost {
            PlanDecision::Done(DoneReason::BudgetExhausted(BudgetLimit::Cost))
        } else {
            PlanDecision::Done(DoneReason::NothingLeftToTry)
        }
    }

    /// Incomplete fields ordered by `weight × (1 − confidence)`, highest first.
    pub fn ranked_incomplete(&self, fields: &FieldStateStore) -> Vec<String> {
        let mut ranked: Vec<(f64, String)> = fields
            .specs()
            .filter_map(|spec| {
                let state = fields.get(&spec.name)?;
                if state.complete {
                    return None;
                }
                Some((spec.weight * (1.0 - state.confidence), spec.name.clone()))
            })
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        ranked.into_iter().map(|(_, name)| name).collect()
    }

    fn candidates(&self, field: &str, input: &PlanningInput<'_>) -> Vec<PlannedAction> {
        let Some(spec) = input.fields.spec(field) else {
            return Vec::new();
        };
        let descriptor = descriptor(field, input);
        let mut actions = Vec::new();

        // Exact identifiers beat keyword search whenever we have one.
        let mut strategies = spec.strategies.clone();
        if !input.identifiers.is_empty() {
            if let Some(pos) = strategies
                .iter()
                .position(|s| *s == Strategy::IdentifierLookup)
            {
                let lookup = strategies.remove(pos);
                strategies.insert(0, lookup);
            }
        }

        for strategy in strategies {
            match strategy {
                Strategy::IdentifierLookup => {
                    for id in input.identifiers {
                        actions.push(action(field, strategy, id.value.clone()));
                    }
                }
                Strategy::MarketplaceSearch | Strategy::PriceComparables => {
                    if !descriptor.is_empty() {
                        actions.push(action(field, strategy, descriptor.clone()));
                    }
                }
                Strategy::DescriptiveSearch => {
                    let query = if descriptor.is_empty() {
                        field.to_string()
                    } else {
                        format!("{descriptor} {field}")
                    };
                    actions.push(action(field, strategy, query));
                }
            }
        }
        actions
    }
}

fn action(field: &str, strategy: Strategy, query: String) -> PlannedAction {
    PlannedAction {
        field: field.to_string(),
        strategy,
        estimated_cost: strategy.estimated_cost(),
        query,
    }
}

/// Subject title plus textual values already established for other fields.
fn descriptor(target: &str, input: &PlanningInput<'_>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let title = input.subject_title.split_whitespace().collect::<Vec<_>>().join(" ");
    if !title.is_empty() {
        parts.push(title);
    }

    let mut known: Vec<(f64, &str, String)> = input
        .fields
        .specs()
        .filter(|spec| spec.name != target)
        .filter_map(|spec| {
            let state = input.fields.get(&spec.name)?;
            if !state.complete {
                return None;
            }
            match &state.value {
                FieldValue::Text(text) => Some((spec.weight, spec.name.as_str(), text.trim().to_string())),
                _ => None,
            }
        })
        .collect();
    known.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    for (_, _, value) in known {
        let joined = parts.join(" ").to_lowercase();
        if !value.is_empty() && !joined.contains(&value.to_lowercase()) {
            parts.push(value);
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::fields::FieldSpec;
    use crate::research::sources::Source;

    fn store() -> FieldStateStore {
        FieldStateStore::new(&[
            FieldSpec::new("brand").with_weight(1.0),
            FieldSpec::new("model").with_weight(0.9),
            FieldSpec::new("price")
                .with_weight(0.5)
                .with_strategies(vec![Strategy::PriceComparables]),
            FieldSpec::new("color").with_weight(0.1).optional(),
        ])
    }

    fn input<'a>(
        fields: &'a FieldStateStore,
        identifiers: &'a [Identifier],
        attempted: &'a BTreeSet<String>,
        usage: BudgetUsage,
    ) -> PlanningInput<'a> {
        PlanningInput {
            fields,
            identifiers,
            subject_title: "running shoe",
            attempted,
            usage,
        }
    }

    #[test]
    fn test_ranks_by_weight_and_confidence() {
        let mut fields = store();
        fields.upsert_source("brand", Source::new("vision_model", "Nike", 0.9));
        let ranked = ResearchPlanner::default().ranked_incomplete(&fields);
        // brand: 1.0 * (1 - 0.72) = 0.28, model: 0.9, price: 0.5, color: 0.1
        assert_eq!(ranked, vec!["model", "price", "brand", "color"]);
    }

    #[test]
    fn test_prefers_identifier_lookup() {
        let fields = store();
        let ids = vec![Identifier::new("upc", "0885178123456")];
        let attempted = BTreeSet::new();
        let planner = ResearchPlanner::default();
        let decision = planner.plan(&input(&fields, &ids, &attempted, BudgetUsage::default()));
        let PlanDecision::Act(action) = decision else {
            panic!("expected an action");
        };
        assert_eq!(action.field, "brand");
        assert_eq!(action.strategy, Strategy::IdentifierLookup);
        assert_eq!(action.query, "0885178123456");
    }

    #[test]
    fn test_keyword_search_without_identifier() {
        let fields = store();
        let attempted = BTreeSet::new();
        let decision =
            ResearchPlanner::default().plan(&input(&fields, &[], &attempted, BudgetUsage::default()));
        let PlanDecision::Act(action) = decision else {
            panic!("expected an action");
        };
        assert_eq!(action.strategy, Strategy::MarketplaceSearch);
        assert_eq!(action.query, "running shoe");
    }

    #[test]
    fn test_never_repeats_an_action() {
        let fields = store();
        let mut attempted = BTreeSet::new();
        let planner = ResearchPlanner::new(Budget {
            max_iterations: 100,
            max_cost: 0.0,
            max_wall_clock_secs: 0,
        });
        let mut seen = Vec::new();
        loop {
            match planner.plan(&input(&fields, &[], &attempted, BudgetUsage::default())) {
                PlanDecision::Act(action) => {
                    assert!(attempted.insert(action.key()), "repeated {action:?}");
                    seen.push(action);
                }
                PlanDecision::Done(reason) => {
                    assert_eq!(reason, DoneReason::NothingLeftToTry);
                    break;
                }
            }
        }
        assert!(!seen.is_empty());
        assert!(seen
            .iter()
            .any(|a| a.field == "price" && a.strategy == Strategy::PriceComparables));
    }

    #[test]
    fn test_done_when_required_complete() {
        let mut fields = store();
        for name in ["brand", "model", "price"] {
            fields.upsert_source(name, Source::new("upc_database", "x", 0.9));
            fields.upsert_source(name, Source::new("web_search", "x", 0.9));
        }
        let attempted = BTreeSet::new();
        let decision =
            ResearchPlanner::default().plan(&input(&fields, &[], &attempted, BudgetUsage::default()));
        assert_eq!(decision, PlanDecision::Done(DoneReason::RequiredFieldsComplete));
    }

    #[test]
    fn test_done_when_budget_exhausted() {
        let fields = store();
        let attempted = BTreeSet::new();
        let planner = ResearchPlanner::new(Budget {
            max_iterations: 3,
            max_cost: 1.0,
            max_wall_clock_secs: 60,
        });

        let usage = BudgetUsage {
            iterations: 3,
            ..Default::default()
        };
        assert_eq!(
            planner.plan(&input(&fields, &[], &attempted, usage)),
            PlanDecision::Done(DoneReason::BudgetExhausted(BudgetLimit::Iterations))
        );

        let usage = BudgetUsage {
            active_elapsed: Duration::from_secs(61),
            ..Default::default()
        };
        assert_eq!(
            planner.plan(&input(&fields, &[], &attempted, usage)),
            PlanDecision::Done(DoneReason::BudgetExhausted(BudgetLimit::WallClock))
        );

        let usage = BudgetUsage {
            cost_spent: 0.99,
            ..Default::default()
        };
        assert_eq!(
            planner.plan(&input(&fields, &[], &attempted, usage)),
            PlanDecision::Done(DoneReason::BudgetExhausted(BudgetLimit::Cost))
        );
    }

    #[test]
    fn test_descriptor_includes_established_values() {
        let mut fields = store();
        fields.upsert_source("brand", Source::new("upc_database", "Nike", 0.9));
        fields.upsert_source("brand", Source::new("web_search", "Nike", 0.9));
        let attempted = BTreeSet::new();
        let PlanDecision::Act(action) =
            ResearchPlanner::default().plan(&input(&fields, &[], &attempted, BudgetUsage::default()))
        else {
            panic!("expected an action");
        };
        assert_eq!(action.field, "model");
        assert_eq!(action.query, "running shoe Nike");
    }
}
