//! Per-run field state.
//!
//! A `FieldStateStore` tracks the canonical value, confidence and source list of
//! every researched field. Sources are only ever appended; each append re-runs
//! cross-validation for that field. Persisting the map is the orchestrator's job.

use super::planner::Strategy;
use super::sources::{FieldValue, Source};
use super::validation::{values_agree, Conflict, CrossValidator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field-local predicate deciding when a field needs no more research.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CompletenessRule {
    /// At least `count` agreeing sources with a prior of `min_confidence` or more.
    HighConfidenceSources { min_confidence: f64, count: usize },
    /// Corroborated confidence reaches `threshold`.
    MinConfidence { threshold: f64 },
    /// At least `groups` independence groups back the canonical value.
    MinGroups { groups: usize },
    /// Any non-null value.
    AnyValue,
}

impl Default for CompletenessRule {
    fn default() -> Self {
        CompletenessRule::MinConfidence { threshold: 0.75 }
    }
}

impl CompletenessRule {
    pub fn is_satisfied(&self, state: &FieldState) -> bool {
        if state.value.is_null() {
            return false;
        }
        match self {
            CompletenessRule::HighConfidenceSources {
                min_confidence,
                count,
            } => {
                state
                    .sources
                    .iter()
                    .filter(|s| s.confidence >= *min_confidence)
                    .filter(|s| values_agree(s.comparable(), &state.value))
                    .count()
                    >= *count
            }
            CompletenessRule::MinConfidence { threshold } => state.confidence >= *threshold,
            CompletenessRule::MinGroups { groups } => state.supporting_groups >= *groups,
            CompletenessRule::AnyValue => true,
        }
    }
}

/// Declares a field to research.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Importance weight used for planning priority.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Whether the run can finish while this field is still incomplete.
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub completeness: CompletenessRule,
    /// Strategies the planner may use for this field, in preference order.
    #[serde(default = "Strategy::default_order")]
    pub strategies: Vec<Strategy>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: default_weight(),
            required: default_required(),
            completeness: CompletenessRule::default(),
            strategies: Strategy::default_order(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_rule(mut self, rule: CompletenessRule) -> Self {
        self.completeness = rule;
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<Strategy>) -> Self {
        self.strategies = strategies;
        self
    }
}

/// Current state of one researched field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldState {
    pub name: String,
    /// Canonical value; `Null` until some source reports one.
    pub value: FieldValue,
    /// Corroborated confidence in [0, 1].
    pub confidence: f64,
    pub sources: Vec<Source>,
    pub complete: bool,
    /// Distinct independence groups backing `value`.
    #[serde(default)]
    pub supporting_groups: usize,
    #[serde(default = "default_agreement")]
    pub agreement_score: f64,
    /// Derived; recomputed whenever a source is added.
    #[serde(skip)]
    pub conflicts: Vec<Conflict>,
}

fn default_agreement() -> f64 {
    1.0
}

impl FieldState {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: FieldValue::Null,
            confidence: 0.0,
            sources: Vec::new(),
            complete: false,
            supporting_groups: 0,
            agreement_score: 1.0,
            conflicts: Vec::new(),
        }
    }
}

/// Holds every tracked field of one run.
#[derive(Debug, Clone)]
pub struct FieldStateStore {
    specs: BTreeMap<String, FieldSpec>,
    fields: BTreeMap<String, FieldState>,
    validator: CrossValidator,
}

impl FieldStateStore {
    pub fn new(specs: &[FieldSpec]) -> Self {
        let specs: BTreeMap<String, FieldSpec> =
            specs.iter().map(|s| (s.name.clone(), s.clone())).collect();
        let fields = specs
            .keys()
            .map(|name| (name.clone(), FieldState::empty(name.clone())))
            .collect();
        Self {
            specs,
            fields,
            validator: CrossValidator::new(),
        }
    }

    /// Rebuild from a snapshot, re-scoring every field against the current specs.
    pub fn restore(specs: &[FieldSpec], snapshot: BTreeMap<String, FieldState>) -> Self {
        let mut store = Self::new(specs);
        let now = Utc::now();
        for (name, state) in snapshot {
            store.ensure_spec(&name);
            store.fields.insert(name.clone(), state);
            store.rescore(&name, now);
        }
        store
    }

    fn ensure_spec(&mut self, field: &str) {
        if !self.specs.contains_key(field) {
            self.specs
                .insert(field.to_string(), FieldSpec::new(field).optional());
        }
    }

    /// Append a source to a field and re-score it.
    ///
    /// Fields without a spec are tracked as optional with the default rule.
    pub fn upsert_source(&mut self, field: &str, source: Source) -> &FieldState {
        self.upsert_source_at(field, source, Utc::now())
    }

    pub fn upsert_source_at(
        &mut self,
        field: &str,
        source: Source,
        detected_at: DateTime<Utc>,
    ) -> &FieldState {
        self.ensure_spec(field);
        self.fields
            .entry(field.to_string())
            .or_insert_with(|| FieldState::empty(field))
            .sources
            .push(source);
        self.rescore(field, detected_at);
        &self.fields[field]
    }

    pub fn get(&self, field: &str) -> Option<&FieldState> {
        self.fields.get(field)
    }

    pub fn spec(&self, field: &str) -> Option<&FieldSpec> {
        self.specs.get(field)
    }

    pub fn specs(&self) -> impl Iterator<Item = &FieldSpec> {
        self.specs.values()
    }

    pub fn snapshot_all(&self) -> BTreeMap<String, FieldState> {
        self.fields.clone()
    }

    /// Whether every required field is complete.
    pub fn required_complete(&self) -> bool {
        self.specs
            .values()
            .filter(|s| s.required)
            .all(|s| self.fields.get(&s.name).is_some_and(|f| f.complete))
    }

    /// Weight-averaged confidence over all declared fields.
    pub fn overall_confidence(&self) -> f64 {
        let total_weight: f64 = self.specs.values().map(|s| s.weight.max(0.0)).sum();
        if total_weight == 0.0 {
            return 0.0;
        }
        let weighted: f64 = self
            .specs
            .values()
            .map(|s| {
                let confidence = self.fields.get(&s.name).map(|f| f.confidence).unwrap_or(0.0);
                s.weight.max(0.0) * confidence
            })
            .sum();
        weighted / total_weight
    }

    /// Number of sources recorded across all fields.
    pub fn source_count(&self) -> usize {
        self.fields.values().map(|f| f.sources.len()).sum()
    }

    fn rescore(&mut self, field: &str, detected_at: DateTime<Utc>) {
        let rule = self
            .specs
            .get(field)
            .map(|s| s.completeness.clone())
            .unwrap_or_default();
        let Some(state) = self.fields.get_mut(field) else {
            return;
        };

        match self.validator.canonical(&state.sources) {
            Some(canonical) => {
                let report =
                    self.validator
                        .validate(&state.sources, canonical.base_confidence, detected_at);
                state.value = canonical.value;
                state.confidence = report.confidence;
                state.supporting_groups = canonical.supporting_groups;
                state.agreement_score = report.agreement_score;
                state.conflicts = report.conflicts;
            }
            None => {
                state.value = FieldValue::Null;
                state.confidence = 0.0;
                state.supporting_groups = 0;
                state.agreement_score = 1.0;
                state.conflicts.clear();
            }
        }
        state.complete = rule.is_satisfied(state);
        tracing::trace!(
            field,
            confidence = state.confidence,
            complete = state.complete,
            conflicts = state.conflicts.len(),
            "Field re-scored"
        );
    }
}
