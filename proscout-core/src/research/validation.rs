//! Cross-source validation.
//!
//! Turns a set of heterogeneous sources into one corroborated confidence score.
//! Everything here is a pure function of the source list and the static group
//! table: no hidden state, and the result does not depend on insertion order.

use super::sources::{normalize_text, FieldValue, IndependenceGroup, Source, SourceType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Multiplier applied when at most one independence group is represented.
pub const SINGLE_SOURCE_MULTIPLIER: f64 = 0.80;
/// Multiplier for exactly two independent groups.
pub const BASELINE_MULTIPLIER: f64 = 1.00;
/// Per-group step used for three or more groups.
pub const CORROBORATION_STEP: f64 = 0.10;
/// Upper bound of the corroboration bonus.
pub const MAX_CORROBORATION_MULTIPLIER: f64 = 1.10;
/// Penalty per major conflict.
pub const MAJOR_CONFLICT_PENALTY: f64 = 0.10;
/// Penalty per minor conflict.
pub const MINOR_CONFLICT_PENALTY: f64 = 0.05;
/// Floor of the final multiplier.
pub const MIN_MULTIPLIER: f64 = 0.50;
/// Ceiling of any corroborated confidence.
pub const MAX_CONFIDENCE: f64 = 0.98;
/// Relative tolerance under which two numbers are equal.
pub const NUMERIC_AGREEMENT_TOLERANCE: f64 = 0.05;
/// Relative difference under which a numeric disagreement is minor.
pub const MINOR_NUMERIC_TOLERANCE: f64 = 0.20;
/// Shortest shared prefix that counts as significant.
const SIGNIFICANT_PREFIX_CHARS: usize = 4;

/// How serious a disagreement between two sources is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Minor,
    Major,
}

/// A disagreement between two sources from different independence groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub source_a: SourceType,
    pub source_b: SourceType,
    pub group_a: IndependenceGroup,
    pub group_b: IndependenceGroup,
    pub value_a: FieldValue,
    pub value_b: FieldValue,
    pub severity: ConflictSeverity,
    pub detected_at: DateTime<Utc>,
}

/// Outcome of validating one field's sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Distinct independence groups among non-null sources (`k`).
    pub groups: usize,
    /// Multiplier from source diversity alone.
    pub base_multiplier: f64,
    /// Multiplier after conflict penalties.
    pub multiplier: f64,
    /// Final corroborated confidence.
    pub confidence: f64,
    /// Diagnostic agreement ratio across cross-group pairs.
    pub agreement_score: f64,
    /// Number of cross-group source pairs examined.
    pub cross_group_pairs: usize,
    pub conflicts: Vec<Conflict>,
}

impl ValidationReport {
    pub fn major_conflicts(&self) -> usize {
        self.conflicts
            .iter()
            .filter(|c| c.severity == ConflictSeverity::Major)
            .count()
    }

    pub fn minor_conflicts(&self) -> usize {
        self.conflicts
            .iter()
            .filter(|c| c.severity == ConflictSeverity::Minor)
            .count()
    }
}

/// The value a field settles on, and the prior that backs it.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalValue {
    pub value: FieldValue,
    pub base_confidence: f64,
    pub supporting_groups: usize,
}

/// Corroboration multiplier for `k` represented independence groups.
pub fn corroboration_multiplier(k: usize) -> f64 {
    match k {
        0 | 1 => SINGLE_SOURCE_MULTIPLIER,
        2 => BASELINE_MULTIPLIER,
        _ => (SINGLE_SOURCE_MULTIPLIER + CORROBORATION_STEP * k as f64)
            .min(MAX_CORROBORATION_MULTIPLIER),
    }
}

/// Multiplier after subtracting conflict penalties, floored at `MIN_MULTIPLIER`.
pub fn penalized_multiplier(base: f64, major: usize, minor: usize) -> f64 {
    (base - MAJOR_CONFLICT_PENALTY * major as f64 - MINOR_CONFLICT_PENALTY * minor as f64)
        .max(MIN_MULTIPLIER)
}

fn relative_difference(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        0.0
    } else {
        (a - b).abs() / scale
    }
}

fn as_set(value: &FieldValue) -> Option<BTreeSet<String>> {
    match value {
        FieldValue::List(items) => Some(items.iter().map(|i| normalize_text(i)).collect()),
        FieldValue::Text(s) => Some(std::iter::once(normalize_text(s)).collect()),
        _ => None,
    }
}

/// Numeric comparison applies when at least one side is a number and the other
/// parses as one. Two text values stay textual so model numbers like "1200" and
/// "1250" are never treated as near-equal.
fn both_numeric(a: &FieldValue, b: &FieldValue) -> Option<(f64, f64)> {
    if !matches!(a, FieldValue::Number(_)) && !matches!(b, FieldValue::Number(_)) {
        return None;
    }
    Some((a.as_number()?, b.as_number()?))
}

/// Whether two values agree.
///
/// Text compares case-insensitively after trimming, numbers within 5% relative
/// tolerance, lists as unordered sets. A null on either side always agrees.
pub fn values_agree(a: &FieldValue, b: &FieldValue) -> bool {
    if a.is_null() || b.is_null() {
        return true;
    }
    if let Some((x, y)) = both_numeric(a, b) {
        return relative_difference(x, y) <= NUMERIC_AGREEMENT_TOLERANCE;
    }
    if matches!(a, FieldValue::List(_)) || matches!(b, FieldValue::List(_)) {
        return as_set(a) == as_set(b);
    }
    match (a.normalized_text(), b.normalized_text()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn common_prefix_chars(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

/// Severity of a disagreement between two values that do not agree.
pub fn conflict_severity(a: &FieldValue, b: &FieldValue) -> ConflictSeverity {
    if let Some((x, y)) = both_numeric(a, b) {
        return if relative_difference(x, y) <= MINOR_NUMERIC_TOLERANCE {
            ConflictSeverity::Minor
        } else {
            ConflictSeverity::Major
        };
    }
    if matches!(a, FieldValue::List(_)) || matches!(b, FieldValue::List(_)) {
        return match (as_set(a), as_set(b)) {
            (Some(x), Some(y)) if x.is_subset(&y) || y.is_subset(&x) => ConflictSeverity::Minor,
            _ => ConflictSeverity::Major,
        };
    }
    let (Some(x), Some(y)) = (a.normalized_text(), b.normalized_text()) else {
        return ConflictSeverity::Major;
    };
    if x.contains(&y) || y.contains(&x) {
        return ConflictSeverity::Minor;
    }
    let shorter = x.chars().count().min(y.chars().count());
    let prefix = common_prefix_chars(&x, &y);
    if prefix >= SIGNIFICANT_PREFIX_CHARS && prefix * 2 >= shorter {
        ConflictSeverity::Minor
    } else {
        ConflictSeverity::Major
    }
}

fn source_order(a: &Source, b: &Source) -> Ordering {
    a.group()
        .cmp(&b.group())
        .then_with(|| a.source_type.cmp(&b.source_type))
        .then_with(|| a.comparable().sort_key().cmp(&b.comparable().sort_key()))
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.value.sort_key().cmp(&b.value.sort_key()))
}

/// Non-null sources in a canonical order.
fn ordered_evidence(sources: &[Source]) -> Vec<&Source> {
    let mut ordered: Vec<&Source> = sources.iter().filter(|s| !s.comparable().is_null()).collect();
    ordered.sort_by(|a, b| source_order(a, b));
    ordered
}

/// Computes corroborated confidence and conflicts for a field's sources.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossValidator;

impl CrossValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a field's sources against a caller-supplied prior.
    ///
    /// `detected_at` stamps any conflicts found; it does not influence scoring.
    pub fn validate(
        &self,
        sources: &[Source],
        base_confidence: f64,
        detected_at: DateTime<Utc>,
    ) -> ValidationReport {
        let evidence = ordered_evidence(sources);
        let groups: BTreeSet<IndependenceGroup> = evidence.iter().map(|s| s.group()).collect();
        let k = groups.len();
        let base_multiplier = corroboration_multiplier(k);

        let mut conflicts = Vec::new();
        let mut cross_group_pairs = 0usize;
        for (i, a) in evidence.iter().enumerate() {
            for b in evidence.iter().skip(i + 1) {
                if a.group() == b.group() {
                    continue;
                }
                cross_group_pairs += 1;
                if values_agree(a.comparable(), b.comparable()) {
                    continue;
                }
                conflicts.push(Conflict {
                    source_a: a.source_type.clone(),
                    source_b: b.source_type.clone(),
                    group_a: a.group(),
                    group_b: b.group(),
                    value_a: a.value.clone(),
                    value_b: b.value.clone(),
                    severity: conflict_severity(a.comparable(), b.comparable()),
                    detected_at,
                });
            }
        }

        let major = conflicts
            .iter()
            .filter(|c| c.severity == ConflictSeverity::Major)
            .count();
        let minor = conflicts.len() - major;
        let multiplier = penalized_multiplier(base_multiplier, major, minor);
        let confidence = (base_confidence.clamp(0.0, 1.0) * multiplier).min(MAX_CONFIDENCE);
        let agreement_score = 1.0 - conflicts.len() as f64 / cross_group_pairs.max(1) as f64;

        ValidationReport {
            groups: k,
            base_multiplier,
            multiplier,
            confidence,
            agreement_score,
            cross_group_pairs,
            conflicts,
        }
    }

    /// Pick the value best supported across independence groups.
    ///
    /// Candidates are ranked by the number of distinct groups that agree with
    /// them, then by the summed prior of agreeing sources. The prior of the
    /// strongest agreeing source becomes the base confidence.
    pub fn canonical(&self, sources: &[Source]) -> Option<CanonicalValue> {
        let evidence = ordered_evidence(sources);
        let mut best: Option<(usize, f64, &Source, f64)> = None;

        for candidate in &evidence {
            let support: Vec<&&Source> = evidence
                .iter()
                .filter(|s| values_agree(candidate.comparable(), s.comparable()))
                .collect();
            let groups: BTreeSet<IndependenceGroup> = support.iter().map(|s| s.group()).collect();
            let weight: f64 = support.iter().map(|s| s.confidence).sum();
            let prior = support
                .iter()
                .map(|s| s.confidence)
                .fold(0.0_f64, f64::max);

            let better = match &best {
                None => true,
                Some((g, w, current, _)) => match groups.len().cmp(g) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => match weight.total_cmp(w) {
                        Ordering::Greater => true,
                        Ordering::Less => false,
                        Ordering::Equal => {
                            candidate.confidence > current.confidence
                        }
                    },
                },
            };
            if better {
                best = Some((groups.len(), weight, candidate, prior));
            }
        }

        best.map(|(groups, _, source, prior)| CanonicalValue {
            value: source.value.clone(),
            base_confidence: prior,
            supporting_groups: groups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_multiplier_table() {
        assert!(approx(corroboration_multiplier(0), 0.80));
        assert!(approx(corroboration_multiplier(1), 0.80));
        assert!(approx(corroboration_multiplier(2), 1.00));
        assert!(approx(corroboration_multiplier(3), 1.10));
        assert!(approx(corroboration_multiplier(7), 1.10));
    }

    #[test]
    fn test_case_insensitive_agreement_across_groups() {
        let sources = vec![
            Source::new("upc_database", "Nike Air Max 90", 0.9),
            Source::new("web_search", "nike air max 90", 0.7),
        ];
        let report = CrossValidator::new().validate(&sources, 0.9, now());
        assert!(values_agree(&sources[0].value, &sources[1].value));
        assert_eq!(report.groups, 2);
        assert!(report.conflicts.is_empty());
        assert!(approx(report.multiplier, 1.00));
        assert!(approx(report.confidence, 0.9));
        assert!(approx(report.agreement_score, 1.0));
    }

    #[test]
    fn test_three_groups_agreeing() {
        let sources = vec![
            Source::new("vision_model", "Levi's 501", 0.8),
            Source::new("upc_database", "levi's 501", 0.9),
            Source::new("marketplace_search", "LEVI'S 501", 0.6),
        ];
        let report = CrossValidator::new().validate(&sources, 0.8, now());
        assert_eq!(report.groups, 3);
        assert!(approx(report.multiplier, 1.10));
        assert!(approx(report.confidence, 0.88));
    }

    #[test]
    fn test_same_group_not_double_counted() {
        let sources = vec![
            Source::new("price_comparables", 120.0, 0.8),
            Source::new("price_guide", 121.0, 0.8),
        ];
        let report = CrossValidator::new().validate(&sources, 0.8, now());
        assert_eq!(report.groups, 1);
        assert_eq!(report.cross_group_pairs, 0);
        assert!(approx(report.multiplier, 0.80));
    }

    #[test]
    fn test_same_group_disagreement_is_not_a_conflict() {
        let sources = vec![
            Source::new("vision_model", "Adidas", 0.8),
            Source::new("ocr", "Puma", 0.8),
        ];
        let report = CrossValidator::new().validate(&sources, 0.8, now());
        assert!(report.conflicts.is_empty());
    }

    #[test]
    fn test_numeric_tolerance() {
        assert!(values_agree(&FieldValue::Number(100.0), &FieldValue::Number(104.9)));
        assert!(!values_agree(&FieldValue::Number(100.0), &FieldValue::Number(106.0)));
        assert!(values_agree(&FieldValue::from("$100"), &FieldValue::Number(103.0)));
        assert!(values_agree(&FieldValue::Number(0.0), &FieldValue::Number(0.0)));
    }

    #[test]
    fn test_numeric_severity() {
        assert_eq!(
            conflict_severity(&FieldValue::Number(100.0), &FieldValue::Number(115.0)),
            ConflictSeverity::Minor
        );
        assert_eq!(
            conflict_severity(&FieldValue::Number(100.0), &FieldValue::Number(150.0)),
            ConflictSeverity::Major
        );
    }

    #[test]
    fn test_text_severity() {
        assert_eq!(
            conflict_severity(&"Air Max".into(), &"Nike Air Max 90".into()),
            ConflictSeverity::Minor
        );
        assert_eq!(
            conflict_severity(&"Stratocaster".into(), &"Strat".into()),
            ConflictSeverity::Minor
        );
        assert_eq!(
            conflict_severity(&"Telecaster Deluxe".into(), &"Telephone".into()),
            ConflictSeverity::Minor
        );
        assert_eq!(
            conflict_severity(&"Gibson".into(), &"Fender".into()),
            ConflictSeverity::Major
        );
    }

    #[test]
    fn test_list_agreement_is_unordered() {
        let a = FieldValue::List(vec!["Red".into(), "Blue".into()]);
        let b = FieldValue::List(vec!["blue".into(), "red".into()]);
        assert!(values_agree(&a, &b));
        let c = FieldValue::List(vec!["blue".into()]);
        assert!(!values_agree(&a, &c));
        assert_eq!(conflict_severity(&a, &c), ConflictSeverity::Minor);
    }

    #[test]
    fn test_null_never_penalized() {
        let sources = vec![
            Source::new("vision_model", FieldValue::Null, 0.5),
            Source::new("web_search", "Sony", 0.7),
        ];
        let report = CrossValidator::new().validate(&sources, 0.7, now());
        assert!(report.conflicts.is_empty());
        assert_eq!(report.groups, 1);
    }

    #[test]
    fn test_conflict_penalties_and_floor() {
        let sources = vec![
            Source::new("vision_model", "Gibson", 0.8),
            Source::new("upc_database", "Fender", 0.9),
        ];
        let report = CrossValidator::new().validate(&sources, 0.9, now());
        assert_eq!(report.major_conflicts(), 1);
        assert!(approx(report.multiplier, 0.90));
        assert!(approx(report.agreement_score, 0.0));

        assert!(approx(penalized_multiplier(1.0, 9, 0), MIN_MULTIPLIER));
    }

    #[test]
    fn test_confidence_capped() {
        let sources = vec![
            Source::new("vision_model", "Rolex", 1.0),
            Source::new("upc_database", "Rolex", 1.0),
            Source::new("web_search", "Rolex", 1.0),
        ];
        let report = CrossValidator::new().validate(&sources, 1.0, now());
        assert!(approx(report.confidence, MAX_CONFIDENCE));
    }

    #[test]
    fn test_order_independence() {
        let mut sources = vec![
            Source::new("vision_model", "Canon AE-1", 0.6),
            Source::new("upc_database", "Canon AE-1 Program", 0.9),
            Source::new("web_search", "Minolta X-700", 0.5),
            Source::new("sold_listings", 210.0, 0.4),
        ];
        let validator = CrossValidator::new();
        let forward = validator.validate(&sources, 0.8, now());
        sources.reverse();
        let backward = validator.validate(&sources, 0.8, now());
        assert_eq!(forward, backward);
        assert_eq!(validator.canonical(&sources), {
            sources.reverse();
            validator.canonical(&sources)
        });
    }

    #[test]
    fn test_canonical_prefers_cross_group_support() {
        let sources = vec![
            Source::new("vision_model", "Seiko", 0.95),
            Source::new("upc_database", "Casio", 0.7),
            Source::new("web_search", "casio", 0.6),
        ];
        let canonical = CrossValidator::new().canonical(&sources).unwrap();
        assert_eq!(canonical.value, FieldValue::from("Casio"));
        assert!(approx(canonical.base_confidence, 0.7));
        assert_eq!(canonical.supporting_groups, 2);
    }

    #[test]
    fn test_canonical_none_for_all_null() {
        let sources = vec![Source::new("ocr", FieldValue::Null, 0.4)];
        assert!(CrossValidator::new().canonical(&sources).is_none());
    }
}
