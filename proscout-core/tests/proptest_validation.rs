//! Property-based tests for cross-source validation using proptest.

use chrono::Utc;
use proptest::prelude::*;

use proscout_core::research::sources::{FieldValue, Source};
use proscout_core::research::validation::{
    CrossValidator, MAX_CONFIDENCE, MIN_MULTIPLIER, corroboration_multiplier,
    penalized_multiplier, values_agree,
};

const SOURCE_TYPES: &[&str] = &[
    "vision_model",
    "ocr",
    "upc_database",
    "marketplace_listing",
    "sold_listings",
    "price_guide",
    "web_search",
    "user_input",
    "mystery_feed",
];

fn arb_source() -> impl Strategy<Value = Source> {
    let value = prop_oneof![
        (50.0f64..150.0).prop_map(FieldValue::Number),
        prop::sample::select(vec!["Nike", "nike ", "Adidas", "Air Max 90"])
            .prop_map(|s| FieldValue::Text(s.to_string())),
        Just(FieldValue::Null),
    ];
    (prop::sample::select(SOURCE_TYPES), value, 0.0f64..=1.0)
        .prop_map(|(source_type, value, confidence)| Source::new(source_type, value, confidence))
}

// --- Corroboration multiplier properties ---

proptest! {
    #[test]
    fn multiplier_follows_group_table(k in 0usize..50) {
        let m = corroboration_multiplier(k);
        match k {
            0 | 1 => prop_assert_eq!(m, 0.80),
            2 => prop_assert_eq!(m, 1.00),
            _ => prop_assert!((m - 1.10).abs() < 1e-9),
        }
    }

    #[test]
    fn multiplier_is_monotonic_in_groups(k in 0usize..50) {
        prop_assert!(corroboration_multiplier(k + 1) >= corroboration_multiplier(k));
    }

    #[test]
    fn penalties_never_raise_multiplier(
        base in 0.5f64..=1.1,
        major in 0usize..20,
        minor in 0usize..20,
    ) {
        let m = penalized_multiplier(base, major, minor);
        prop_assert!(penalized_multiplier(base, major + 1, minor) <= m);
        prop_assert!(penalized_multiplier(base, major, minor + 1) <= m);
        prop_assert!(m >= MIN_MULTIPLIER);
    }
}

// --- Value agreement properties ---

proptest! {
    #[test]
    fn numbers_within_tolerance_agree(x in 1.0f64..1_000_000.0, f in 0.0f64..0.049) {
        let a = FieldValue::Number(x);
        let b = FieldValue::Number(x * (1.0 + f));
        prop_assert!(values_agree(&a, &b));
        prop_assert!(values_agree(&b, &a));
    }

    #[test]
    fn numbers_outside_tolerance_disagree(x in 1.0f64..1_000_000.0, f in 0.06f64..1.0) {
        let a = FieldValue::Number(x);
        let b = FieldValue::Number(x * (1.0 + f));
        prop_assert!(!values_agree(&a, &b));
    }

    #[test]
    fn text_agreement_ignores_case_and_padding(s in "[A-Za-z0-9][A-Za-z0-9 ]{0,19}") {
        let a = FieldValue::Text(s.clone());
        let b = FieldValue::Text(format!("  {}  ", s.to_uppercase()));
        prop_assert!(values_agree(&a, &b));
    }
}

// --- Validator properties ---

proptest! {
    #[test]
    fn confidence_stays_in_range(
        sources in prop::collection::vec(arb_source(), 0..12),
        prior in 0.0f64..=1.0,
    ) {
        let report = CrossValidator::new().validate(&sources, prior, Utc::now());
        prop_assert!(report.confidence >= 0.0);
        prop_assert!(report.confidence <= MAX_CONFIDENCE);
        prop_assert!(report.multiplier >= MIN_MULTIPLIER);
        prop_assert!(report.conflicts.len() <= report.cross_group_pairs);
    }

    #[test]
    fn validation_ignores_source_order(
        sources in prop::collection::vec(arb_source(), 1..10),
        prior in 0.0f64..=1.0,
        rotate in 0usize..10,
    ) {
        let validator = CrossValidator::new();
        let now = Utc::now();
        let mut shuffled = sources.clone();
        shuffled.reverse();
        let len = shuffled.len();
        shuffled.rotate_left(rotate % len);

        let a = validator.validate(&sources, prior, now);
        let b = validator.validate(&shuffled, prior, now);
        prop_assert_eq!(a.groups, b.groups);
        prop_assert_eq!(a.conflicts.len(), b.conflicts.len());
        prop_assert_eq!(a.major_conflicts(), b.major_conflicts());
        prop_assert!((a.confidence - b.confidence).abs() < 1e-12);

        let ca = validator.canonical(&sources);
        let cb = validator.canonical(&shuffled);
        prop_assert_eq!(
            ca.map(|c| (c.value.sort_key(), c.supporting_groups)),
            cb.map(|c| (c.value.sort_key(), c.supporting_groups))
        );
    }

    #[test]
    fn adding_a_major_conflict_never_raises_confidence(
        price in 50.0f64..150.0,
        prior in 0.1f64..=1.0,
    ) {
        let validator = CrossValidator::new();
        let now = Utc::now();
        let agreeing = vec![
            Source::new("marketplace_listing", price, 0.8),
            Source::new("price_guide", price, 0.8),
        ];
        let mut disputed = agreeing.clone();
        disputed.push(Source::new("web_search", price * 3.0, 0.8));

        let clean = validator.validate(&agreeing, prior, now);
        let conflicted = validator.validate(&disputed, prior, now);
        prop_assert!(conflicted.major_conflicts() > clean.major_conflicts());
        prop_assert!(
            conflicted.multiplier
                <= penalized_multiplier(corroboration_multiplier(conflicted.groups), 0, 0)
        );
        prop_assert!(conflicted.multiplier < corroboration_multiplier(conflicted.groups));
    }
}
