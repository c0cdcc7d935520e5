use chrono::Utc;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use proscout_core::ScoutConfig;
use proscout_core::research::{
    BudgetUsage, CrossValidator, FieldStateStore, PlanningInput, ResearchPlanner, Source,
};
use std::collections::BTreeSet;

fn mixed_sources(n: usize) -> Vec<Source> {
    let types = [
        "vision_model",
        "upc_database",
        "marketplace_listing",
        "price_guide",
        "web_search",
    ];
    (0..n)
        .map(|i| {
            let price = 100.0 + (i % 7) as f64 * 4.0;
            Source::new(types[i % types.len()], price, 0.8)
        })
        .collect()
}

fn bench_cross_validation(c: &mut Criterion) {
    let validator = CrossValidator::new();
    let now = Utc::now();

    let agreeing = vec![
        Source::new("upc_database", "Nike Air Max 90", 0.9),
        Source::new("web_search", "nike air max 90", 0.7),
        Source::new("marketplace_listing", "Nike Air Max 90 ", 0.8),
    ];
    c.bench_function("validate_three_groups_agreeing", |b| {
        b.iter(|| validator.validate(black_box(&agreeing), black_box(0.8), now))
    });

    let many = mixed_sources(40);
    c.bench_function("validate_forty_sources", |b| {
        b.iter(|| validator.validate(black_box(&many), black_box(0.8), now))
    });

    c.bench_function("canonical_forty_sources", |b| {
        b.iter(|| validator.canonical(black_box(&many)))
    });
}

fn bench_field_store(c: &mut Criterion) {
    let config = ScoutConfig::default();
    let sources = mixed_sources(20);

    c.bench_function("field_store_upsert_twenty", |b| {
        b.iter(|| {
            let mut store = FieldStateStore::new(&config.research.fields);
            for source in &sources {
                store.upsert_source("price", source.clone());
            }
            store.overall_confidence()
        })
    });
}

fn bench_planner(c: &mut Criterion) {
    let config = ScoutConfig::default();
    let planner = ResearchPlanner::new(config.research.budget.clone());
    let mut fields = FieldStateStore::new(&config.research.fields);
    fields.upsert_source("brand", Source::new("vision_model", "Nike", 0.6));
    let attempted = BTreeSet::new();

    c.bench_function("planner_next_action", |b| {
        b.iter(|| {
            planner.plan(black_box(&PlanningInput {
                fields: &fields,
                identifiers: &[],
                subject_title: "Nike sneakers",
                attempted: &attempted,
                usage: BudgetUsage::default(),
            }))
        })
    });
}

criterion_group!(
    benches,
    bench_cross_validation,
    bench_field_store,
    bench_planner,
);
criterion_main!(benches);
