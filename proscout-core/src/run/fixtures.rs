//! Shared scripted research backend for unit tests.

use crate::research::sources::{Identifier, Source};
use crate::tools::{Extraction, Finding, SubjectContext, ToolScript};

pub(crate) const SUBJECT: &str = "item-1";
pub(crate) const OWNER: &str = "owner-1";
pub(crate) const UPC: &str = "00883412345";

/// One pair of sneakers whose brand, model and price can all be corroborated.
pub(crate) fn script() -> ToolScript {
    let mut script = ToolScript::default();
    script.subjects.push(SubjectContext {
        subject_id: SUBJECT.into(),
        owner_id: OWNER.into(),
        title: "Nike Air Max 90 sneakers".into(),
        description: Some("Worn twice, original box".into()),
        image_refs: vec!["photo-1.jpg".into()],
    });
    script.extractions.insert(
        SUBJECT.into(),
        Extraction {
            findings: vec![
                Finding::new("brand", Source::new("vision_model", "Nike", 0.7)),
                Finding::new("category", Source::new("vision_model", "Sneakers", 0.6)),
            ],
            identifiers: vec![Identifier::new("upc", UPC)],
        },
    );
    script.identifiers.insert(
        UPC.into(),
        vec![
            Finding::new("brand", Source::new("upc_database", "Nike", 0.9)),
            Finding::new("model", Source::new("upc_database", "Air Max 90", 0.9)),
        ],
    );
    script.marketplaces.insert(
        "ebay".into(),
        vec![
            Finding::new("price", Source::new("marketplace_listing", 120.0, 0.8)),
            Finding::new("model", Source::new("marketplace_listing", "Air Max 90", 0.8)),
        ],
    );
    script.marketplaces.insert(
        "mercari".into(),
        vec![Finding::new("price", Source::new("sold_listings", 118.0, 0.7))],
    );
    script.comparables.insert(
        "price".into(),
        vec![Finding::new("price", Source::new("price_comparables", 121.0, 0.85))],
    );
    script
}
