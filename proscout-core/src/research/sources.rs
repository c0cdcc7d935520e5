//! Evidence sources and their independence groups.
//!
//! A `Source` is one immutable contribution to a field. Its independence group
//! is looked up from a static source-type table so that correlated providers
//! (two price lookups backed by the same catalog, OCR and a vision model reading
//! the same photo) are never counted as independent corroboration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A grouping of source types whose outputs are correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndependenceGroup {
    /// Image understanding: vision models, OCR over the same photos.
    Vision,
    /// Identifier-keyed product catalogs (UPC/EAN/GTIN databases, manufacturer data).
    Catalog,
    /// Live and sold marketplace listings.
    Marketplace,
    /// Price guides and comparable-sales providers.
    Pricing,
    /// General web search.
    Web,
    /// Values typed in by the subject's owner.
    User,
    /// Source types missing from the table. Treated as one correlated group.
    Unclassified,
}

impl fmt::Display for IndependenceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndependenceGroup::Vision => "vision",
            IndependenceGroup::Catalog => "catalog",
            IndependenceGroup::Marketplace => "marketplace",
            IndependenceGroup::Pricing => "pricing",
            IndependenceGroup::Web => "web",
            IndependenceGroup::User => "user",
            IndependenceGroup::Unclassified => "unclassified",
        };
        write!(f, "{s}")
    }
}

/// Static source-type -> independence-group table.
pub const SOURCE_GROUPS: &[(&str, IndependenceGroup)] = &[
    ("vision_model", IndependenceGroup::Vision),
    ("ocr", IndependenceGroup::Vision),
    ("barcode_lookup", IndependenceGroup::Catalog),
    ("upc_database", IndependenceGroup::Catalog),
    ("manufacturer_catalog", IndependenceGroup::Catalog),
    ("product_catalog", IndependenceGroup::Catalog),
    ("marketplace_search", IndependenceGroup::Marketplace),
    ("marketplace_listing", IndependenceGroup::Marketplace),
    ("sold_listings", IndependenceGroup::Marketplace),
    ("price_comparables", IndependenceGroup::Pricing),
    ("price_guide", IndependenceGroup::Pricing),
    ("web_search", IndependenceGroup::Web),
    ("web_page", IndependenceGroup::Web),
    ("user_input", IndependenceGroup::User),
];

/// Look up the independence group for a source-type tag.
pub fn group_for(source_type: &str) -> IndependenceGroup {
    SOURCE_GROUPS
        .iter()
        .find(|(tag, _)| *tag == source_type)
        .map(|(_, group)| *group)
        .unwrap_or(IndependenceGroup::Unclassified)
}

/// Source-type tag, e.g. `"vision_model"` or `"upc_database"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceType(String);

impl SourceType {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn group(&self) -> IndependenceGroup {
        group_for(&self.0)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceType {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// A field value as reported by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::List(items) => items.is_empty(),
            FieldValue::Number(n) => n.is_nan(),
        }
    }

    /// Numeric view: numbers directly, or text that parses after stripping
    /// currency symbols, thousands separators and whitespace.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) if n.is_finite() => Some(*n),
            FieldValue::Text(s) => parse_numeric_text(s),
            _ => None,
        }
    }

    /// Case-folded, trimmed, whitespace-collapsed text view.
    pub fn normalized_text(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(normalize_text(s)),
            FieldValue::Number(n) => Some(format_number(*n)),
            _ => None,
        }
    }

    /// Stable key used for deterministic ordering and tie-breaks.
    pub fn sort_key(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Number(n) => format!("n:{}", format_number(*n)),
            FieldValue::Text(s) => format!("t:{}", normalize_text(s)),
            FieldValue::List(items) => {
                let mut norm: Vec<String> = items.iter().map(|i| normalize_text(i)).collect();
                norm.sort();
                norm.dedup();
                format!("l:{}", norm.join("|"))
            }
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Number(n) => write!(f, "{}", format_number(*n)),
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(items: Vec<String>) -> Self {
        FieldValue::List(items)
    }
}

pub(crate) fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn parse_numeric_text(s: &str) -> Option<f64> {
    let cleaned: String = s
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | '¥' | ',' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// A precise product identifier (UPC, EAN, ISBN, manufacturer part number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    /// Identifier scheme, e.g. `"upc"`.
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into().trim().to_string(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// One immutable contribution to a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Source-type tag; determines the independence group.
    pub source_type: SourceType,
    /// Raw value as reported.
    pub value: FieldValue,
    /// Prior confidence the contributing collaborator attached (0.0-1.0).
    pub confidence: f64,
    /// Optional normalized payload used for comparison instead of `value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<FieldValue>,
}

impl Source {
    pub fn new(
        source_type: impl Into<SourceType>,
        value: impl Into<FieldValue>,
        confidence: f64,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            value: value.into(),
            confidence: confidence.clamp(0.0, 1.0),
            comparison: None,
        }
    }

    pub fn with_comparison(mut self, comparison: impl Into<FieldValue>) -> Self {
        self.comparison = Some(comparison.into());
        self
    }

    /// Independence group derived from the static table.
    pub fn group(&self) -> IndependenceGroup {
        self.source_type.group()
    }

    /// The value used for agreement checks.
    pub fn comparable(&self) -> &FieldValue {
        self.comparison.as_ref().unwrap_or(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_lookup() {
        assert_eq!(group_for("vision_model"), IndependenceGroup::Vision);
        assert_eq!(group_for("ocr"), IndependenceGroup::Vision);
        assert_eq!(group_for("upc_database"), IndependenceGroup::Catalog);
        assert_eq!(group_for("web_search"), IndependenceGroup::Web);
        assert_eq!(group_for("carrier_pigeon"), IndependenceGroup::Unclassified);
    }

    #[test]
    fn test_source_type_tags_are_unique() {
        let mut tags: Vec<&str> = SOURCE_GROUPS.iter().map(|(t, _)| *t).collect();
        let before = tags.len();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), before);
    }

    #[test]
    fn test_numeric_text_parsing() {
        assert_eq!(FieldValue::from("$1,299.00").as_number(), Some(1299.0));
        assert_eq!(FieldValue::from(" 42 ").as_number(), Some(42.0));
        assert_eq!(FieldValue::from("Nike").as_number(), None);
        assert_eq!(FieldValue::Number(f64::NAN).as_number(), None);
    }

    #[test]
    fn test_normalized_text() {
        assert_eq!(
            FieldValue::from("  Nike   Air Max 90 ").normalized_text().unwrap(),
            "nike air max 90"
        );
    }

    #[test]
    fn test_null_detection() {
        assert!(FieldValue::Null.is_null());
        assert!(FieldValue::from("   ").is_null());
        assert!(FieldValue::List(vec![]).is_null());
        assert!(!FieldValue::from("x").is_null());
    }

    #[test]
    fn test_field_value_untagged_serde() {
        let v: FieldValue = serde_json::from_str("129.5").unwrap();
        assert_eq!(v, FieldValue::Number(129.5));
        let v: FieldValue = serde_json::from_str("\"Nike\"").unwrap();
        assert_eq!(v, FieldValue::from("Nike"));
        let v: FieldValue = serde_json::from_str("null").unwrap();
        assert_eq!(v, FieldValue::Null);
        let v: FieldValue = serde_json::from_str("[\"red\",\"blue\"]").unwrap();
        assert_eq!(v, FieldValue::List(vec!["red".into(), "blue".into()]));
    }

    #[test]
    fn test_source_comparable_prefers_payload() {
        let s = Source::new("web_search", "Nike Air Max 90 (2019 retro)", 0.7)
            .with_comparison("nike air max 90");
        assert_eq!(s.comparable(), &FieldValue::from("nike air max 90"));
        assert_eq!(s.group(), IndependenceGroup::Web);
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(Source::new("ocr", "x", 1.7).confidence, 1.0);
        assert_eq!(Source::new("ocr", "x", -0.2).confidence, 0.0);
    }
}
