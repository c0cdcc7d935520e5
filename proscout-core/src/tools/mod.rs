//! Typed capability interface to the external research collaborators.
//!
//! Each operation takes a typed request and returns a typed result with the
//! cost it incurred, or a classified [`ToolError`]. Retries and circuit
//! breaking live in [`resilience`], never in the orchestrator.

pub mod resilience;
pub mod scripted;

use crate::research::sources::{Identifier, Source};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use crate::error::{FailureKind, ToolError};
pub use resilience::{CircuitBreaker, CircuitState, ResilientTools, RetryPolicy};
pub use scripted::{ScriptedFailure, ScriptedTools, ToolScript};

/// Operation names, used for logging, circuit breakers and failure injection.
pub mod ops {
    pub const LOAD_SUBJECT: &str = "load_subject";
    pub const EXTRACT_ATTRIBUTES: &str = "extract_attributes";
    pub const LOOKUP_IDENTIFIER: &str = "lookup_identifier";
    pub const SEARCH_MARKETPLACE: &str = "search_marketplace";
    pub const FETCH_COMPARABLES: &str = "fetch_comparables";
    pub const WEB_SEARCH: &str = "web_search";
}

/// A successful tool result and what it cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput<T> {
    pub value: T,
    #[serde(default)]
    pub cost: f64,
}

impl<T> ToolOutput<T> {
    pub fn new(value: T, cost: f64) -> Self {
        Self { value, cost }
    }
}

pub type ToolResult<T> = Result<ToolOutput<T>, ToolError>;

/// The item being researched, as described by its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectContext {
    pub subject_id: String,
    pub owner_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_refs: Vec<String>,
}

/// One sourced value for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub field: String,
    pub source: Source,
}

impl Finding {
    pub fn new(field: impl Into<String>, source: Source) -> Self {
        Self {
            field: field.into(),
            source,
        }
    }
}

/// Attributes read off the subject's photos and description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSubjectRequest {
    pub subject_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub subject: SubjectContext,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifierRequest {
    pub identifier: Identifier,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceRequest {
    pub marketplace: String,
    pub query: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparablesRequest {
    pub query: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSearchRequest {
    pub query: String,
    pub fields: Vec<String>,
}

/// External research operations, one method per collaborator call.
#[async_trait]
pub trait ResearchTools: Send + Sync {
    async fn load_subject(&self, request: &LoadSubjectRequest) -> ToolResult<SubjectContext>;

    async fn extract_attributes(&self, request: &ExtractRequest) -> ToolResult<Extraction>;

    async fn lookup_identifier(&self, request: &IdentifierRequest) -> ToolResult<Vec<Finding>>;

    async fn search_marketplace(&self, request: &MarketplaceRequest)
        -> ToolResult<Vec<Finding>>;

    async fn fetch_comparables(&self, request: &ComparablesRequest) -> ToolResult<Vec<Finding>>;

    async fn web_search(&self, request: &WebSearchRequest) -> ToolResult<Vec<Finding>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_output_cost_defaults() {
        let out: ToolOutput<Vec<Finding>> = serde_json::from_str(r#"{"value":[]}"#).unwrap();
        assert_eq!(out.cost, 0.0);
    }
}
