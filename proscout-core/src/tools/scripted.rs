//! Deterministic in-process research backend.
//!
//! `ScriptedTools` answers every operation from a serde fixture and can inject
//! classified failures per operation. The CLI loads the fixture from JSON; tests
//! build it inline.

use super::{
    ComparablesRequest, ExtractRequest, Extraction, Finding, IdentifierRequest,
    LoadSubjectRequest, MarketplaceRequest, ResearchTools, SubjectContext, ToolError, ToolOutput,
    ToolResult, WebSearchRequest, ops,
};
use crate::error::FailureKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// A failure to inject into `times` calls of `operation`, once `after` calls
/// have gone through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedFailure {
    pub operation: String,
    pub kind: FailureKind,
    #[serde(default = "default_times")]
    pub times: u32,
    #[serde(default)]
    pub after: u32,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_times() -> u32 {
    1
}

/// Canned responses for each operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolScript {
    pub subjects: Vec<SubjectContext>,
    /// Extraction keyed by subject id.
    pub extractions: BTreeMap<String, Extraction>,
    /// Catalog findings keyed by identifier value.
    pub identifiers: BTreeMap<String, Vec<Finding>>,
    /// Findings keyed by marketplace name; returned for any query.
    pub marketplaces: BTreeMap<String, Vec<Finding>>,
    /// Comparable-sales findings keyed by field.
    pub comparables: BTreeMap<String, Vec<Finding>>,
    pub web: Vec<Finding>,
    /// Cost reported per call, keyed by operation name. Missing entries cost 0.
    pub costs: BTreeMap<String, f64>,
    pub failures: Vec<ScriptedFailure>,
    /// Artificial latency applied to every call.
    pub latency_ms: u64,
}

impl ToolScript {
    pub fn from_json_file(path: &Path) -> std::io::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    calls: HashMap<String, u32>,
    /// `None` lets a call through.
    failures: HashMap<String, VecDeque<Option<(FailureKind, String)>>>,
}

pub struct ScriptedTools {
    script: ToolScript,
    state: Mutex<ScriptState>,
}

impl ScriptedTools {
    pub fn new(script: ToolScript) -> Self {
        let tools = Self {
            state: Mutex::new(ScriptState::default()),
            script,
        };
        for failure in tools.script.failures.clone() {
            let message = failure
                .message
                .clone()
                .unwrap_or_else(|| format!("scripted {} failure", failure.kind));
            tools.push_failures(
                &failure.operation,
                failure.kind,
                failure.after,
                failure.times,
                message,
            );
        }
        tools
    }

    pub fn script(&self) -> &ToolScript {
        &self.script
    }

    /// Fail the next `times` calls to `operation` with `kind`.
    pub fn fail_next(&self, operation: &str, kind: FailureKind, times: u32) {
        self.fail_after(operation, 0, kind, times);
    }

    /// Let `after` calls to `operation` through, then fail the next `times`.
    pub fn fail_after(&self, operation: &str, after: u32, kind: FailureKind, times: u32) {
        self.push_failures(operation, kind, after, times, format!("injected {kind} failure"));
    }

    /// Number of calls made to `operation` so far, failed ones included.
    pub fn call_count(&self, operation: &str) -> u32 {
        self.state
            .lock()
            .map(|s| s.calls.get(operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn push_failures(
        &self,
        operation: &str,
        kind: FailureKind,
        after: u32,
        times: u32,
        message: String,
    ) {
        if let Ok(mut state) = self.state.lock() {
            let queue = state.failures.entry(operation.to_string()).or_default();
            queue.extend((0..after).map(|_| None));
            queue.extend((0..times).map(|_| Some((kind, message.clone()))));
        }
    }

    /// Count the call and pop an injected failure, if any.
    async fn enter(&self, operation: &str) -> Result<f64, ToolError> {
        if self.script.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.script.latency_ms)).await;
        }
        let injected = match self.state.lock() {
            Ok(mut state) => {
                *state.calls.entry(operation.to_string()).or_insert(0) += 1;
                state
                    .failures
                    .get_mut(operation)
                    .and_then(VecDeque::pop_front)
                    .flatten()
            }
            Err(_) => None,
        };
        if let Some((kind, message)) = injected {
            return Err(ToolError::failed(operation, kind, message));
        }
        Ok(self.script.costs.get(operation).copied().unwrap_or(0.0))
    }

    fn only_fields(findings: &[Finding], fields: &[String]) -> Vec<Finding> {
        findings
            .iter()
            .filter(|f| fields.is_empty() || fields.contains(&f.field))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ResearchTools for ScriptedTools {
    async fn load_subject(&self, request: &LoadSubjectRequest) -> ToolResult<SubjectContext> {
        let cost = self.enter(ops::LOAD_SUBJECT).await?;
        self.script
            .subjects
            .iter()
            .find(|s| s.subject_id == request.subject_id)
            .cloned()
            .map(|subject| ToolOutput::new(subject, cost))
            .ok_or_else(|| {
                ToolError::validation(
                    ops::LOAD_SUBJECT,
                    format!("unknown subject {}", request.subject_id),
                )
            })
    }

    async fn extract_attributes(&self, request: &ExtractRequest) -> ToolResult<Extraction> {
        let cost = self.enter(ops::EXTRACT_ATTRIBUTES).await?;
        let extraction = self
            .script
            .extractions
            .get(&request.subject.subject_id)
            .cloned()
            .unwrap_or_default();
        Ok(ToolOutput::new(
            Extraction {
                findings: Self::only_fields(&extraction.findings, &request.fields),
                identifiers: extraction.identifiers,
            },
            cost,
        ))
    }

    async fn lookup_identifier(&self, request: &IdentifierRequest) -> ToolResult<Vec<Finding>> {
        let cost = self.enter(ops::LOOKUP_IDENTIFIER).await?;
        let findings = self
            .script
            .identifiers
            .get(&request.identifier.value)
            .map(|f| Self::only_fields(f, &request.fields))
            .unwrap_or_default();
        Ok(ToolOutput::new(findings, cost))
    }

    async fn search_marketplace(
        &self,
        request: &MarketplaceRequest,
    ) -> ToolResult<Vec<Finding>> {
        let cost = self.enter(ops::SEARCH_MARKETPLACE).await?;
        let findings = self
            .script
            .marketplaces
            .get(&request.marketplace)
            .map(|f| Self::only_fields(f, &request.fields))
            .unwrap_or_default();
        Ok(ToolOutput::new(findings, cost))
    }

    async fn fetch_comparables(&self, request: &ComparablesRequest) -> ToolResult<Vec<Finding>> {
        let cost = self.enter(ops::FETCH_COMPARABLES).await?;
        let findings = self
            .script
            .comparables
            .get(&request.field)
            .cloned()
            .unwrap_or_default();
        Ok(ToolOutput::new(findings, cost))
    }

    async fn web_search(&self, request: &WebSearchRequest) -> ToolResult<Vec<Finding>> {
        let cost = self.enter(ops::WEB_SEARCH).await?;
        Ok(ToolOutput::new(
            Self::only_fields(&self.script.web, &request.fields),
            cost,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::sources::{Identifier, Source};

    fn script() -> ToolScript {
        let mut script = ToolScript::default();
        script.subjects.push(SubjectContext {
            subject_id: "item-1".into(),
            owner_id: "owner-1".into(),
            title: "running shoe".into(),
            description: None,
            image_refs: vec![],
        });
        script.identifiers.insert(
            "0885178123456".into(),
            vec![
                Finding::new("brand", Source::new("upc_database", "Nike", 0.95)),
                Finding::new("model", Source::new("upc_database", "Air Max 90", 0.9)),
            ],
        );
        script.costs.insert(ops::LOOKUP_IDENTIFIER.into(), 0.01);
        script
    }

    #[tokio::test]
    async fn test_lookup_filters_fields_and_reports_cost() {
        let tools = ScriptedTools::new(script());
        let out = tools
            .lookup_identifier(&IdentifierRequest {
                identifier: Identifier::new("upc", "0885178123456"),
                fields: vec!["model".into()],
            })
            .await
            .unwrap();
        assert_eq!(out.value.len(), 1);
        assert_eq!(out.value[0].field, "model");
        assert_eq!(out.cost, 0.01);
    }

    #[tokio::test]
    async fn test_unknown_subject_is_validation_failure() {
        let tools = ScriptedTools::new(script());
        let err = tools
            .load_subject(&LoadSubjectRequest {
                subject_id: "missing".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(FailureKind::Validation));
    }

    #[tokio::test]
    async fn test_fixture_failures_consumed_in_order() {
        let mut script = script();
        script.failures.push(ScriptedFailure {
            operation: ops::LOAD_SUBJECT.into(),
            kind: FailureKind::RateLimit,
            times: 1,
            after: 0,
            message: None,
        });
        let tools = ScriptedTools::new(script);
        let request = LoadSubjectRequest {
            subject_id: "item-1".into(),
        };
        assert!(tools.load_subject(&request).await.is_err());
        assert!(tools.load_subject(&request).await.is_ok());
        assert_eq!(tools.call_count(ops::LOAD_SUBJECT), 2);
    }

    #[tokio::test]
    async fn test_failure_after_passing_calls() {
        let tools = ScriptedTools::new(script());
        tools.fail_after(ops::LOAD_SUBJECT, 1, FailureKind::Network, 1);
        let request = LoadSubjectRequest {
            subject_id: "item-1".into(),
        };
        assert!(tools.load_subject(&request).await.is_ok());
        assert!(tools.load_subject(&request).await.is_err());
        assert!(tools.load_subject(&request).await.is_ok());
    }

    #[test]
    fn test_script_from_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("script.json");
        std::fs::write(
            &path,
            r#"{
                "subjects": [{"subject_id": "s", "owner_id": "o", "title": "lamp"}],
                "web": [{"field": "brand", "source": {"source_type": "web_search", "value": "Ikea", "confidence": 0.6}}],
                "failures": [{"operation": "web_search", "kind": "network"}]
            }"#,
        )
        .unwrap();
        let script = ToolScript::from_json_file(&path).unwrap();
        assert_eq!(script.subjects[0].title, "lamp");
        assert_eq!(script.failures[0].times, 1);
        assert_eq!(script.web[0].source.confidence, 0.6);
    }
}
