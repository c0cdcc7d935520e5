//! Configuration system for Proscout.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/proscout/config.toml` and/or `.proscout/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::research::fields::{CompletenessRule, FieldSpec};
use crate::research::planner::{Budget, Strategy};
use crate::run::phases::GraphConfig;
use crate::run::types::Disposition;
use crate::tools::resilience::{BreakerSettings, RetryPolicy};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoutConfig {
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub salvage: SalvageConfig,
    #[serde(default)]
    pub disposition: DispositionConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

/// What to research and how much to spend on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchConfig {
    pub fields: Vec<FieldSpec>,
    pub budget: Budget,
    /// Marketplaces queried in parallel by a marketplace search.
    pub marketplaces: Vec<String>,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            fields: vec![
                FieldSpec::new("brand").with_weight(1.0),
                FieldSpec::new("model").with_weight(0.9),
                FieldSpec::new("price")
                    .with_weight(0.8)
                    .with_rule(CompletenessRule::MinGroups { groups: 2 })
                    .with_strategies(vec![
                        Strategy::PriceComparables,
                        Strategy::MarketplaceSearch,
                    ]),
                FieldSpec::new("category")
                    .with_weight(0.3)
                    .optional()
                    .with_rule(CompletenessRule::AnyValue),
            ],
            budget: Budget::default(),
            marketplaces: vec!["ebay".into(), "mercari".into()],
        }
    }
}

/// Salvage threshold for runs that hit the step ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalvageConfig {
    /// Minimum usable evidence records for a partial success.
    pub min_evidence: usize,
}

impl Default for SalvageConfig {
    fn default() -> Self {
        Self { min_evidence: 1 }
    }
}

/// Thresholds routing finished subjects to review queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispositionConfig {
    pub auto_approve_confidence: f64,
    pub auto_approve_min_evidence: usize,
    pub spot_check_confidence: f64,
}

impl Default for DispositionConfig {
    fn default() -> Self {
        Self {
            auto_approve_confidence: 0.85,
            auto_approve_min_evidence: 3,
            spot_check_confidence: 0.6,
        }
    }
}

impl DispositionConfig {
    pub fn route(&self, confidence: f64, evidence: usize) -> Disposition {
        if confidence >= self.auto_approve_confidence && evidence >= self.auto_approve_min_evidence
        {
            Disposition::AutoApprove
        } else if confidence >= self.spot_check_confidence && evidence > 0 {
            Disposition::SpotCheck
        } else {
            Disposition::FullReview
        }
    }
}

/// Retry and circuit-breaker settings for the tool wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Consecutive failures that open an operation's breaker; 0 disables it.
    pub breaker_threshold: usize,
    pub breaker_recovery_ms: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let breaker = BreakerSettings::default();
        Self {
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay_ms,
            max_delay_ms: retry.max_delay_ms,
            jitter: retry.jitter,
            breaker_threshold: breaker.failure_threshold,
            breaker_recovery_ms: breaker.recovery_timeout_ms,
        }
    }
}

impl ToolsConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter: self.jitter,
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.breaker_threshold,
            recovery_timeout_ms: self.breaker_recovery_ms,
        }
    }
}

/// Startup reconciliation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Delay before the startup pass, letting other subsystems come up.
    pub grace_delay_secs: u64,
    /// A running row with no activity for this long is considered stalled.
    pub stale_after_secs: u64,
    /// Re-enqueue error runs that still hold a checkpoint.
    pub auto_resume: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            grace_delay_secs: 5,
            stale_after_secs: 600,
            auto_resume: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for run rows, evidence and the queue file. Defaults to the
    /// platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve_state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("dev", "proscout", "proscout")
            .map(|dirs| dirs.data_dir().join("state"))
            .unwrap_or_else(|| PathBuf::from(".proscout").join("state"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersConfig {
    pub concurrency: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { concurrency: 2 }
    }
}

impl ScoutConfig {
    /// Reject configurations the orchestrator cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };

        self.graph.validate()?;

        if self.research.fields.is_empty() {
            return invalid("at least one research field is required");
        }
        let mut names = HashSet::new();
        for field in &self.research.fields {
            if field.name.trim().is_empty() {
                return invalid("field names must not be empty");
            }
            if !names.insert(field.name.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("field '{}' is declared twice", field.name),
                });
            }
            if !(field.weight >= 0.0) {
                return Err(ConfigError::Invalid {
                    message: format!("field '{}' has a negative weight", field.name),
                });
            }
            if field.strategies.is_empty() {
                return Err(ConfigError::Invalid {
                    message: format!("field '{}' has no research strategies", field.name),
                });
            }
        }
        if self.research.budget.max_iterations == 0 {
            return invalid("budget.max_iterations must be greater than zero");
        }
        if self.disposition.spot_check_confidence > self.disposition.auto_approve_confidence {
            return invalid("spot_check_confidence must not exceed auto_approve_confidence");
        }
        if self.tools.max_attempts == 0 {
            return invalid("tools.max_attempts must be at least 1");
        }
        if self.workers.concurrency == 0 {
            return invalid("workers.concurrency must be at least 1");
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `PROSCOUT_`)
/// 3. Workspace-local config (`.proscout/config.toml`)
/// 4. User config (`~/.config/proscout/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&ScoutConfig>,
) -> Result<ScoutConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(ScoutConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "proscout", "proscout") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".proscout").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // PROSCOUT_GRAPH__MAX_RETRIES, PROSCOUT_WORKERS__CONCURRENCY, etc.
    figment = figment.merge(Env::prefixed("PROSCOUT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::phases::Phase;

    #[test]
    fn test_default_config() {
        let config = ScoutConfig::default();
        assert_eq!(config.graph.steps_per_attempt, 25);
        assert_eq!(config.graph.max_retries, 3);
        assert_eq!(config.salvage.min_evidence, 1);
        assert_eq!(config.research.fields.len(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = ScoutConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: ScoutConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config.graph.phases, GraphConfig::field_driven().phases);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = ScoutConfig::default();
        overrides.graph = GraphConfig::identifier_first();
        overrides.workers.concurrency = 8;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert!(config.graph.phases.contains(&Phase::Identify));
        assert_eq!(config.workers.concurrency, 8);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let proscout_dir = dir.path().join(".proscout");
        std::fs::create_dir_all(&proscout_dir).unwrap();
        std::fs::write(
            proscout_dir.join("config.toml"),
            r#"
[graph]
phases = ["load_context", "extract", "identify", "plan", "execute", "evaluate", "persist"]
steps_per_attempt = 40
max_retries = 2

[salvage]
min_evidence = 3

[recovery]
grace_delay_secs = 0
stale_after_secs = 120
auto_resume = false
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.graph.retry_ceiling(), 80);
        assert_eq!(config.salvage.min_evidence, 3);
        assert!(!config.recovery.auto_resume);
        // Sections absent from the file keep their defaults.
        assert_eq!(config.workers.concurrency, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_fields() {
        let mut config = ScoutConfig::default();
        config.research.fields.push(FieldSpec::new("brand"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_graph() {
        let mut config = ScoutConfig::default();
        config.graph.phases.retain(|p| *p != Phase::Evaluate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disposition_routing() {
        let d = DispositionConfig::default();
        assert_eq!(d.route(0.9, 5), Disposition::AutoApprove);
        assert_eq!(d.route(0.9, 1), Disposition::SpotCheck);
        assert_eq!(d.route(0.65, 2), Disposition::SpotCheck);
        assert_eq!(d.route(0.4, 10), Disposition::FullReview);
        assert_eq!(d.route(0.9, 0), Disposition::FullReview);
    }

    #[test]
    fn test_storage_override() {
        let storage = StorageConfig {
            state_dir: Some(PathBuf::from("/tmp/proscout-test")),
        };
        assert_eq!(storage.resolve_state_dir(), PathBuf::from("/tmp/proscout-test"));
    }
}
