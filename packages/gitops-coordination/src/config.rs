//! Coordinator configuration
//!
//! Loaded from versioned YAML (`version: 1` is mandatory) or built in code.
//!
//! ```yaml
//! version: 1
//! claims:
//!   default_ttl_ms: 600000
//!   retry_attempts: 5
//! pipeline:
//!   max_concurrency: 4
//! ```

use crate::dependency_graph::RepoId;
use crate::error::{CoordinationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const SUPPORTED_CONFIG_VERSIONS: &[u32] = &[1];

/// Upper bound for every configured interval (one year)
pub const MAX_INTERVAL_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Top-level coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Schema version (always 1 for v1)
    pub version: u32,

    #[serde(default)]
    pub claims: ClaimSettings,

    /// Maximum retained resolution results
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default)]
    pub resolution: ResolutionSettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub deployment: DeploymentSettings,
}

fn default_history_capacity() -> usize {
    1000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            version: 1,
            claims: ClaimSettings::default(),
            history_capacity: default_history_capacity(),
            resolution: ResolutionSettings::default(),
            pipeline: PipelineSettings::default(),
            deployment: DeploymentSettings::default(),
        }
    }
}

/// Resource claim behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClaimSettings {
    /// TTL applied when a claim does not carry its own (None = no expiry)
    pub default_ttl_ms: Option<u64>,
    /// Admission attempts made by the orchestrator before giving up
    pub retry_attempts: u32,
    /// First backoff delay, doubled per attempt
    pub retry_backoff_ms: u64,
}

impl Default for ClaimSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: Some(30 * 60 * 1000),
            retry_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolutionSettings {
    /// Slot length used by `split-by-time-window`
    pub time_window_ms: u64,
}

impl Default for ResolutionSettings {
    fn default() -> Self {
        Self {
            time_window_ms: 5 * 60 * 1000,
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    /// Global ceiling on concurrently executing tasks
    pub max_concurrency: usize,
    pub default_task_timeout_ms: Option<u64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get().max(1),
            default_task_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeploymentSettings {
    /// Per-repository duration estimate when no cost hint is supplied
    pub default_repository_cost_ms: u64,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            default_repository_cost_ms: 300_000,
        }
    }
}

impl CoordinatorConfig {
    /// Load from a YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(content)?;

        let version = raw
            .get("version")
            .ok_or_else(|| {
                CoordinationError::config(
                    "Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.",
                )
            })?
            .as_u64()
            .ok_or_else(|| CoordinationError::config("'version' must be an integer"))?;

        if !SUPPORTED_CONFIG_VERSIONS.contains(&(version as u32)) {
            return Err(CoordinationError::Config(format!(
                "Unsupported configuration version {}. Supported versions: {:?}",
                version, SUPPORTED_CONFIG_VERSIONS
            )));
        }

        let config: Self = serde_yaml::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_CONFIG_VERSIONS.contains(&self.version) {
            return Err(CoordinationError::Config(format!(
                "Unsupported configuration version {}",
                self.version
            )));
        }
        if self.pipeline.max_concurrency == 0 {
            return Err(CoordinationError::config(
                "pipeline.max_concurrency must be at least 1",
            ));
        }
        if self.history_capacity == 0 {
            return Err(CoordinationError::config(
                "history_capacity must be at least 1",
            ));
        }
        if self.claims.default_ttl_ms == Some(0) {
            return Err(CoordinationError::config(
                "claims.default_ttl_ms must be positive (use null for no expiry)",
            ));
        }
        if self.pipeline.default_task_timeout_ms == Some(0) {
            return Err(CoordinationError::config(
                "pipeline.default_task_timeout_ms must be positive",
            ));
        }

        let intervals = [
            ("claims.default_ttl_ms", self.claims.default_ttl_ms),
            ("claims.retry_backoff_ms", Some(self.claims.retry_backoff_ms)),
            ("resolution.time_window_ms", Some(self.resolution.time_window_ms)),
            (
                "pipeline.default_task_timeout_ms",
                self.pipeline.default_task_timeout_ms,
            ),
        ];
        for (field, value) in intervals {
            if let Some(ms) = value.filter(|ms| *ms > MAX_INTERVAL_MS) {
                return Err(CoordinationError::Config(format!(
                    "{} is {}ms, above the {}ms limit",
                    field, ms, MAX_INTERVAL_MS
                )));
            }
        }
        Ok(())
    }
}

/// What to do when the requested repositories contain a cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePolicy {
    /// Order what can be ordered, flag the cycles for operator review
    #[default]
    Advisory,
    /// Demand a total order; any cycle fails the request
    Strict,
}

/// Options for `coordinate_deployment`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentOptions {
    /// Run multi-repository waves as parallel stages
    pub allow_parallel: bool,
    /// Skip the resource conflict check
    pub ignore_conflicts: bool,
    /// Per-task timeout for the generated stages
    pub timeout_ms: Option<u64>,
    pub cycle_policy: CyclePolicy,
    /// Per-repository duration estimates
    pub cost_hints_ms: HashMap<RepoId, u64>,
    /// On a failed run, roll back the repositories that were deployed
    pub rollback_on_failure: bool,
}

impl DeploymentOptions {
    pub fn parallel(mut self) -> Self {
        self.allow_parallel = true;
        self
    }

    pub fn strict(mut self) -> Self {
        self.cycle_policy = CyclePolicy::Strict;
        self
    }

    pub fn rollback_on_failure(mut self) -> Self {
        self.rollback_on_failure = true;
        self
    }

    pub fn with_cost_hint(mut self, repo: impl Into<RepoId>, cost_ms: u64) -> Self {
        self.cost_hints_ms.insert(repo.into(), cost_ms);
        self
    }
}
