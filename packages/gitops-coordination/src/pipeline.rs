use crate::conflict::Conflict;
use crate::dependency_graph::RepoId;
use crate::error::{CoordinationError, Result};
use crate::resources::{ClaimId, ResourceId, ResourceRequirement};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One unit of work against one repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Handler key, e.g. `deploy`, `rollback`, `validate`
    pub task_type: String,
    pub repository: RepoId,
    #[serde(default)]
    pub required_resources: Vec<ResourceRequirement>,
    /// Failure is recorded but does not fail the orchestration
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, repository: impl Into<RepoId>) -> Self {
        Self {
            task_type: task_type.into(),
            repository: repository.into(),
            required_resources: Vec::new(),
            best_effort: false,
            timeout_ms: None,
        }
    }

    /// Add a resource requirement. Requiring a resource twice keeps one
    /// requirement, exclusive if either request was.
    pub fn requires(mut self, resource_id: ResourceId, exclusive: bool) -> Self {
        match self
            .required_resources
            .iter_mut()
            .find(|r| r.resource_id == resource_id)
        {
            Some(existing) => existing.exclusive |= exclusive,
            None => self.required_resources.push(ResourceRequirement {
                resource_id,
                exclusive,
            }),
        }
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Group of tasks; stage N+1 starts only after every task of stage N settled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub parallel: bool,
    #[serde(default)]
    pub estimated_duration_ms: u64,
    /// Deadline shared by all tasks of the stage
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub tasks: Vec<TaskSpec>,
}

impl StageSpec {
    pub fn sequential(name: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        Self {
            name: name.into(),
            parallel: false,
            estimated_duration_ms: 0,
            timeout_ms: None,
            tasks,
        }
    }

    pub fn parallel(name: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        Self {
            parallel: true,
            ..Self::sequential(name, tasks)
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Per-pipeline execution options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Ceiling on concurrent tasks of this pipeline (global pool still applies)
    pub max_concurrency: Option<usize>,
    /// Default per-task timeout
    pub task_timeout_ms: Option<u64>,
    /// Task types whose failures are tolerated
    pub best_effort_task_types: BTreeSet<String>,
}

impl PipelineOptions {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_task_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.task_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn tolerate(mut self, task_type: impl Into<String>) -> Self {
        self.best_effort_task_types.insert(task_type.into());
        self
    }

    pub fn is_best_effort(&self, task: &TaskSpec) -> bool {
        task.best_effort || self.best_effort_task_types.contains(&task.task_type)
    }
}

/// Input to `orchestrate_pipeline`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub repositories: Vec<RepoId>,
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub options: PipelineOptions,
    /// Conflicts detected while planning, carried for visibility
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>, repositories: Vec<RepoId>, stages: Vec<StageSpec>) -> Self {
        Self {
            name: name.into(),
            repositories,
            stages,
            options: PipelineOptions::default(),
            conflicts: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.repositories.iter().all(|r| r.trim().is_empty()) {
            return Err(CoordinationError::invalid_input(
                "pipeline requires at least one repository",
            ));
        }
        if self.stages.is_empty() {
            return Err(CoordinationError::invalid_input(
                "pipeline requires at least one stage",
            ));
        }
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(CoordinationError::invalid_input("stage name must not be empty"));
            }
            if let Some(task) = stage.tasks.iter().find(|t| t.task_type.trim().is_empty()) {
                return Err(CoordinationError::InvalidInput(format!(
                    "task for {} in stage {} has no type",
                    task.repository, stage.name
                )));
            }
            // A second claim on the same resource would conflict with the first
            for task in &stage.tasks {
                let mut seen = BTreeSet::new();
                if let Some(dup) = task
                    .required_resources
                    .iter()
                    .find(|r| !seen.insert(r.resource_id))
                {
                    return Err(CoordinationError::InvalidInput(format!(
                        "task {} for {} in stage {} requires resource {} twice",
                        task.task_type, task.repository, stage.name, dup.resource_id
                    )));
                }
            }
        }
        if self.options.max_concurrency == Some(0) {
            return Err(CoordinationError::invalid_input(
                "max_concurrency must be at least 1",
            ));
        }
        Ok(())
    }

    /// Human-readable plan (for logging)
    pub fn execution_plan(&self) -> String {
        self.stages
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                let repos: Vec<&str> = stage.tasks.iter().map(|t| t.repository.as_str()).collect();
                format!(
                    "Stage {} {}: {}{}",
                    i + 1,
                    stage.name,
                    repos.join(", "),
                    if stage.parallel { " (parallel)" } else { "" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Passed to handlers
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub orchestration_id: Uuid,
    pub stage: String,
    pub repository: RepoId,
    pub task_type: String,
    /// Claims held for the duration of the task
    pub claims: Vec<(ResourceId, ClaimId)>,
    /// Fires when the orchestration is cancelled; handlers may stop early
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub message: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TaskOutput {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            data: serde_json::Value::Null,
        }
    }
}

/// Pluggable task executor, keyed by task type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> &str;

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput>;
}
