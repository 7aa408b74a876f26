use crate::conflict::Conflict;
use crate::dependency_graph::RepoId;
use crate::error::{CoordinationError, Result};
use crate::pipeline::{PipelineConfig, StageSpec, TaskOutput, TaskSpec};
use crate::resources::ResourceRequirement;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Orchestration lifecycle: `pending -> running -> {completed | failed | cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OrchestrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationStatus::Pending => "pending",
            OrchestrationStatus::Running => "running",
            OrchestrationStatus::Completed => "completed",
            OrchestrationStatus::Failed => "failed",
            OrchestrationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed
                | OrchestrationStatus::Failed
                | OrchestrationStatus::Cancelled
        )
    }
}

impl std::fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    /// At least one non-best-effort task failed
    Failed,
    /// Never started (earlier failure or cancellation)
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// Progress of one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_type: String,
    pub repository: RepoId,
    pub required_resources: Vec<ResourceRequirement>,
    pub best_effort: bool,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub output: Option<TaskOutput>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    fn new(spec: &TaskSpec, best_effort: bool) -> Self {
        Self {
            task_type: spec.task_type.clone(),
            repository: spec.repository.clone(),
            required_resources: spec.required_resources.clone(),
            best_effort,
            status: TaskStatus::Pending,
            error: None,
            output: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Progress of one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRun {
    pub name: String,
    pub parallel: bool,
    pub estimated_duration_ms: u64,
    pub status: StageStatus,
    pub tasks: Vec<TaskRun>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRun {
    fn new(spec: &StageSpec, config: &PipelineConfig) -> Self {
        Self {
            name: spec.name.clone(),
            parallel: spec.parallel,
            estimated_duration_ms: spec.estimated_duration_ms,
            status: StageStatus::Pending,
            tasks: spec
                .tasks
                .iter()
                .map(|t| TaskRun::new(t, config.options.is_best_effort(t)))
                .collect(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// One execution of a pipeline. Snapshots handed to callers are clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orchestration {
    pub id: Uuid,
    pub name: String,
    pub status: OrchestrationStatus,
    pub repositories: Vec<RepoId>,
    pub stages: Vec<StageRun>,
    pub conflicts: Vec<Conflict>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Orchestration {
    /// Create a pending orchestration
    pub fn new(config: &PipelineConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: config.name.clone(),
            status: OrchestrationStatus::Pending,
            repositories: config.repositories.clone(),
            stages: config
                .stages
                .iter()
                .map(|s| StageRun::new(s, config))
                .collect(),
            conflicts: config.conflicts.clone(),
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
        }
    }

    fn transition_error(&self, to: OrchestrationStatus) -> CoordinationError {
        CoordinationError::InvalidStateTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// Transition: PENDING → RUNNING
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            OrchestrationStatus::Pending => {
                self.status = OrchestrationStatus::Running;
                self.started_at = Some(now);
                Ok(())
            }
            _ => Err(self.transition_error(OrchestrationStatus::Running)),
        }
    }

    /// Transition: RUNNING → COMPLETED
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            OrchestrationStatus::Running => {
                self.status = OrchestrationStatus::Completed;
                self.completed_at = Some(now);
                Ok(())
            }
            _ => Err(self.transition_error(OrchestrationStatus::Completed)),
        }
    }

    /// Transition: PENDING | RUNNING → FAILED
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.transition_error(OrchestrationStatus::Failed));
        }
        self.status = OrchestrationStatus::Failed;
        self.error = Some(reason.into());
        self.completed_at = Some(now);
        Ok(())
    }

    /// Transition: PENDING | RUNNING → CANCELLED
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.transition_error(OrchestrationStatus::Cancelled));
        }
        self.status = OrchestrationStatus::Cancelled;
        self.cancelled_at = Some(now);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Index of the stage currently running, if any
    pub fn current_stage(&self) -> Option<usize> {
        self.stages
            .iter()
            .position(|s| s.status == StageStatus::Running)
    }

    pub fn failed_tasks(&self) -> Vec<&TaskRun> {
        self.stages
            .iter()
            .flat_map(|s| s.tasks.iter())
            .filter(|t| t.status == TaskStatus::Failed)
            .collect()
    }

    /// (settled, total) task counts
    pub fn progress(&self) -> (usize, usize) {
        let tasks = self.stages.iter().flat_map(|s| s.tasks.iter());
        let total = tasks.clone().count();
        let settled = tasks.filter(|t| t.status.is_settled()).count();
        (settled, total)
    }
}
