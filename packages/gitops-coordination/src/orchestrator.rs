use crate::clock::Clock;
use crate::config::PipelineSettings;
use crate::coordinator::SharedResourceCoordinator;
use crate::error::{CoordinationError, Result};
use crate::events::{CoordinationEvent, EventSink};
use crate::orchestration::{
    Orchestration, OrchestrationStatus, StageStatus, TaskRun, TaskStatus,
};
use crate::pipeline::{PipelineConfig, TaskContext, TaskHandler, TaskOutput, TaskSpec};
use crate::resources::{ClaimId, ClaimOperation, ResourceId};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct OrchestrationEntry {
    state: Mutex<Orchestration>,
    cancel: CancellationToken,
}

/// Handle to a pipeline running in the background
pub struct OrchestrationHandle {
    id: Uuid,
    join: JoinHandle<Orchestration>,
}

impl OrchestrationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the run to settle and return the final snapshot
    pub async fn wait(self) -> Result<Orchestration> {
        let id = self.id;
        self.join.await.map_err(|e| {
            CoordinationError::TaskFailed(format!("orchestration {} runner aborted: {}", id, e))
        })
    }
}

/// Executes staged, multi-repository pipelines on a bounded worker pool
pub struct PipelineOrchestrator {
    coordinator: Arc<SharedResourceCoordinator>,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    orchestrations: DashMap<Uuid, Arc<OrchestrationEntry>>,
    workers: Arc<Semaphore>,
    settings: PipelineSettings,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl PipelineOrchestrator {
    pub fn new(
        settings: PipelineSettings,
        coordinator: Arc<SharedResourceCoordinator>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            coordinator,
            handlers: RwLock::new(HashMap::new()),
            orchestrations: DashMap::new(),
            workers: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            settings,
            events,
            clock,
        }
    }

    /// Register a task handler (replaces any handler for the same type)
    pub fn register_handler(&self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type().to_string();
        info!("Registered handler for task type '{}'", task_type);
        self.handlers.write().insert(task_type, handler);
    }

    fn handler_for(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(task_type).cloned()
    }

    /// Run a pipeline to completion and return the final snapshot.
    ///
    /// Task failures are reported in the snapshot, not as `Err`; only invalid
    /// configurations fail the call.
    pub async fn orchestrate_pipeline(&self, config: PipelineConfig) -> Result<Orchestration> {
        let entry = self.prepare(&config)?;
        Ok(self.run(entry, config).await)
    }

    /// Spawn a pipeline and return immediately
    pub fn start_pipeline(self: &Arc<Self>, config: PipelineConfig) -> Result<OrchestrationHandle> {
        let entry = self.prepare(&config)?;
        let id = entry.state.lock().id;
        let this = Arc::clone(self);
        let join = tokio::spawn(async move { this.run(entry, config).await });
        Ok(OrchestrationHandle { id, join })
    }

    fn prepare(&self, config: &PipelineConfig) -> Result<Arc<OrchestrationEntry>> {
        config.validate()?;

        let orchestration = Orchestration::new(config, self.clock.now());
        let id = orchestration.id;
        let entry = Arc::new(OrchestrationEntry {
            state: Mutex::new(orchestration),
            cancel: CancellationToken::new(),
        });
        self.orchestrations.insert(id, Arc::clone(&entry));
        debug!("Orchestration {} created for pipeline '{}'", id, config.name);
        Ok(entry)
    }

    async fn run(&self, entry: Arc<OrchestrationEntry>, config: PipelineConfig) -> Orchestration {
        let id = {
            let mut orchestration = entry.state.lock();
            if let Err(e) = orchestration.start(self.clock.now()) {
                // Cancelled before the first stage
                warn!("Orchestration {} not started: {}", orchestration.id, e);
                skip_remaining(&mut orchestration, 0);
                return orchestration.clone();
            }
            orchestration.id
        };

        info!(
            "Starting orchestration {} ('{}') over {} repositories",
            id,
            config.name,
            config.repositories.len()
        );
        info!("Execution plan:\n{}", config.execution_plan());

        let runner = TaskRunner {
            orchestration_id: id,
            entry: Arc::clone(&entry),
            coordinator: Arc::clone(&self.coordinator),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
            workers: Arc::clone(&self.workers),
            pipeline_permits: config
                .options
                .max_concurrency
                .map(|n| Arc::new(Semaphore::new(n))),
        };

        let mut failure: Option<String> = None;

        for (stage_index, stage) in config.stages.iter().enumerate() {
            if entry.cancel.is_cancelled() {
                info!("Orchestration {} cancelled before stage '{}'", id, stage.name);
                skip_remaining(&mut entry.state.lock(), stage_index);
                break;
            }
            if failure.is_some() {
                skip_remaining(&mut entry.state.lock(), stage_index);
                break;
            }

            let started_at = self.clock.now();
            {
                let mut orchestration = entry.state.lock();
                let run = &mut orchestration.stages[stage_index];
                run.status = StageStatus::Running;
                run.started_at = Some(started_at);
            }
            info!(
                "Orchestration {}: stage {} '{}' - {} tasks{}",
                id,
                stage_index + 1,
                stage.name,
                stage.tasks.len(),
                if stage.parallel { " (parallel)" } else { "" }
            );
            self.events.publish(CoordinationEvent::StageStarted {
                orchestration_id: id,
                stage: stage.name.clone(),
                index: stage_index,
                at: started_at,
            });

            let deadline = stage
                .timeout_ms
                .map(|ms| Instant::now() + Duration::from_millis(ms));

            let timeouts: Vec<Option<u64>> = stage
                .tasks
                .iter()
                .map(|t| {
                    t.timeout_ms
                        .or(config.options.task_timeout_ms)
                        .or(self.settings.default_task_timeout_ms)
                })
                .collect();

            let outcomes: Vec<TaskOutcome> = if stage.parallel {
                // Settle every task; one failure never aborts its siblings
                let handles: Vec<_> = stage
                    .tasks
                    .iter()
                    .enumerate()
                    .map(|(task_index, task)| {
                        let plan = TaskPlan {
                            stage_index,
                            stage: stage.name.clone(),
                            task_index,
                            task: task.clone(),
                            handler: self.handler_for(&task.task_type),
                            timeout_ms: timeouts[task_index],
                            deadline,
                        };
                        tokio::spawn(runner.clone().run_task(plan))
                    })
                    .collect();

                futures::future::join_all(handles)
                    .await
                    .into_iter()
                    .enumerate()
                    .map(|(task_index, joined)| {
                        joined.unwrap_or_else(|e| {
                            runner.record_panic(
                                stage_index,
                                &stage.name,
                                task_index,
                                &stage.tasks[task_index],
                                &e.to_string(),
                            )
                        })
                    })
                    .collect()
            } else {
                let mut outcomes = Vec::with_capacity(stage.tasks.len());
                let mut halted = false;

                for (task_index, task) in stage.tasks.iter().enumerate() {
                    if halted || entry.cancel.is_cancelled() {
                        runner.record_skipped(stage_index, task_index);
                        outcomes.push(TaskOutcome::skipped());
                        continue;
                    }

                    let plan = TaskPlan {
                        stage_index,
                        stage: stage.name.clone(),
                        task_index,
                        task: task.clone(),
                        handler: self.handler_for(&task.task_type),
                        timeout_ms: timeouts[task_index],
                        deadline,
                    };
                    let outcome = tokio::spawn(runner.clone().run_task(plan))
                        .await
                        .unwrap_or_else(|e| {
                            runner.record_panic(
                                stage_index,
                                &stage.name,
                                task_index,
                                task,
                                &e.to_string(),
                            )
                        });

                    if outcome.is_fatal() {
                        halted = true;
                    }
                    outcomes.push(outcome);
                }
                outcomes
            };

            let fatal: Vec<&TaskOutcome> = outcomes.iter().filter(|o| o.is_fatal()).collect();
            let stage_status = if fatal.is_empty() {
                StageStatus::Completed
            } else {
                StageStatus::Failed
            };

            if let Some(first) = fatal.first() {
                let reason = format!(
                    "stage '{}': {} task(s) failed; first: {}",
                    stage.name,
                    fatal.len(),
                    first.error.as_deref().unwrap_or("unknown error")
                );
                error!("Orchestration {}: {}", id, reason);
                failure = Some(reason);
            }

            let completed_at = self.clock.now();
            {
                let mut orchestration = entry.state.lock();
                let run = &mut orchestration.stages[stage_index];
                run.status = stage_status;
                run.completed_at = Some(completed_at);
            }
            self.events.publish(CoordinationEvent::StageCompleted {
                orchestration_id: id,
                stage: stage.name.clone(),
                index: stage_index,
                status: stage_status.as_str().to_string(),
                at: completed_at,
            });
        }

        self.finish(&entry, failure)
    }

    fn finish(&self, entry: &OrchestrationEntry, failure: Option<String>) -> Orchestration {
        let now = self.clock.now();
        let (snapshot, event) = {
            let mut orchestration = entry.state.lock();
            let id = orchestration.id;

            let event = if orchestration.status == OrchestrationStatus::Cancelled {
                // cancel_orchestration already published
                None
            } else {
                match failure {
                    Some(reason) => match orchestration.fail(reason.clone(), now) {
                        Ok(()) => Some(CoordinationEvent::OrchestrationFailed {
                            orchestration_id: id,
                            reason,
                            at: now,
                        }),
                        Err(e) => {
                            warn!("Orchestration {}: {}", id, e);
                            None
                        }
                    },
                    None => match orchestration.complete(now) {
                        Ok(()) => Some(CoordinationEvent::OrchestrationCompleted {
                            orchestration_id: id,
                            at: now,
                        }),
                        Err(e) => {
                            warn!("Orchestration {}: {}", id, e);
                            None
                        }
                    },
                }
            };
            (orchestration.clone(), event)
        };

        let (settled, total) = snapshot.progress();
        info!(
            "Orchestration {} finished as {} ({}/{} tasks settled)",
            snapshot.id, snapshot.status, settled, total
        );
        if let Some(event) = event {
            self.events.publish(event);
        }
        snapshot
    }

    /// Request cooperative cancellation.
    ///
    /// Running tasks finish; tasks not yet started are skipped and release any
    /// claims they acquired.
    pub fn cancel_orchestration(&self, id: Uuid) -> Result<Orchestration> {
        let entry = self.entry(id)?;

        let snapshot = {
            let mut orchestration = entry.state.lock();
            if orchestration.is_terminal() {
                return Err(CoordinationError::NotRunning {
                    id,
                    status: orchestration.status,
                });
            }
            orchestration.cancel(self.clock.now())?;
            orchestration.clone()
        };
        entry.cancel.cancel();

        info!("Orchestration {} cancelled", id);
        self.events.publish(CoordinationEvent::OrchestrationCancelled {
            orchestration_id: id,
            at: snapshot.cancelled_at.unwrap_or_else(|| self.clock.now()),
        });
        Ok(snapshot)
    }

    /// Snapshot of one orchestration
    pub fn get_orchestration_status(&self, id: Uuid) -> Result<Orchestration> {
        let entry = self.entry(id)?;
        let snapshot = entry.state.lock().clone();
        Ok(snapshot)
    }

    /// Non-terminal orchestrations, most recently started first
    pub fn list_active_orchestrations(&self) -> Vec<Orchestration> {
        let mut active: Vec<Orchestration> = self
            .orchestrations
            .iter()
            .map(|entry| entry.value().state.lock().clone())
            .filter(|o| !o.is_terminal())
            .collect();
        active.sort_by(|a, b| {
            let a_start = a.started_at.unwrap_or(a.created_at);
            let b_start = b.started_at.unwrap_or(b.created_at);
            b_start.cmp(&a_start)
        });
        active
    }

    fn entry(&self, id: Uuid) -> Result<Arc<OrchestrationEntry>> {
        self.orchestrations
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoordinationError::NotFound(format!("orchestration {}", id)))
    }
}

fn skip_remaining(orchestration: &mut Orchestration, from_stage: usize) {
    for stage in orchestration.stages.iter_mut().skip(from_stage) {
        stage.status = StageStatus::Skipped;
        for task in &mut stage.tasks {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Skipped;
            }
        }
    }
}

/// Releases held claims when dropped, on every exit path (including panics)
struct ClaimGuard {
    coordinator: Arc<SharedResourceCoordinator>,
    claims: Vec<(ResourceId, ClaimId)>,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        for (resource_id, claim_id) in self.claims.drain(..) {
            self.coordinator.release_resource(resource_id, claim_id);
        }
    }
}

struct TaskPlan {
    stage_index: usize,
    stage: String,
    task_index: usize,
    task: TaskSpec,
    handler: Option<Arc<dyn TaskHandler>>,
    timeout_ms: Option<u64>,
    deadline: Option<Instant>,
}

struct TaskOutcome {
    status: TaskStatus,
    best_effort: bool,
    error: Option<String>,
}

impl TaskOutcome {
    fn skipped() -> Self {
        Self {
            status: TaskStatus::Skipped,
            best_effort: false,
            error: None,
        }
    }

    /// Fails the enclosing stage
    fn is_fatal(&self) -> bool {
        self.status == TaskStatus::Failed && !self.best_effort
    }
}

#[derive(Clone)]
struct TaskRunner {
    orchestration_id: Uuid,
    entry: Arc<OrchestrationEntry>,
    coordinator: Arc<SharedResourceCoordinator>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    workers: Arc<Semaphore>,
    pipeline_permits: Option<Arc<Semaphore>>,
}

impl TaskRunner {
    async fn run_task(self, plan: TaskPlan) -> TaskOutcome {
        let TaskPlan {
            stage_index,
            stage,
            task_index,
            task,
            handler,
            timeout_ms,
            deadline,
        } = plan;
        let best_effort = self.update_task(stage_index, task_index, |_| {});

        // Pipeline ceiling first, so tasks queued behind it hold no worker
        let _pipeline = match &self.pipeline_permits {
            Some(permits) => match Arc::clone(permits).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(e) => {
                    return self.record_failure(stage_index, &stage, task_index, &task, e.to_string())
                }
            },
            None => None,
        };
        let _worker = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => return self.record_failure(stage_index, &stage, task_index, &task, e.to_string()),
        };

        if self.entry.cancel.is_cancelled() {
            return self.record_skipped(stage_index, task_index);
        }

        let mut guard = ClaimGuard {
            coordinator: Arc::clone(&self.coordinator),
            claims: Vec::with_capacity(task.required_resources.len()),
        };
        for requirement in &task.required_resources {
            let operation = ClaimOperation {
                operation_type: task.task_type.clone(),
                exclusive: requirement.exclusive,
                ttl_ms: None,
            };
            let claimed = tokio::select! {
                claimed = self.coordinator.claim_resource_with_retry(
                    requirement.resource_id,
                    &task.repository,
                    &operation,
                ) => claimed,
                _ = self.entry.cancel.cancelled() => {
                    drop(guard);
                    return self.record_skipped(stage_index, task_index);
                }
            };
            match claimed {
                Ok(claim_id) => guard.claims.push((requirement.resource_id, claim_id)),
                Err(e) => {
                    drop(guard);
                    return self.record_failure(stage_index, &stage, task_index, &task, e.to_string());
                }
            }
        }

        // Cancelled while waiting for claims: never started, give them back
        if self.entry.cancel.is_cancelled() {
            drop(guard);
            return self.record_skipped(stage_index, task_index);
        }

        let started_at = self.clock.now();
        self.update_task(stage_index, task_index, |run| {
            run.status = TaskStatus::Running;
            run.started_at = Some(started_at);
        });
        debug!(
            "Orchestration {}: task {} for {} started",
            self.orchestration_id, task.task_type, task.repository
        );
        self.events.publish(CoordinationEvent::TaskStarted {
            orchestration_id: self.orchestration_id,
            stage: stage.clone(),
            repository: task.repository.clone(),
            task_type: task.task_type.clone(),
            at: started_at,
        });

        let ctx = TaskContext {
            orchestration_id: self.orchestration_id,
            stage: stage.clone(),
            repository: task.repository.clone(),
            task_type: task.task_type.clone(),
            claims: guard.claims.clone(),
            cancellation: self.entry.cancel.clone(),
        };

        let result = match handler {
            Some(handler) => {
                execute_with_timeout(handler.as_ref(), &ctx, effective_timeout(timeout_ms, deadline))
                    .await
            }
            None => Err(CoordinationError::Config(format!(
                "No handler registered for task type '{}'",
                task.task_type
            ))),
        };

        // Release before the task is reported settled
        drop(guard);

        match result {
            Ok(output) => {
                let completed_at = self.clock.now();
                self.update_task(stage_index, task_index, |run| {
                    run.status = TaskStatus::Succeeded;
                    run.output = Some(output);
                    run.completed_at = Some(completed_at);
                });
                self.events.publish(CoordinationEvent::TaskCompleted {
                    orchestration_id: self.orchestration_id,
                    stage,
                    repository: task.repository,
                    task_type: task.task_type,
                    status: TaskStatus::Succeeded.as_str().to_string(),
                    error: None,
                    at: completed_at,
                });
                TaskOutcome {
                    status: TaskStatus::Succeeded,
                    best_effort,
                    error: None,
                }
            }
            Err(e) => self.record_failure(stage_index, &stage, task_index, &task, e.to_string()),
        }
    }

    /// Apply `f` to the task record; returns the task's best-effort flag
    fn update_task(&self, stage_index: usize, task_index: usize, f: impl FnOnce(&mut TaskRun)) -> bool {
        let mut orchestration = self.entry.state.lock();
        match orchestration
            .stages
            .get_mut(stage_index)
            .and_then(|s| s.tasks.get_mut(task_index))
        {
            Some(run) => {
                f(run);
                run.best_effort
            }
            None => false,
        }
    }

    fn record_failure(
        &self,
        stage_index: usize,
        stage: &str,
        task_index: usize,
        task: &TaskSpec,
        error: String,
    ) -> TaskOutcome {
        let completed_at = self.clock.now();
        let best_effort = self.update_task(stage_index, task_index, |run| {
            run.status = TaskStatus::Failed;
            run.error = Some(error.clone());
            run.completed_at = Some(completed_at);
        });

        if best_effort {
            warn!(
                "Orchestration {}: best-effort task {} for {} failed: {}",
                self.orchestration_id, task.task_type, task.repository, error
            );
        } else {
            error!(
                "Orchestration {}: task {} for {} failed: {}",
                self.orchestration_id, task.task_type, task.repository, error
            );
        }

        self.events.publish(CoordinationEvent::TaskCompleted {
            orchestration_id: self.orchestration_id,
            stage: stage.to_string(),
            repository: task.repository.clone(),
            task_type: task.task_type.clone(),
            status: TaskStatus::Failed.as_str().to_string(),
            error: Some(error.clone()),
            at: completed_at,
        });

        TaskOutcome {
            status: TaskStatus::Failed,
            best_effort,
            error: Some(format!("{} for {}: {}", task.task_type, task.repository, error)),
        }
    }

    fn record_skipped(&self, stage_index: usize, task_index: usize) -> TaskOutcome {
        self.update_task(stage_index, task_index, |run| {
            run.status = TaskStatus::Skipped;
        });
        TaskOutcome::skipped()
    }

    fn record_panic(
        &self,
        stage_index: usize,
        stage: &str,
        task_index: usize,
        task: &TaskSpec,
        error: &str,
    ) -> TaskOutcome {
        self.record_failure(
            stage_index,
            stage,
            task_index,
            task,
            format!("task runner panicked: {}", error),
        )
    }
}

/// Task timeout capped by the stage deadline
fn effective_timeout(timeout_ms: Option<u64>, deadline: Option<Instant>) -> Option<Duration> {
    let task = timeout_ms.map(Duration::from_millis);
    let stage = deadline.map(|d| d.saturating_duration_since(Instant::now()));
    match (task, stage) {
        (Some(t), Some(s)) => Some(t.min(s)),
        (t, s) => t.or(s),
    }
}

async fn execute_with_timeout(
    handler: &dyn TaskHandler,
    ctx: &TaskContext,
    timeout: Option<Duration>,
) -> Result<TaskOutput> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, handler.execute(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(CoordinationError::Timeout(format!(
                "task {} for {} timed out after {}ms",
                ctx.task_type,
                ctx.repository,
                limit.as_millis()
            ))),
        },
        None => handler.execute(ctx).await,
    }
}
