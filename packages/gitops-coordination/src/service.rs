//! Wiring of the three components around one store, provider, sink and clock

use crate::analyzer::{Coordination, DependencyAnalyzer};
use crate::clock::{Clock, SystemClock};
use crate::config::{CoordinatorConfig, DeploymentOptions};
use crate::coordinator::SharedResourceCoordinator;
use crate::dependency_graph::DependencyGraphStore;
use crate::error::{CoordinationError, Result};
use crate::events::{EventSink, TracingEventSink};
use crate::orchestration::{Orchestration, OrchestrationStatus};
use crate::orchestrator::PipelineOrchestrator;
use crate::pipeline::{PipelineConfig, PipelineOptions, TaskHandler};
use crate::provider::RepositoryMetadataProvider;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Completed,
    Failed,
    /// Failed, and every deployed repository was rolled back
    RolledBack,
    Cancelled,
}

/// Plan and outcome of one `deploy` call
#[derive(Debug, Clone)]
pub struct Deployment {
    pub coordination: Coordination,
    pub orchestration: Orchestration,
    /// Present when the run failed with `rollback_on_failure` set and
    /// something had been deployed
    pub rollback: Option<Orchestration>,
}

impl Deployment {
    pub fn status(&self) -> DeploymentStatus {
        match (
            self.orchestration.status,
            self.rollback.as_ref().map(|r| r.status),
        ) {
            (OrchestrationStatus::Completed, _) => DeploymentStatus::Completed,
            (OrchestrationStatus::Cancelled, _) => DeploymentStatus::Cancelled,
            (_, Some(OrchestrationStatus::Completed)) => DeploymentStatus::RolledBack,
            _ => DeploymentStatus::Failed,
        }
    }
}

pub struct CoordinationService {
    config: CoordinatorConfig,
    analyzer: Arc<DependencyAnalyzer>,
    coordinator: Arc<SharedResourceCoordinator>,
    orchestrator: Arc<PipelineOrchestrator>,
}

impl CoordinationService {
    pub fn builder(provider: Arc<dyn RepositoryMetadataProvider>) -> CoordinationServiceBuilder {
        CoordinationServiceBuilder::new(provider)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &Arc<DependencyAnalyzer> {
        &self.analyzer
    }

    pub fn coordinator(&self) -> &Arc<SharedResourceCoordinator> {
        &self.coordinator
    }

    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    pub fn register_handler(&self, handler: Arc<dyn TaskHandler>) {
        self.orchestrator.register_handler(handler);
    }

    /// Plan a deployment and run its waves through the orchestrator.
    ///
    /// Fails with `InvalidInput` when every requested repository sits on a
    /// cycle and nothing is left to deploy. With `rollback_on_failure`, a
    /// failed run is followed by `rollback` tasks for the repositories it
    /// deployed, latest wave first.
    pub async fn deploy<S: AsRef<str>>(
        &self,
        repositories: &[S],
        options: DeploymentOptions,
        pipeline: PipelineOptions,
    ) -> Result<Deployment> {
        let rollback_on_failure = options.rollback_on_failure;
        let coordination = self
            .analyzer
            .coordinate_deployment(repositories, options)
            .await?;
        if coordination.stages.is_empty() {
            return Err(CoordinationError::InvalidInput(format!(
                "no deployable repositories among {}",
                coordination.repositories.join(", ")
            )));
        }

        let orchestration = self
            .orchestrator
            .orchestrate_pipeline(coordination.to_pipeline_config(pipeline.clone()))
            .await?;
        info!(
            "Deployment {} finished as {}",
            coordination.id, orchestration.status
        );

        let rollback =
            if rollback_on_failure && orchestration.status == OrchestrationStatus::Failed {
                self.roll_back(&coordination, &orchestration, pipeline).await?
            } else {
                None
            };

        Ok(Deployment {
            coordination,
            orchestration,
            rollback,
        })
    }

    async fn roll_back(
        &self,
        coordination: &Coordination,
        orchestration: &Orchestration,
        pipeline: PipelineOptions,
    ) -> Result<Option<Orchestration>> {
        let stages = coordination.rollback_plan_for(orchestration);
        if stages.is_empty() {
            info!("Deployment {} deployed nothing; no rollback", coordination.id);
            return Ok(None);
        }

        let repositories: Vec<String> = stages
            .iter()
            .flat_map(|stage| stage.tasks.iter().map(|t| t.repository.clone()))
            .collect();
        warn!(
            "Deployment {} failed, rolling back {}",
            coordination.id,
            repositories.join(", ")
        );

        let config = PipelineConfig::new(
            format!("rollback-{}", coordination.id),
            repositories,
            stages,
        )
        .with_options(pipeline);
        let rollback = self.orchestrator.orchestrate_pipeline(config).await?;
        info!(
            "Rollback of deployment {} finished as {}",
            coordination.id, rollback.status
        );
        Ok(Some(rollback))
    }
}

pub struct CoordinationServiceBuilder {
    config: CoordinatorConfig,
    provider: Arc<dyn RepositoryMetadataProvider>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<DependencyGraphStore>>,
}

impl CoordinationServiceBuilder {
    pub fn new(provider: Arc<dyn RepositoryMetadataProvider>) -> Self {
        Self {
            config: CoordinatorConfig::default(),
            provider,
            events: Arc::new(TracingEventSink),
            clock: Arc::new(SystemClock),
            store: None,
        }
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a pre-populated dependency store
    pub fn store(mut self, store: Arc<DependencyGraphStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<CoordinationService> {
        self.config.validate()?;

        let coordinator = Arc::new(SharedResourceCoordinator::new(
            &self.config,
            self.provider.clone(),
            self.events.clone(),
            self.clock.clone(),
        ));
        let analyzer = Arc::new(DependencyAnalyzer::new(
            self.config.deployment.clone(),
            self.store.unwrap_or_default(),
            self.provider,
            coordinator.clone(),
            self.clock.clone(),
        ));
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            self.config.pipeline.clone(),
            coordinator.clone(),
            self.events,
            self.clock,
        ));

        Ok(CoordinationService {
            config: self.config,
            analyzer,
            coordinator,
            orchestrator,
        })
    }
}
