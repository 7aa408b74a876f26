//! Dependency Analyzer
//!
//! Builds the dependency view of a repository set (discovering edges through
//! the metadata provider and caching them in the store), detects cycles, and
//! turns the acyclic part into deployment waves.

use crate::clock::Clock;
use crate::config::{CyclePolicy, DeploymentOptions, DeploymentSettings};
use crate::conflict::Conflict;
use crate::coordinator::SharedResourceCoordinator;
use crate::dag::{self, Adjacency, Cycle};
use crate::dependency_graph::{
    compute_affected_repositories, normalize_repositories, repository_importance,
    DependencyGraphStore, DependencyKind, ImpactLevel, RepoId,
};
use crate::error::{CoordinationError, Result};
use crate::orchestration::{Orchestration, TaskStatus};
use crate::pipeline::{PipelineConfig, PipelineOptions, StageSpec, TaskSpec};
use crate::provider::RepositoryMetadataProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEPLOY_TASK: &str = "deploy";
pub const ROLLBACK_TASK: &str = "rollback";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    /// Direct edges among the analyzed repositories
    pub dependency_count: usize,
    pub analyzed_at: DateTime<Utc>,
    /// Requested repositories after normalization
    pub repository_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Requested repositories, trimmed and de-duplicated
    pub repositories: Vec<RepoId>,
    /// Every discovered repository → its direct dependencies
    pub direct_dependencies: BTreeMap<RepoId, Vec<RepoId>>,
    /// Everything a repository reaches. A repository on a cycle reaches
    /// itself and so appears in its own entry.
    pub transitive_dependencies: BTreeMap<RepoId, Vec<RepoId>>,
    pub circular_dependencies: Vec<Cycle>,
    /// Requested repositories left out of the order because they sit on a cycle
    pub cyclic_repositories: Vec<RepoId>,
    pub deployment_order: Vec<Vec<RepoId>>,
    pub metadata: AnalysisMetadata,
}

impl AnalysisResult {
    pub fn has_cycles(&self) -> bool {
        !self.circular_dependencies.is_empty()
    }

    /// Wave plan for logs
    pub fn execution_plan(&self) -> String {
        dag::describe_waves(&self.deployment_order)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectImpact {
    pub repository: RepoId,
    pub kind: DependencyKind,
    pub impact: ImpactLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitiveImpact {
    pub repository: RepoId,
    /// Changed repository first
    pub path: Vec<RepoId>,
    pub distance: usize,
    /// Highest impact along the path
    pub impact: ImpactLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Mitigation steps, most urgent first
    pub fn mitigation_priority(&self) -> Vec<String> {
        let steps: &[&str] = match self {
            RiskLevel::High => &[
                "Test every critical dependent immediately",
                "Roll out in stages with monitoring",
                "Prepare a rollback plan",
                "Notify all affected teams",
            ],
            RiskLevel::Medium => &[
                "Test direct dependents",
                "Monitor the deployment closely",
                "Keep a rollback plan ready",
            ],
            RiskLevel::Low => &["Standard testing", "Normal deployment process"],
        };
        steps.iter().map(|s| s.to_string()).collect()
    }
}

/// Nature of the change being assessed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    #[default]
    Update,
    /// Incompatible with current dependents
    Breaking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub score: u32,
    pub factors: Vec<String>,
    pub mitigation_priority: Vec<String>,
}

impl RiskAssessment {
    fn assess(direct: &[DirectImpact], affected: usize) -> Self {
        let mut score = 0;
        let mut factors = Vec::new();

        if affected > 10 {
            score += 30;
            factors.push(format!("{} repositories affected", affected));
        } else if affected > 5 {
            score += 20;
            factors.push(format!("{} repositories affected", affected));
        } else if affected > 0 {
            score += 10;
            factors.push(format!("{} repositories affected", affected));
        }

        let critical = direct
            .iter()
            .filter(|d| d.impact == ImpactLevel::Critical)
            .count();
        if critical > 0 {
            score += 40;
            factors.push(format!("{} critical direct dependents", critical));
        }

        if direct.iter().any(|d| d.kind == DependencyKind::Build) {
            score += 15;
            factors.push("build-time dependents must rebuild".to_string());
        }
        if direct.iter().any(|d| d.kind == DependencyKind::Runtime) {
            score += 20;
            factors.push("runtime dependents affected".to_string());
        }

        let level = if score >= 70 {
            RiskLevel::High
        } else if score >= 40 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        Self {
            level,
            score,
            factors,
            mitigation_priority: level.mitigation_priority(),
        }
    }
}

fn recommendations(
    change_type: ChangeType,
    direct: &[DirectImpact],
    affected: usize,
    risk: RiskLevel,
) -> Vec<String> {
    let mut out = Vec::new();

    if change_type == ChangeType::Breaking {
        out.push("Breaking change: coordinate the release with every dependent team".to_string());
        out.push("Publish a migration guide for dependent repositories".to_string());
    }
    if affected > 5 {
        out.push(format!(
            "Consider a phased rollout: {} repositories affected",
            affected
        ));
    }

    let kinds: HashSet<DependencyKind> = direct.iter().map(|d| d.kind).collect();
    if kinds.contains(&DependencyKind::Runtime) {
        out.push("Keep the runtime interface backward compatible or version it".to_string());
    }
    if kinds.contains(&DependencyKind::Build) {
        out.push("Rebuild and test dependent artifacts".to_string());
    }
    if kinds.contains(&DependencyKind::Configuration) {
        out.push("Verify consumers of the shared configuration".to_string());
    }

    if risk == RiskLevel::High {
        out.push("Schedule the change in a maintenance window".to_string());
        out.push("Prepare detailed rollback procedures".to_string());
    }
    out
}

/// Who is hit when a repository changes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    pub repository: RepoId,
    pub change_type: ChangeType,
    pub direct_impact: Vec<DirectImpact>,
    pub transitive_impact: Vec<TransitiveImpact>,
    /// Sorted, excluding the changed repository
    pub affected_repositories: Vec<RepoId>,
    pub risk: RiskAssessment,
    pub recommendations: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

/// Relative weight of a repository in the cached graph (top scores 100)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryImportance {
    pub repository: RepoId,
    pub score: f64,
}

/// Deployment plan produced by `coordinate_deployment`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coordination {
    pub id: Uuid,
    pub repositories: Vec<RepoId>,
    pub analysis: AnalysisResult,
    pub stages: Vec<StageSpec>,
    pub conflicts: Vec<Conflict>,
    /// Cycles left for operator review (advisory mode)
    pub flagged_cycles: Vec<Cycle>,
    pub estimated_duration_ms: u64,
    pub options: DeploymentOptions,
    pub created_at: DateTime<Utc>,
}

impl Coordination {
    /// Stages in reverse order with `rollback` tasks
    pub fn rollback_plan(&self) -> Vec<StageSpec> {
        self.stages
            .iter()
            .rev()
            .map(|stage| rollback_stage(stage, stage.tasks.iter()))
            .collect()
    }

    /// Rollback stages covering only the deploy tasks that succeeded in
    /// `orchestration`, latest wave first. Waves with nothing deployed are
    /// dropped.
    pub fn rollback_plan_for(&self, orchestration: &Orchestration) -> Vec<StageSpec> {
        self.stages
            .iter()
            .zip(&orchestration.stages)
            .rev()
            .filter_map(|(stage, run)| {
                let deployed: Vec<&TaskSpec> = stage
                    .tasks
                    .iter()
                    .zip(&run.tasks)
                    .filter(|(_, task_run)| task_run.status == TaskStatus::Succeeded)
                    .map(|(task, _)| task)
                    .collect();
                if deployed.is_empty() {
                    return None;
                }
                let mut rollback = rollback_stage(stage, deployed.into_iter());
                rollback.parallel &= rollback.tasks.len() > 1;
                Some(rollback)
            })
            .collect()
    }

    /// Plan export for review tooling
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(CoordinationError::serialization)
    }

    pub fn to_pipeline_config(&self, options: PipelineOptions) -> PipelineConfig {
        PipelineConfig {
            name: format!("deployment-{}", self.id),
            repositories: self.repositories.clone(),
            stages: self.stages.clone(),
            options,
            conflicts: self.conflicts.clone(),
        }
    }
}

fn rollback_stage<'a>(stage: &StageSpec, tasks: impl Iterator<Item = &'a TaskSpec>) -> StageSpec {
    StageSpec {
        name: stage.name.replacen("deploy", "rollback", 1),
        parallel: stage.parallel,
        estimated_duration_ms: stage.estimated_duration_ms,
        timeout_ms: stage.timeout_ms,
        tasks: tasks
            .map(|task| TaskSpec {
                task_type: ROLLBACK_TASK.to_string(),
                ..task.clone()
            })
            .collect(),
    }
}

pub struct DependencyAnalyzer {
    store: Arc<DependencyGraphStore>,
    provider: Arc<dyn RepositoryMetadataProvider>,
    coordinator: Arc<SharedResourceCoordinator>,
    clock: Arc<dyn Clock>,
    settings: DeploymentSettings,
}

impl DependencyAnalyzer {
    pub fn new(
        settings: DeploymentSettings,
        store: Arc<DependencyGraphStore>,
        provider: Arc<dyn RepositoryMetadataProvider>,
        coordinator: Arc<SharedResourceCoordinator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            provider,
            coordinator,
            clock,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<DependencyGraphStore> {
        &self.store
    }

    /// Drop the cached edges of one repository; the next analysis re-discovers them
    pub fn refresh(&self, repo: &str) -> bool {
        let removed = self.store.invalidate(repo.trim());
        if removed {
            debug!("Dependency cache entry for {} invalidated", repo);
        }
        removed
    }

    /// Discover `roots` and everything they reach. Returns the reached set.
    pub async fn discover<S: AsRef<str>>(&self, roots: &[S]) -> Result<BTreeSet<RepoId>> {
        let roots = normalize_repositories(roots)?;
        let mut reached = BTreeSet::new();
        let mut queue: VecDeque<RepoId> = roots.into_iter().collect();

        while let Some(repo) = queue.pop_front() {
            if !reached.insert(repo.clone()) {
                continue;
            }
            if !self.store.contains(&repo) {
                let edges = self.provider.get_dependencies(&repo).await?;
                debug!("Discovered {} edges for {}", edges.len(), repo);
                self.store.insert(&repo, edges);
            }
            for dep in self.store.dependencies_of(&repo) {
                if !reached.contains(&dep) {
                    queue.push_back(dep);
                }
            }
        }

        Ok(reached)
    }

    fn adjacency_of(&self, nodes: &BTreeSet<RepoId>) -> Adjacency {
        nodes
            .iter()
            .map(|repo| {
                let deps = self
                    .store
                    .dependencies_of(repo)
                    .into_iter()
                    .filter(|d| nodes.contains(d))
                    .collect();
                (repo.clone(), deps)
            })
            .collect()
    }

    pub async fn analyze_dependencies<S: AsRef<str>>(
        &self,
        repositories: &[S],
    ) -> Result<AnalysisResult> {
        let repositories = normalize_repositories(repositories)?;
        let discovered = self.discover(&repositories).await?;
        let adjacency = self.adjacency_of(&discovered);

        let closure = dag::transitive_closure(&adjacency);
        let circular_dependencies = dag::find_cycles(&adjacency);

        let requested: BTreeSet<RepoId> = repositories.iter().cloned().collect();
        let cyclic: BTreeSet<RepoId> = requested
            .iter()
            .filter(|r| closure.get(*r).map_or(false, |c| c.contains(*r)))
            .cloned()
            .collect();
        let orderable: BTreeSet<RepoId> = requested.difference(&cyclic).cloned().collect();

        // Precedence between requested repositories follows reachability,
        // so a dependency reached through an unrequested repository still
        // lands in an earlier wave
        let induced: Adjacency = orderable
            .iter()
            .map(|repo| {
                let deps = closure
                    .get(repo)
                    .map(|reach| reach.intersection(&orderable).cloned().collect())
                    .unwrap_or_default();
                (repo.clone(), deps)
            })
            .collect();
        let order = dag::deployment_waves(&induced, &orderable);
        if !order.unordered.is_empty() {
            // Unreachable once cyclic nodes are removed; kept visible if it happens
            warn!(
                "Repositories left unordered after cycle removal: {}",
                order.unordered.join(", ")
            );
        }

        let mut cyclic_repositories: Vec<RepoId> = cyclic.into_iter().collect();
        cyclic_repositories.extend(order.unordered);

        let dependency_count = adjacency.values().map(|deps| deps.len()).sum();
        let result = AnalysisResult {
            direct_dependencies: adjacency
                .iter()
                .map(|(repo, deps)| (repo.clone(), deps.iter().cloned().collect()))
                .collect(),
            transitive_dependencies: closure
                .into_iter()
                .map(|(repo, reach)| (repo, reach.into_iter().collect()))
                .collect(),
            circular_dependencies,
            cyclic_repositories,
            deployment_order: order.waves,
            metadata: AnalysisMetadata {
                dependency_count,
                analyzed_at: self.clock.now(),
                repository_count: repositories.len(),
            },
            repositories,
        };

        info!(
            "Analyzed {} repositories ({} discovered, {} edges): {} waves, {} cycles",
            result.metadata.repository_count,
            discovered.len(),
            dependency_count,
            result.deployment_order.len(),
            result.circular_dependencies.len()
        );
        if result.has_cycles() {
            warn!(
                "Cyclic repositories excluded from deployment order: {}",
                result.cyclic_repositories.join(", ")
            );
        }

        Ok(result)
    }

    pub async fn check_resource_conflicts<S: AsRef<str>>(
        &self,
        repositories: &[S],
    ) -> Result<Vec<Conflict>> {
        self.coordinator.check_resource_conflicts(repositories).await
    }

    pub async fn coordinate_deployment<S: AsRef<str>>(
        &self,
        repositories: &[S],
        options: DeploymentOptions,
    ) -> Result<Coordination> {
        let analysis = self.analyze_dependencies(repositories).await?;

        if options.cycle_policy == CyclePolicy::Strict && !analysis.cyclic_repositories.is_empty() {
            let requested: BTreeSet<&RepoId> = analysis.repositories.iter().collect();
            let cycles: Vec<Cycle> = analysis
                .circular_dependencies
                .iter()
                .filter(|cycle| cycle.iter().any(|r| requested.contains(r)))
                .cloned()
                .collect();
            warn!("Strict ordering impossible: {} cycles", cycles.len());
            return Err(CoordinationError::CircularDependency { cycles });
        }

        let mut stages = Vec::with_capacity(analysis.deployment_order.len());
        for (index, wave) in analysis.deployment_order.iter().enumerate() {
            let parallel = wave.len() > 1 && options.allow_parallel;

            let mut tasks = Vec::with_capacity(wave.len());
            for repo in wave {
                let mut task = TaskSpec::new(DEPLOY_TASK, repo.as_str());
                task.timeout_ms = options.timeout_ms;
                // Repeated declarations of one resource fold into one requirement
                for declaration in self.provider.get_resources(repo).await? {
                    let resource_id = self.coordinator.ensure_resource(&declaration)?;
                    task = task.requires(resource_id, declaration.exclusive);
                }
                tasks.push(task);
            }

            let costs = wave.iter().map(|repo| {
                options
                    .cost_hints_ms
                    .get(repo)
                    .copied()
                    .unwrap_or(self.settings.default_repository_cost_ms)
            });
            let estimated_duration_ms = if parallel {
                costs.max().unwrap_or(0)
            } else {
                costs.sum()
            };

            stages.push(StageSpec {
                name: format!("deploy-wave-{}", index + 1),
                parallel,
                estimated_duration_ms,
                timeout_ms: None,
                tasks,
            });
        }

        let conflicts = if options.ignore_conflicts {
            Vec::new()
        } else {
            self.coordinator
                .check_resource_conflicts(&analysis.repositories)
                .await?
        };

        let estimated_duration_ms = stages.iter().map(|s| s.estimated_duration_ms).sum();
        let flagged_cycles = analysis.circular_dependencies.clone();

        info!(
            "Deployment coordinated: {} stages, {} conflicts, ~{}ms\n{}",
            stages.len(),
            conflicts.len(),
            estimated_duration_ms,
            analysis.execution_plan()
        );

        Ok(Coordination {
            id: Uuid::new_v4(),
            repositories: analysis.repositories.clone(),
            analysis,
            stages,
            conflicts,
            flagged_cycles,
            estimated_duration_ms,
            options,
            created_at: self.clock.now(),
        })
    }

    /// Reverse BFS from `repo` over the cached graph.
    ///
    /// Only repositories already discovered are visible as dependents; call
    /// [`discover`](Self::discover) on the fleet first.
    pub async fn analyze_change_impact(&self, repo: &str) -> Result<ImpactAnalysis> {
        self.analyze_change_impact_with(repo, ChangeType::Update).await
    }

    /// [`analyze_change_impact`](Self::analyze_change_impact) for a change of
    /// the given type; breaking changes get extra recommendations
    pub async fn analyze_change_impact_with(
        &self,
        repo: &str,
        change_type: ChangeType,
    ) -> Result<ImpactAnalysis> {
        let repositories = normalize_repositories(&[repo])?;
        let changed = repositories[0].clone();
        self.discover(&repositories).await?;

        let direct_impact: Vec<DirectImpact> = self
            .store
            .dependents_of(&changed)
            .into_iter()
            .map(|edge| DirectImpact {
                repository: edge.from,
                kind: edge.kind,
                impact: edge.impact,
            })
            .collect();

        let mut visited: HashSet<RepoId> = HashSet::from([changed.clone()]);
        let mut transitive_impact = Vec::new();
        let mut queue: VecDeque<(RepoId, Vec<RepoId>, ImpactLevel)> = VecDeque::new();

        for edge in self.store.dependents_of(&changed) {
            if visited.insert(edge.from.clone()) {
                queue.push_back((edge.from.clone(), vec![changed.clone(), edge.from], edge.impact));
            }
        }

        while let Some((current, path, accumulated)) = queue.pop_front() {
            for edge in self.store.dependents_of(&current) {
                if !visited.insert(edge.from.clone()) {
                    continue;
                }
                let mut next = path.clone();
                next.push(edge.from.clone());
                let impact = accumulated.combine(edge.impact);
                transitive_impact.push(TransitiveImpact {
                    repository: edge.from.clone(),
                    distance: next.len() - 1,
                    path: next.clone(),
                    impact,
                });
                queue.push_back((edge.from, next, impact));
            }
        }

        let changed_set = HashSet::from([changed.clone()]);
        let mut affected_repositories: Vec<RepoId> =
            compute_affected_repositories(&changed_set, &self.store)
                .into_iter()
                .filter(|r| r != &changed)
                .collect();
        affected_repositories.sort();

        let risk = RiskAssessment::assess(&direct_impact, affected_repositories.len());
        let recommendations = recommendations(
            change_type,
            &direct_impact,
            affected_repositories.len(),
            risk.level,
        );
        info!(
            "Change impact of {} ({:?}): {} affected, risk {:?} ({})",
            changed,
            change_type,
            affected_repositories.len(),
            risk.level,
            risk.score
        );

        Ok(ImpactAnalysis {
            repository: changed,
            change_type,
            direct_impact,
            transitive_impact,
            affected_repositories,
            risk,
            recommendations,
            analyzed_at: self.clock.now(),
        })
    }

    /// Cached repositories ranked by importance, highest first
    pub fn repository_importance(&self) -> Vec<RepositoryImportance> {
        let mut ranked: Vec<RepositoryImportance> = repository_importance(&self.store)
            .into_iter()
            .map(|(repository, score)| RepositoryImportance { repository, score })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.repository.cmp(&b.repository))
        });
        ranked
    }

    /// Every simple dependency path from `source` to `target`
    pub async fn dependency_chains(&self, source: &str, target: &str) -> Result<Vec<Vec<RepoId>>> {
        let reached = self.discover(&[source]).await?;
        let adjacency = self.adjacency_of(&reached);
        Ok(dag::simple_paths(&adjacency, source.trim(), target.trim()))
    }
}
