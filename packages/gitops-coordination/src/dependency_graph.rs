/// Dependency graph store for the repository fleet
///
/// Caches, per repository, the direct dependency edges discovered from the
/// metadata provider:
/// - Forward lookup: O(1) "what does this repository depend on"
/// - Reverse lookup: "who depends on this repository" (impact analysis)
/// - Lock-free concurrent access with DashMap
use crate::error::{CoordinationError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::warn;

/// Repository identifier (e.g. `org/name`)
pub type RepoId = String;

/// Coupling between two repositories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Build,
    Runtime,
    Configuration,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::Build => "build",
            DependencyKind::Runtime => "runtime",
            DependencyKind::Configuration => "configuration",
        }
    }
}

/// How hard a change in the dependency hits the dependent
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl ImpactLevel {
    /// Combine two levels along a path: the higher one wins
    pub fn combine(self, other: ImpactLevel) -> ImpactLevel {
        self.max(other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImpactLevel::Low => "low",
            ImpactLevel::Medium => "medium",
            ImpactLevel::High => "high",
            ImpactLevel::Critical => "critical",
        }
    }
}

/// Directed edge: `from` depends on `to`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: RepoId,
    pub to: RepoId,
    pub kind: DependencyKind,
    #[serde(default)]
    pub impact: ImpactLevel,
}

impl DependencyEdge {
    /// Create an edge, rejecting self-edges
    pub fn new(from: impl Into<RepoId>, to: impl Into<RepoId>, kind: DependencyKind) -> Result<Self> {
        let from = from.into();
        let to = to.into();
        if from == to {
            return Err(CoordinationError::InvalidInput(format!(
                "Self-dependency not allowed: {}",
                from
            )));
        }
        Ok(Self {
            from,
            to,
            kind,
            impact: ImpactLevel::default(),
        })
    }

    pub fn with_impact(mut self, impact: ImpactLevel) -> Self {
        self.impact = impact;
        self
    }
}

/// Per-repository cache of direct dependency edges
pub struct DependencyGraphStore {
    /// RepoId → outgoing edges
    edges: Arc<DashMap<RepoId, Vec<DependencyEdge>>>,
}

impl DependencyGraphStore {
    pub fn new() -> Self {
        Self {
            edges: Arc::new(DashMap::new()),
        }
    }

    /// Store the discovered edges of `repo`, replacing any cached entry.
    ///
    /// Self-edges and edges not originating at `repo` are dropped.
    pub fn insert(&self, repo: &str, edges: Vec<DependencyEdge>) {
        let mut seen = HashSet::new();
        let kept: Vec<DependencyEdge> = edges
            .into_iter()
            .filter(|edge| {
                if edge.from != repo || edge.to == edge.from {
                    warn!(
                        "Dropping invalid edge {} -> {} reported for {}",
                        edge.from, edge.to, repo
                    );
                    return false;
                }
                seen.insert((edge.to.clone(), edge.kind))
            })
            .collect();

        self.edges.insert(repo.to_string(), kept);
    }

    pub fn contains(&self, repo: &str) -> bool {
        self.edges.contains_key(repo)
    }

    pub fn get(&self, repo: &str) -> Option<Vec<DependencyEdge>> {
        self.edges.get(repo).map(|edges| edges.clone())
    }

    /// Direct dependency ids of `repo` (empty when unknown)
    pub fn dependencies_of(&self, repo: &str) -> BTreeSet<RepoId> {
        self.edges
            .get(repo)
            .map(|edges| edges.iter().map(|e| e.to.clone()).collect())
            .unwrap_or_default()
    }

    /// Edges pointing at `repo` from any cached repository
    pub fn dependents_of(&self, repo: &str) -> Vec<DependencyEdge> {
        let mut dependents: Vec<DependencyEdge> = self
            .edges
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|edge| edge.to == repo)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        dependents.sort_by(|a, b| a.from.cmp(&b.from));
        dependents
    }

    /// Adjacency snapshot: repository → direct dependencies
    pub fn adjacency(&self) -> BTreeMap<RepoId, BTreeSet<RepoId>> {
        self.edges
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().iter().map(|e| e.to.clone()).collect(),
                )
            })
            .collect()
    }

    /// Invalidate one cached entry ("refresh"); returns whether it existed
    pub fn invalidate(&self, repo: &str) -> bool {
        self.edges.remove(repo).is_some()
    }

    pub fn clear(&self) {
        self.edges.clear();
    }

    /// Number of cached repositories
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

impl Default for DependencyGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute every repository affected by changes to `changed`
///
/// BFS over reverse edges, O(V+E):
/// ```text
/// web → api → db
///
/// If db changes: {db, api, web}
/// ```
pub fn compute_affected_repositories(
    changed: &HashSet<RepoId>,
    store: &DependencyGraphStore,
) -> HashSet<RepoId> {
    let mut affected = HashSet::new();
    let mut queue = VecDeque::new();

    for repo in changed {
        affected.insert(repo.clone());
        queue.push_back(repo.clone());
    }

    while let Some(current) = queue.pop_front() {
        for edge in store.dependents_of(&current) {
            if affected.insert(edge.from.clone()) {
                queue.push_back(edge.from);
            }
        }
    }

    affected
}

const IMPORTANCE_DAMPING: f64 = 0.85;
const IMPORTANCE_ROUNDS: usize = 10;

/// Importance of every repository in the store, scaled so the top one is 100.
///
/// Seeded with 10 per dependent plus 5 per critical and 3 per high-impact
/// incoming edge, then propagated along reverse edges for a fixed number of
/// damped rounds (each dependent splits its weight across its dependencies).
pub fn repository_importance(store: &DependencyGraphStore) -> BTreeMap<RepoId, f64> {
    let edges: Vec<DependencyEdge> = store
        .edges
        .iter()
        .flat_map(|entry| entry.value().clone())
        .collect();

    let mut repos: BTreeSet<RepoId> = store.edges.iter().map(|e| e.key().clone()).collect();
    let mut out_degree: HashMap<&str, usize> = HashMap::new();
    let mut incoming: HashMap<&str, Vec<&DependencyEdge>> = HashMap::new();
    for edge in &edges {
        repos.insert(edge.to.clone());
        *out_degree.entry(edge.from.as_str()).or_default() += 1;
        incoming.entry(edge.to.as_str()).or_default().push(edge);
    }

    let mut scores: BTreeMap<RepoId, f64> = repos
        .iter()
        .map(|repo| {
            let dependents = incoming.get(repo.as_str()).map_or(&[][..], Vec::as_slice);
            let bonus: f64 = dependents
                .iter()
                .map(|e| match e.impact {
                    ImpactLevel::Critical => 5.0,
                    ImpactLevel::High => 3.0,
                    _ => 0.0,
                })
                .sum();
            (repo.clone(), dependents.len() as f64 * 10.0 + bonus)
        })
        .collect();

    for _ in 0..IMPORTANCE_ROUNDS {
        let next: BTreeMap<RepoId, f64> = repos
            .iter()
            .map(|repo| {
                let inflow: f64 = incoming.get(repo.as_str()).map_or(0.0, |dependents| {
                    dependents
                        .iter()
                        .map(|e| {
                            let weight = scores.get(&e.from).copied().unwrap_or(0.0);
                            let fan_out = out_degree.get(e.from.as_str()).copied().unwrap_or(1);
                            weight / fan_out as f64
                        })
                        .sum()
                });
                (
                    repo.clone(),
                    (1.0 - IMPORTANCE_DAMPING) + IMPORTANCE_DAMPING * inflow,
                )
            })
            .collect();
        scores = next;
    }

    let top = scores.values().copied().fold(0.0_f64, f64::max);
    if top > 0.0 {
        for score in scores.values_mut() {
            *score = *score / top * 100.0;
        }
    }
    scores
}

/// Trim, drop blanks and de-duplicate (first occurrence wins).
///
/// Fails with `InvalidInput` when nothing is left.
pub fn normalize_repositories<S: AsRef<str>>(repositories: &[S]) -> Result<Vec<RepoId>> {
    let mut seen = HashSet::new();
    let normalized: Vec<RepoId> = repositories
        .iter()
        .map(|repo| repo.as_ref().trim())
        .filter(|repo| !repo.is_empty())
        .filter(|repo| seen.insert(repo.to_string()))
        .map(str::to_string)
        .collect();

    if normalized.is_empty() {
        return Err(CoordinationError::invalid_input(
            "at least one repository is required",
        ));
    }
    Ok(normalized)
}
