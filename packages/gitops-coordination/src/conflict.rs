use crate::dependency_graph::RepoId;
use crate::error::{CoordinationError, Result};
use crate::resources::ResourceId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use uuid::Uuid;

pub const WAIT_AND_RETRY: &str = "wait-and-retry";
pub const REASSIGN_LOWER_PRIORITY: &str = "reassign-lower-priority";
pub const SPLIT_BY_TIME_WINDOW: &str = "split-by-time-window";
pub const KEEP_FIRST_REGISTERED: &str = "keep-first-registered";
pub const KEEP_MOST_RECENT: &str = "keep-most-recent";
pub const MANUAL_MERGE: &str = "manual-merge";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Several repositories need the same resource beyond its capacity
    ResourceContention,
    /// Repositories supply different values for one shared config key
    Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One repository's value for a shared configuration key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigValue {
    pub repository: RepoId,
    pub value: serde_json::Value,
}

/// A detected collision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    /// Involved repositories; the first one has priority
    pub repositories: Vec<RepoId>,
    /// `type:identifier` for resources, the config key otherwise
    pub key: String,
    pub resource_id: Option<ResourceId>,
    /// Repositories whose demand on the resource is shared; everyone else
    /// needs it exclusively
    #[serde(default)]
    pub shared_demands: BTreeSet<RepoId>,
    /// Competing values (configuration conflicts only)
    pub values: Vec<ConfigValue>,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn resource(
        resource_id: ResourceId,
        key: String,
        repositories: Vec<RepoId>,
        severity: Severity,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conflict_type: ConflictType::ResourceContention,
            severity,
            repositories,
            key,
            resource_id: Some(resource_id),
            shared_demands: BTreeSet::new(),
            values: Vec::new(),
            detected_at: now,
        }
    }

    pub fn configuration(key: String, values: Vec<ConfigValue>, now: DateTime<Utc>) -> Self {
        let distinct = distinct_values(&values);
        let severity = if distinct >= 3 {
            Severity::High
        } else {
            Severity::Medium
        };
        Self {
            id: Uuid::new_v4(),
            conflict_type: ConflictType::Configuration,
            severity,
            repositories: values.iter().map(|v| v.repository.clone()).collect(),
            key,
            resource_id: None,
            shared_demands: BTreeSet::new(),
            values,
            detected_at: now,
        }
    }

    /// Mark repositories that only need a shared slot
    pub fn with_shared_demands(mut self, repositories: impl IntoIterator<Item = RepoId>) -> Self {
        self.shared_demands.extend(repositories);
        self
    }

    pub fn is_exclusive_for(&self, repository: &str) -> bool {
        !self.shared_demands.contains(repository)
    }
}

/// Number of distinct JSON values
pub(crate) fn distinct_values(values: &[ConfigValue]) -> usize {
    values
        .iter()
        .map(|v| v.value.to_string())
        .collect::<BTreeSet<_>>()
        .len()
}

/// A mutation a strategy would perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProposedChange {
    /// Re-attempt admission; `after_ms` is the suggested wait for callers
    /// that defer the retry themselves
    RetryClaim {
        resource_id: ResourceId,
        repository: RepoId,
        exclusive: bool,
        after_ms: u64,
    },
    ReleaseClaims {
        resource_id: ResourceId,
        repository: RepoId,
    },
    ClaimResource {
        resource_id: ResourceId,
        repository: RepoId,
        exclusive: bool,
    },
    ScheduleWindow {
        resource_id: ResourceId,
        repository: RepoId,
        starts_in_ms: u64,
        duration_ms: u64,
    },
    SetConfigValue {
        key: String,
        value: serde_json::Value,
        source: Option<RepoId>,
    },
    FlagForReview {
        key: String,
        candidates: Vec<ConfigValue>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionStrategy {
    pub name: String,
    pub description: String,
    pub changes: Vec<ProposedChange>,
}

/// Strategy menu for one conflict; nothing is mutated until applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub id: Uuid,
    pub conflict: Conflict,
    pub strategies: Vec<ResolutionStrategy>,
    pub generated_at: DateTime<Utc>,
}

/// Knobs for strategy generation
#[derive(Debug, Clone, Copy)]
pub struct ResolutionParams {
    pub time_window_ms: u64,
    pub retry_after_ms: u64,
}

impl Resolution {
    pub fn for_conflict(
        conflict: &Conflict,
        params: ResolutionParams,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let strategies = match conflict.conflict_type {
            ConflictType::ResourceContention => resource_strategies(conflict, params)?,
            ConflictType::Configuration => configuration_strategies(conflict),
        };

        Ok(Self {
            id: Uuid::new_v4(),
            conflict: conflict.clone(),
            strategies,
            generated_at: now,
        })
    }

    pub fn strategy(&self, name: &str) -> Result<&ResolutionStrategy> {
        self.strategies
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CoordinationError::UnknownStrategy {
                strategy: name.to_string(),
                available: self.strategy_names(),
            })
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name.clone()).collect()
    }
}

fn resource_strategies(
    conflict: &Conflict,
    params: ResolutionParams,
) -> Result<Vec<ResolutionStrategy>> {
    let resource_id = conflict.resource_id.ok_or_else(|| {
        CoordinationError::InvalidInput(format!(
            "resource conflict {} carries no resource id",
            conflict.id
        ))
    })?;

    let (winner, waiting) = match conflict.repositories.split_first() {
        Some((first, rest)) => (first.clone(), rest.to_vec()),
        None => {
            return Err(CoordinationError::InvalidInput(format!(
                "conflict {} involves no repositories",
                conflict.id
            )))
        }
    };

    let wait = waiting
        .iter()
        .enumerate()
        .map(|(i, repo)| ProposedChange::RetryClaim {
            resource_id,
            repository: repo.clone(),
            exclusive: conflict.is_exclusive_for(repo),
            after_ms: params.retry_after_ms.saturating_mul(i as u64 + 1),
        })
        .collect();

    let mut reassign: Vec<ProposedChange> = waiting
        .iter()
        .map(|repo| ProposedChange::ReleaseClaims {
            resource_id,
            repository: repo.clone(),
        })
        .collect();
    reassign.push(ProposedChange::ClaimResource {
        resource_id,
        exclusive: conflict.is_exclusive_for(&winner),
        repository: winner,
    });

    let windows = conflict
        .repositories
        .iter()
        .enumerate()
        .map(|(i, repo)| ProposedChange::ScheduleWindow {
            resource_id,
            repository: repo.clone(),
            starts_in_ms: params.time_window_ms.saturating_mul(i as u64),
            duration_ms: params.time_window_ms,
        })
        .collect();

    Ok(vec![
        ResolutionStrategy {
            name: WAIT_AND_RETRY.to_string(),
            description: format!(
                "Keep {} as holder, retry the others after a backoff",
                conflict.repositories[0]
            ),
            changes: wait,
        },
        ResolutionStrategy {
            name: REASSIGN_LOWER_PRIORITY.to_string(),
            description: format!(
                "Release claims of lower-priority repositories and hand {} to {}",
                conflict.key, conflict.repositories[0]
            ),
            changes: reassign,
        },
        ResolutionStrategy {
            name: SPLIT_BY_TIME_WINDOW.to_string(),
            description: format!(
                "Give each repository its own {}ms window on {}",
                params.time_window_ms, conflict.key
            ),
            changes: windows,
        },
    ])
}

fn configuration_strategies(conflict: &Conflict) -> Vec<ResolutionStrategy> {
    let mut strategies = Vec::new();

    if let Some(first) = conflict.values.first() {
        strategies.push(ResolutionStrategy {
            name: KEEP_FIRST_REGISTERED.to_string(),
            description: format!("Use the value from {}", first.repository),
            changes: vec![ProposedChange::SetConfigValue {
                key: conflict.key.clone(),
                value: first.value.clone(),
                source: Some(first.repository.clone()),
            }],
        });
    }

    if let Some(last) = conflict.values.last() {
        strategies.push(ResolutionStrategy {
            name: KEEP_MOST_RECENT.to_string(),
            description: format!("Use the value from {}", last.repository),
            changes: vec![ProposedChange::SetConfigValue {
                key: conflict.key.clone(),
                value: last.value.clone(),
                source: Some(last.repository.clone()),
            }],
        });
    }

    let merge = if !conflict.values.is_empty() && conflict.values.iter().all(|v| v.value.is_object()) {
        let merged = conflict
            .values
            .iter()
            .fold(serde_json::Value::Object(Default::default()), |acc, v| {
                deep_merge(acc, &v.value)
            });
        ProposedChange::SetConfigValue {
            key: conflict.key.clone(),
            value: merged,
            source: None,
        }
    } else {
        ProposedChange::FlagForReview {
            key: conflict.key.clone(),
            candidates: conflict.values.clone(),
        }
    };

    strategies.push(ResolutionStrategy {
        name: MANUAL_MERGE.to_string(),
        description: "Merge object values key by key, or flag scalars for review".to_string(),
        changes: vec![merge],
    });

    strategies
}

/// Recursive object merge; later values win on scalar collisions
pub fn deep_merge(base: serde_json::Value, update: &serde_json::Value) -> serde_json::Value {
    match (base, update) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(update)) => {
            for (key, value) in update {
                let merged = match base.remove(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                base.insert(key.clone(), merged);
            }
            serde_json::Value::Object(base)
        }
        (_, update) => update.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChangeOutcome {
    Applied { detail: String },
    /// Dry run: validated, not performed
    Planned,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedChange {
    pub change: ProposedChange,
    pub outcome: ChangeOutcome,
}

/// Outcome of applying one strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub id: Uuid,
    pub resolution_id: Uuid,
    pub conflict_id: Uuid,
    pub conflict_key: String,
    pub strategy: String,
    pub dry_run: bool,
    pub changes: Vec<AppliedChange>,
    /// Every change applied (or planned, for dry runs)
    pub success: bool,
    pub applied_at: DateTime<Utc>,
}

/// Bounded log of applied resolutions; oldest entries are evicted first
pub struct ConflictHistory {
    entries: Mutex<VecDeque<ResolutionResult>>,
    capacity: usize,
}

impl ConflictHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn record(&self, result: ResolutionResult) {
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(result);
    }

    /// Newest first, at most `limit` entries
    pub fn recent(&self, limit: Option<usize>) -> Vec<ResolutionResult> {
        let entries = self.entries.lock();
        entries
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn for_conflict(&self, conflict_id: Uuid) -> Vec<ResolutionResult> {
        self.entries
            .lock()
            .iter()
            .filter(|r| r.conflict_id == conflict_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
