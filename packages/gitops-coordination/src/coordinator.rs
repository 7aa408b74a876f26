//! Shared Resource Coordinator
//!
//! Owns the resource registry and the lock table behind a single guard, so
//! every claim, release and sweep is serialized. Events are published after
//! the guard is dropped.

use crate::clock::Clock;
use crate::config::{ClaimSettings, CoordinatorConfig, ResolutionSettings};
use crate::conflict::{
    distinct_values, AppliedChange, ChangeOutcome, ConfigValue, Conflict, ConflictHistory,
    ProposedChange, Resolution, ResolutionParams, ResolutionResult, Severity,
};
use crate::dependency_graph::{normalize_repositories, RepoId};
use crate::error::{CoordinationError, Result};
use crate::events::{CoordinationEvent, EventSink};
use crate::provider::RepositoryMetadataProvider;
use crate::resources::{
    claim_expiry, offset_by_ms, ClaimId, ClaimOperation, LockTable, ResourceClaim,
    ResourceDeclaration, ResourceId, ResourceSpec, SharedResource,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reserved slot produced by `split-by-time-window`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledWindow {
    pub resource_id: ResourceId,
    pub repository: RepoId,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Value chosen for a shared configuration key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfigValue {
    pub value: serde_json::Value,
    /// Repository whose value won; `None` for merged values
    pub source: Option<RepoId>,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedConfigStatus {
    Consistent,
    ConflictsDetected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfigCoordination {
    pub id: Uuid,
    pub status: SharedConfigStatus,
    pub repositories: Vec<RepoId>,
    /// Key → values in request order
    pub shared_configs: BTreeMap<String, Vec<ConfigValue>>,
    pub conflicts: Vec<Conflict>,
    /// One per conflict, same order
    pub resolutions: Vec<Resolution>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource: SharedResource,
    pub active_claims: Vec<ResourceClaim>,
    pub available_capacity: u32,
    pub scheduled_windows: Vec<ScheduledWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Expired claims awaiting a sweep, or keys awaiting manual review
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub resource_count: usize,
    pub active_claims: usize,
    pub expired_claims: usize,
    /// Resources with no capacity left
    pub saturated_resources: usize,
    pub history_len: usize,
    pub pending_reviews: usize,
    pub checked_at: DateTime<Utc>,
}

#[derive(Default)]
struct CoordinatorState {
    resources: HashMap<ResourceId, SharedResource>,
    by_key: HashMap<String, ResourceId>,
    locks: LockTable,
    config_values: BTreeMap<String, ResolvedConfigValue>,
    windows: Vec<ScheduledWindow>,
    manual_review: BTreeSet<String>,
}

pub struct SharedResourceCoordinator {
    state: Mutex<CoordinatorState>,
    history: ConflictHistory,
    claims: ClaimSettings,
    resolution: ResolutionSettings,
    provider: Arc<dyn RepositoryMetadataProvider>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl SharedResourceCoordinator {
    pub fn new(
        config: &CoordinatorConfig,
        provider: Arc<dyn RepositoryMetadataProvider>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            history: ConflictHistory::new(config.history_capacity),
            claims: config.claims.clone(),
            resolution: config.resolution.clone(),
            provider,
            events,
            clock,
        }
    }

    // ----- registry -----

    pub fn register_shared_resource(&self, spec: ResourceSpec) -> Result<ResourceId> {
        let resource = SharedResource::from_spec(spec, self.clock.now())?;
        let key = resource.key();

        let mut state = self.state.lock();
        if let Some(existing) = state.by_key.get(&key) {
            return Err(CoordinationError::DuplicateResource {
                resource_type: resource.resource_type,
                identifier: resource.identifier,
                existing: *existing,
            });
        }

        let id = resource.id;
        info!(
            "Registered resource {} ({}, capacity {})",
            key, id, resource.capacity
        );
        state.by_key.insert(key, id);
        state.resources.insert(id, resource);
        Ok(id)
    }

    /// Id of a declared resource, registering it (capacity 1) on first sight
    pub fn ensure_resource(&self, declaration: &ResourceDeclaration) -> Result<ResourceId> {
        if let Some(id) = self.find_resource(&declaration.resource_type, &declaration.identifier) {
            return Ok(id);
        }
        match self.register_shared_resource(ResourceSpec::new(
            declaration.resource_type.as_str(),
            declaration.identifier.as_str(),
        )) {
            Ok(id) => Ok(id),
            // Lost a registration race
            Err(CoordinationError::DuplicateResource { existing, .. }) => Ok(existing),
            Err(e) => Err(e),
        }
    }

    pub fn find_resource(&self, resource_type: &str, identifier: &str) -> Option<ResourceId> {
        let key = format!("{}:{}", resource_type.trim(), identifier.trim());
        self.state.lock().by_key.get(&key).copied()
    }

    /// Registered resources ordered by `type:identifier`
    pub fn list_resources(&self) -> Vec<SharedResource> {
        let mut resources: Vec<SharedResource> =
            self.state.lock().resources.values().cloned().collect();
        resources.sort_by_key(|r| r.key());
        resources
    }

    // ----- claims -----

    pub fn claim_resource(
        &self,
        resource_id: ResourceId,
        repository: &str,
        operation: &ClaimOperation,
    ) -> Result<ClaimId> {
        let repository = repository.trim();
        if repository.is_empty() {
            return Err(CoordinationError::invalid_input("repository must not be empty"));
        }
        let now = self.clock.now();
        let ttl_ms = operation.ttl_ms.or(self.claims.default_ttl_ms);
        claim_expiry(now, ttl_ms)?;

        let (expired, outcome) = {
            let mut state = self.state.lock();
            admit_locked(&mut state, resource_id, repository, operation, ttl_ms, now)?
        };
        self.publish_expired(expired, now);

        match outcome {
            Ok(claim) => {
                info!(
                    "Claim {} granted: {} on {} ({}, exclusive={})",
                    claim.id, repository, resource_id, operation.operation_type, claim.exclusive
                );
                let claim_id = claim.id;
                self.events.publish(claimed_event(&claim, now));
                Ok(claim_id)
            }
            Err(e) => {
                warn!("Claim denied for {} on {}: {}", repository, resource_id, e);
                Err(e)
            }
        }
    }

    /// Claim with bounded exponential backoff on `ResourceConflict`.
    ///
    /// Uses `claims.retry_attempts` / `claims.retry_backoff_ms`; any other
    /// error is returned immediately.
    pub async fn claim_resource_with_retry(
        &self,
        resource_id: ResourceId,
        repository: &str,
        operation: &ClaimOperation,
    ) -> Result<ClaimId> {
        let attempts = self.claims.retry_attempts.max(1);
        let mut backoff_ms = self.claims.retry_backoff_ms;
        let mut attempt = 1;

        loop {
            match self.claim_resource(resource_id, repository, operation) {
                Err(CoordinationError::ResourceConflict { .. }) if attempt < attempts => {
                    debug!(
                        "Claim attempt {}/{} for {} on {} conflicted, retrying in {}ms",
                        attempt, attempts, repository, resource_id, backoff_ms
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Returns whether a claim was removed; unknown ids are not an error
    pub fn release_resource(&self, resource_id: ResourceId, claim_id: ClaimId) -> bool {
        let released = self.state.lock().locks.release(resource_id, claim_id);

        match released {
            Some(claim) => {
                info!(
                    "Claim {} released: {} on {}",
                    claim.id, claim.repository, resource_id
                );
                self.events.publish(CoordinationEvent::ResourceReleased {
                    resource_id,
                    claim_id,
                    repository: claim.repository,
                    at: self.clock.now(),
                });
                true
            }
            None => {
                debug!("Release of unknown claim {} on {}", claim_id, resource_id);
                false
            }
        }
    }

    /// Reap every expired claim; returns how many were removed
    pub fn cleanup_expired_locks(&self) -> usize {
        let now = self.clock.now();
        let expired = self.state.lock().locks.reap_all_expired(now);
        let count = expired.len();
        if count > 0 {
            info!("Reaped {} expired claims", count);
        }
        self.publish_expired(expired, now);
        count
    }

    fn publish_expired(&self, expired: Vec<ResourceClaim>, now: DateTime<Utc>) {
        for claim in expired {
            debug!("Claim {} of {} expired", claim.id, claim.repository);
            self.events.publish(CoordinationEvent::ClaimExpired {
                resource_id: claim.resource_id,
                claim_id: claim.id,
                repository: claim.repository,
                at: now,
            });
        }
    }

    // ----- conflicts -----

    /// Resource contention among `repositories`, counting holders outside
    /// the set as well. Declared resources are registered on first sight.
    pub async fn check_resource_conflicts<S: AsRef<str>>(
        &self,
        repositories: &[S],
    ) -> Result<Vec<Conflict>> {
        let repositories = normalize_repositories(repositories)?;

        let mut demands: BTreeMap<(String, String), Vec<(RepoId, bool)>> = BTreeMap::new();
        for repo in &repositories {
            for declaration in self.provider.get_resources(repo).await? {
                let demanders = demands
                    .entry((
                        declaration.resource_type.trim().to_string(),
                        declaration.identifier.trim().to_string(),
                    ))
                    .or_default();
                match demanders.iter_mut().find(|(r, _)| r == repo) {
                    Some((_, exclusive)) => *exclusive |= declaration.exclusive,
                    None => demanders.push((repo.clone(), declaration.exclusive)),
                }
            }
        }

        let now = self.clock.now();
        let mut conflicts = Vec::new();

        for ((resource_type, identifier), demanders) in demands {
            let resource_id = self.ensure_resource(&ResourceDeclaration {
                resource_type: resource_type.clone(),
                identifier: identifier.clone(),
                exclusive: true,
            })?;

            let (capacity, holders) = {
                let state = self.state.lock();
                let capacity = state
                    .resources
                    .get(&resource_id)
                    .map(|r| r.capacity)
                    .unwrap_or(1);
                (capacity, state.locks.active_claims(resource_id, now))
            };

            let outside: Vec<&ResourceClaim> = holders
                .iter()
                .filter(|c| !demanders.iter().any(|(r, _)| r == &c.repository))
                .collect();

            let exclusive = capacity == 1
                || demanders.iter().any(|(_, e)| *e)
                || outside.iter().any(|c| c.exclusive);
            let total = demanders.len() + outside.len();
            let contended = if exclusive {
                total > 1
            } else {
                total > capacity as usize
            };
            if !contended {
                continue;
            }

            let severity = if !outside.is_empty() {
                Severity::High
            } else if exclusive {
                Severity::Medium
            } else {
                Severity::Low
            };

            let shared_demands: Vec<RepoId> = outside
                .iter()
                .filter(|c| !c.exclusive)
                .map(|c| c.repository.clone())
                .chain(demanders.iter().filter(|(_, e)| !e).map(|(r, _)| r.clone()))
                .collect();

            // Current holders keep priority over newcomers
            let mut involved: Vec<RepoId> = outside.iter().map(|c| c.repository.clone()).collect();
            involved.extend(demanders.into_iter().map(|(r, _)| r));

            let key = format!("{}:{}", resource_type, identifier);
            warn!(
                "Resource conflict on {} ({:?}): {}",
                key,
                severity,
                involved.join(", ")
            );
            conflicts.push(
                Conflict::resource(resource_id, key, involved, severity, now)
                    .with_shared_demands(shared_demands),
            );
        }

        Ok(conflicts)
    }

    /// Strategy menu for a conflict; mutates nothing
    pub fn generate_resolution(&self, conflict: &Conflict) -> Result<Resolution> {
        Resolution::for_conflict(
            conflict,
            ResolutionParams {
                time_window_ms: self.resolution.time_window_ms,
                retry_after_ms: self.claims.retry_backoff_ms,
            },
            self.clock.now(),
        )
    }

    /// Perform one strategy and record it in the conflict history
    pub fn apply_resolution(
        &self,
        resolution: &Resolution,
        strategy: &str,
    ) -> Result<ResolutionResult> {
        self.apply_inner(resolution, strategy, false)
    }

    /// Validate a strategy without mutating state or recording history
    pub fn dry_run_resolution(
        &self,
        resolution: &Resolution,
        strategy: &str,
    ) -> Result<ResolutionResult> {
        self.apply_inner(resolution, strategy, true)
    }

    fn apply_inner(
        &self,
        resolution: &Resolution,
        strategy_name: &str,
        dry_run: bool,
    ) -> Result<ResolutionResult> {
        let strategy = resolution.strategy(strategy_name)?;
        let now = self.clock.now();
        let default_ttl = self.claims.default_ttl_ms;
        let mut events = Vec::new();

        let changes: Vec<AppliedChange> = {
            let mut state = self.state.lock();
            strategy
                .changes
                .iter()
                .map(|change| AppliedChange {
                    change: change.clone(),
                    outcome: if dry_run {
                        plan_change(&state, change)
                    } else {
                        perform_change(&mut state, change, default_ttl, now, &mut events)
                    },
                })
                .collect()
        };

        let success = changes
            .iter()
            .all(|c| !matches!(c.outcome, ChangeOutcome::Failed { .. }));

        let result = ResolutionResult {
            id: Uuid::new_v4(),
            resolution_id: resolution.id,
            conflict_id: resolution.conflict.id,
            conflict_key: resolution.conflict.key.clone(),
            strategy: strategy.name.clone(),
            dry_run,
            changes,
            success,
            applied_at: now,
        };

        if dry_run {
            debug!(
                "Dry run of '{}' for conflict {}: success={}",
                strategy.name, resolution.conflict.id, success
            );
            return Ok(result);
        }

        info!(
            "Applied '{}' to conflict {} ({}): success={}",
            strategy.name, resolution.conflict.id, resolution.conflict.key, success
        );
        self.history.record(result.clone());

        for event in events {
            self.events.publish(event);
        }
        self.events.publish(CoordinationEvent::ResolutionApplied {
            conflict_id: resolution.conflict.id,
            strategy: strategy.name.clone(),
            success,
            at: now,
        });

        Ok(result)
    }

    // ----- shared configuration -----

    pub async fn coordinate_shared_configuration<S: AsRef<str>>(
        &self,
        repositories: &[S],
    ) -> Result<SharedConfigCoordination> {
        let repositories = normalize_repositories(repositories)?;

        let mut shared_configs: BTreeMap<String, Vec<ConfigValue>> = BTreeMap::new();
        for repo in &repositories {
            for (key, value) in self.provider.get_configuration(repo).await? {
                shared_configs.entry(key).or_default().push(ConfigValue {
                    repository: repo.clone(),
                    value,
                });
            }
        }

        let now = self.clock.now();
        let mut conflicts = Vec::new();
        let mut resolutions = Vec::new();

        for (key, values) in &shared_configs {
            if values.len() < 2 || distinct_values(values) < 2 {
                continue;
            }
            let conflict = Conflict::configuration(key.clone(), values.clone(), now);
            resolutions.push(self.generate_resolution(&conflict)?);
            conflicts.push(conflict);
        }

        let status = if conflicts.is_empty() {
            SharedConfigStatus::Consistent
        } else {
            SharedConfigStatus::ConflictsDetected
        };

        info!(
            "Shared configuration across {} repositories: {} keys, {} conflicting",
            repositories.len(),
            shared_configs.len(),
            conflicts.len()
        );

        Ok(SharedConfigCoordination {
            id: Uuid::new_v4(),
            status,
            repositories,
            shared_configs,
            conflicts,
            resolutions,
            created_at: now,
        })
    }

    // ----- read accessors -----

    /// `None` for unknown resources
    pub fn get_resource_status(&self, resource_id: ResourceId) -> Option<ResourceStatus> {
        let now = self.clock.now();
        let state = self.state.lock();
        let resource = state.resources.get(&resource_id)?.clone();
        let active_claims = state.locks.active_claims(resource_id, now);
        let available_capacity = available_capacity(&resource, &active_claims);
        let scheduled_windows = state
            .windows
            .iter()
            .filter(|w| w.resource_id == resource_id)
            .cloned()
            .collect();

        Some(ResourceStatus {
            resource,
            active_claims,
            available_capacity,
            scheduled_windows,
        })
    }

    pub fn get_system_health(&self) -> SystemHealth {
        let now = self.clock.now();
        let state = self.state.lock();

        let saturated_resources = state
            .resources
            .values()
            .filter(|r| available_capacity(r, &state.locks.active_claims(r.id, now)) == 0)
            .count();
        let expired_claims = state.locks.expired_count(now);
        let pending_reviews = state.manual_review.len();

        let status = if expired_claims > 0 || pending_reviews > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        SystemHealth {
            status,
            resource_count: state.resources.len(),
            active_claims: state.locks.active_count(now),
            expired_claims,
            saturated_resources,
            history_len: self.history.len(),
            pending_reviews,
            checked_at: now,
        }
    }

    /// Newest first
    pub fn get_conflict_history(&self, limit: Option<usize>) -> Vec<ResolutionResult> {
        self.history.recent(limit)
    }

    pub fn scheduled_windows(&self, resource_id: ResourceId) -> Vec<ScheduledWindow> {
        self.state
            .lock()
            .windows
            .iter()
            .filter(|w| w.resource_id == resource_id)
            .cloned()
            .collect()
    }

    pub fn resolved_config(&self, key: &str) -> Option<ResolvedConfigValue> {
        self.state.lock().config_values.get(key).cloned()
    }

    /// Configuration keys flagged by `manual-merge` and not yet resolved
    pub fn pending_reviews(&self) -> Vec<String> {
        self.state.lock().manual_review.iter().cloned().collect()
    }
}

fn available_capacity(resource: &SharedResource, active: &[ResourceClaim]) -> u32 {
    if active.iter().any(|c| c.exclusive) {
        0
    } else {
        resource.capacity.saturating_sub(active.len() as u32)
    }
}

fn claimed_event(claim: &ResourceClaim, now: DateTime<Utc>) -> CoordinationEvent {
    CoordinationEvent::ResourceClaimed {
        resource_id: claim.resource_id,
        claim_id: claim.id,
        repository: claim.repository.clone(),
        operation: claim.operation_type.clone(),
        exclusive: claim.exclusive,
        at: now,
    }
}

/// Reap then admit. The outer error is `ResourceNotFound`; the inner result
/// is the admission outcome.
fn admit_locked(
    state: &mut CoordinatorState,
    resource_id: ResourceId,
    repository: &str,
    operation: &ClaimOperation,
    ttl_ms: Option<u64>,
    now: DateTime<Utc>,
) -> Result<(Vec<ResourceClaim>, Result<ResourceClaim>)> {
    let resource = state
        .resources
        .get(&resource_id)
        .cloned()
        .ok_or(CoordinationError::ResourceNotFound(resource_id))?;

    let expired = state.locks.reap_expired(resource_id, now);
    let outcome = state
        .locks
        .admit(&resource, repository, operation, ttl_ms, now);
    Ok((expired, outcome))
}

fn plan_change(state: &CoordinatorState, change: &ProposedChange) -> ChangeOutcome {
    let resource_id = match change {
        ProposedChange::RetryClaim { resource_id, .. }
        | ProposedChange::ReleaseClaims { resource_id, .. }
        | ProposedChange::ClaimResource { resource_id, .. }
        | ProposedChange::ScheduleWindow { resource_id, .. } => Some(*resource_id),
        ProposedChange::SetConfigValue { .. } | ProposedChange::FlagForReview { .. } => None,
    };

    match resource_id {
        Some(id) if !state.resources.contains_key(&id) => ChangeOutcome::Failed {
            error: CoordinationError::ResourceNotFound(id).to_string(),
        },
        _ => ChangeOutcome::Planned,
    }
}

#[allow(clippy::too_many_arguments)]
fn admit_change(
    state: &mut CoordinatorState,
    resource_id: ResourceId,
    repository: &str,
    exclusive: bool,
    operation_type: &str,
    default_ttl: Option<u64>,
    now: DateTime<Utc>,
    events: &mut Vec<CoordinationEvent>,
) -> ChangeOutcome {
    let operation = ClaimOperation {
        operation_type: operation_type.to_string(),
        exclusive,
        ttl_ms: None,
    };
    match admit_locked(state, resource_id, repository, &operation, default_ttl, now) {
        Ok((expired, outcome)) => {
            events.extend(expired.into_iter().map(|c| CoordinationEvent::ClaimExpired {
                resource_id: c.resource_id,
                claim_id: c.id,
                repository: c.repository,
                at: now,
            }));
            match outcome {
                Ok(claim) => {
                    events.push(claimed_event(&claim, now));
                    ChangeOutcome::Applied {
                        detail: format!("claim {} granted to {}", claim.id, repository),
                    }
                }
                Err(e) => ChangeOutcome::Failed {
                    error: e.to_string(),
                },
            }
        }
        Err(e) => ChangeOutcome::Failed {
            error: e.to_string(),
        },
    }
}

fn perform_change(
    state: &mut CoordinatorState,
    change: &ProposedChange,
    default_ttl: Option<u64>,
    now: DateTime<Utc>,
    events: &mut Vec<CoordinationEvent>,
) -> ChangeOutcome {
    match change {
        ProposedChange::RetryClaim {
            resource_id,
            repository,
            exclusive,
            ..
        } => admit_change(
            state,
            *resource_id,
            repository,
            *exclusive,
            "resolution-retry",
            default_ttl,
            now,
            events,
        ),

        ProposedChange::ClaimResource {
            resource_id,
            repository,
            exclusive,
        } => {
            let held = state
                .locks
                .active_claims(*resource_id, now)
                .into_iter()
                .find(|c| &c.repository == repository);
            match held {
                Some(claim) => ChangeOutcome::Applied {
                    detail: format!("{} already holds claim {}", repository, claim.id),
                },
                None => admit_change(
                    state,
                    *resource_id,
                    repository,
                    *exclusive,
                    "resolution-reassign",
                    default_ttl,
                    now,
                    events,
                ),
            }
        }

        ProposedChange::ReleaseClaims {
            resource_id,
            repository,
        } => {
            if !state.resources.contains_key(resource_id) {
                return ChangeOutcome::Failed {
                    error: CoordinationError::ResourceNotFound(*resource_id).to_string(),
                };
            }
            let released = state.locks.release_repository(*resource_id, repository);
            let count = released.len();
            events.extend(released.into_iter().map(|c| CoordinationEvent::ResourceReleased {
                resource_id: c.resource_id,
                claim_id: c.id,
                repository: c.repository,
                at: now,
            }));
            ChangeOutcome::Applied {
                detail: format!("released {} claim(s) of {}", count, repository),
            }
        }

        ProposedChange::ScheduleWindow {
            resource_id,
            repository,
            starts_in_ms,
            duration_ms,
        } => {
            if !state.resources.contains_key(resource_id) {
                return ChangeOutcome::Failed {
                    error: CoordinationError::ResourceNotFound(*resource_id).to_string(),
                };
            }
            let bounds = offset_by_ms(now, *starts_in_ms)
                .and_then(|starts_at| Some((starts_at, offset_by_ms(starts_at, *duration_ms)?)));
            let Some((starts_at, ends_at)) = bounds else {
                return ChangeOutcome::Failed {
                    error: format!(
                        "window of {}ms starting in {}ms is out of range",
                        duration_ms, starts_in_ms
                    ),
                };
            };
            let window = ScheduledWindow {
                resource_id: *resource_id,
                repository: repository.clone(),
                starts_at,
                ends_at,
            };
            let detail = format!(
                "{} scheduled {} .. {}",
                repository, window.starts_at, window.ends_at
            );
            state.windows.push(window);
            ChangeOutcome::Applied { detail }
        }

        ProposedChange::SetConfigValue { key, value, source } => {
            state.manual_review.remove(key);
            state.config_values.insert(
                key.clone(),
                ResolvedConfigValue {
                    value: value.clone(),
                    source: source.clone(),
                    resolved_at: now,
                },
            );
            ChangeOutcome::Applied {
                detail: format!("{} set", key),
            }
        }

        ProposedChange::FlagForReview { key, .. } => {
            state.manual_review.insert(key.clone());
            ChangeOutcome::Applied {
                detail: format!("{} flagged for manual review", key),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::conflict::{
        KEEP_FIRST_REGISTERED, MANUAL_MERGE, REASSIGN_LOWER_PRIORITY, SPLIT_BY_TIME_WINDOW,
    };
    use crate::events::BroadcastEventSink;
    use crate::provider::StaticMetadataProvider;
    use chrono::Duration;
    use serde_json::json;

    struct Harness {
        coordinator: SharedResourceCoordinator,
        clock: Arc<ManualClock>,
        events: Arc<BroadcastEventSink>,
    }

    fn harness(provider: StaticMetadataProvider) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let events = Arc::new(BroadcastEventSink::default());
        let coordinator = SharedResourceCoordinator::new(
            &CoordinatorConfig::default(),
            Arc::new(provider),
            events.clone(),
            clock.clone(),
        );
        Harness {
            coordinator,
            clock,
            events,
        }
    }

    fn port(h: &Harness) -> ResourceId {
        h.coordinator
            .register_shared_resource(ResourceSpec::new("port", "8080").with_capacity(1))
            .unwrap()
    }

    #[test]
    fn test_register_validates_and_rejects_duplicates() {
        let h = harness(StaticMetadataProvider::new());
        let id = port(&h);

        let dup = h
            .coordinator
            .register_shared_resource(ResourceSpec::new(" port ", "8080"));
        assert!(matches!(
            dup,
            Err(CoordinationError::DuplicateResource { existing, .. }) if existing == id
        ));

        let blank = h.coordinator.register_shared_resource(ResourceSpec::new("", "x"));
        assert!(matches!(blank, Err(CoordinationError::InvalidInput(_))));
    }

    #[test]
    fn test_claim_unknown_resource() {
        let h = harness(StaticMetadataProvider::new());
        let result =
            h.coordinator
                .claim_resource(Uuid::new_v4(), "a", &ClaimOperation::exclusive("deploy"));
        assert!(matches!(result, Err(CoordinationError::ResourceNotFound(_))));
    }

    #[test]
    fn test_exclusive_claim_conflict_then_release() {
        let h = harness(StaticMetadataProvider::new());
        let id = port(&h);
        let op = ClaimOperation::exclusive("deploy");

        let claim = h.coordinator.claim_resource(id, "A", &op).unwrap();
        assert!(matches!(
            h.coordinator.claim_resource(id, "B", &op),
            Err(CoordinationError::ResourceConflict { .. })
        ));

        assert!(h.coordinator.release_resource(id, claim));
        assert!(!h.coordinator.release_resource(id, claim));
        assert!(h.coordinator.claim_resource(id, "B", &op).is_ok());

        assert_eq!(
            h.events.recent_names(),
            vec!["resourceClaimed", "resourceReleased", "resourceClaimed"]
        );
    }

    #[test]
    fn test_expired_claim_reaped_on_admission() {
        let h = harness(StaticMetadataProvider::new());
        let id = port(&h);

        h.coordinator
            .claim_resource(id, "A", &ClaimOperation::exclusive("deploy").with_ttl_ms(1_000))
            .unwrap();
        h.clock.advance(Duration::seconds(2));

        assert_eq!(h.coordinator.get_system_health().status, HealthStatus::Degraded);
        assert!(h
            .coordinator
            .claim_resource(id, "B", &ClaimOperation::exclusive("deploy"))
            .is_ok());
        assert!(h.events.recent_names().contains(&"claimExpired"));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let h = harness(StaticMetadataProvider::new());
        let id = h
            .coordinator
            .register_shared_resource(ResourceSpec::new("endpoint", "registry").with_capacity(3))
            .unwrap();
        let op = ClaimOperation::shared("pull").with_ttl_ms(500);
        h.coordinator.claim_resource(id, "A", &op).unwrap();
        h.coordinator.claim_resource(id, "B", &op).unwrap();

        h.clock.advance(Duration::seconds(1));
        assert_eq!(h.coordinator.cleanup_expired_locks(), 2);
        assert_eq!(h.coordinator.cleanup_expired_locks(), 0);
        assert_eq!(h.coordinator.get_system_health().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_resource_status() {
        let h = harness(StaticMetadataProvider::new());
        assert!(h.coordinator.get_resource_status(Uuid::new_v4()).is_none());

        let id = h
            .coordinator
            .register_shared_resource(
                ResourceSpec::new("endpoint", "db")
                    .with_capacity(2)
                    .with_metadata("owner", json!("platform")),
            )
            .unwrap();
        let listed = h.coordinator.list_resources();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metadata["owner"], json!("platform"));
        h.coordinator
            .claim_resource(id, "A", &ClaimOperation::shared("read"))
            .unwrap();

        let status = h.coordinator.get_resource_status(id).unwrap();
        assert_eq!(status.active_claims.len(), 1);
        assert_eq!(status.available_capacity, 1);
    }

    #[tokio::test]
    async fn test_check_conflicts_on_shared_declaration() {
        let provider = StaticMetadataProvider::new()
            .with_resource("web", ResourceDeclaration::exclusive("port", "443"))
            .with_resource("proxy", ResourceDeclaration::exclusive("port", "443"))
            .with_resource("api", ResourceDeclaration::exclusive("port", "8080"));
        let h = harness(provider);

        let conflicts = h
            .coordinator
            .check_resource_conflicts(&["web", "proxy", "api"])
            .await
            .unwrap();

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].key, "port:443");
        assert_eq!(conflicts[0].repositories, vec!["web", "proxy"]);
        assert_eq!(conflicts[0].severity, Severity::Medium);
        assert!(h.coordinator.find_resource("port", "8080").is_some());
    }

    #[tokio::test]
    async fn test_check_conflicts_counts_outside_holder() {
        let provider = StaticMetadataProvider::new()
            .with_resource("web", ResourceDeclaration::exclusive("port", "8080"));
        let h = harness(provider);
        let id = port(&h);
        h.coordinator
            .claim_resource(id, "legacy", &ClaimOperation::exclusive("deploy"))
            .unwrap();

        let conflicts = h.coordinator.check_resource_conflicts(&["web"]).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].repositories, vec!["legacy", "web"]);
        assert_eq!(conflicts[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn test_shared_overflow_resolution_keeps_shared_claims() {
        let provider = StaticMetadataProvider::new()
            .with_resource("a", ResourceDeclaration::shared("cache", "redis"))
            .with_resource("b", ResourceDeclaration::shared("cache", "redis"))
            .with_resource("c", ResourceDeclaration::shared("cache", "redis"));
        let h = harness(provider);
        let cache = h
            .coordinator
            .register_shared_resource(ResourceSpec::new("cache", "redis").with_capacity(2))
            .unwrap();

        let conflicts = h
            .coordinator
            .check_resource_conflicts(&["a", "b", "c"])
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].severity, Severity::Low);
        assert!(!conflicts[0].is_exclusive_for("c"));

        let resolution = h.coordinator.generate_resolution(&conflicts[0]).unwrap();
        h.coordinator
            .claim_resource(cache, "b", &ClaimOperation::shared("read"))
            .unwrap();
        let result = h
            .coordinator
            .apply_resolution(&resolution, REASSIGN_LOWER_PRIORITY)
            .unwrap();

        assert!(result.success);
        let status = h.coordinator.get_resource_status(cache).unwrap();
        assert_eq!(status.active_claims.len(), 1);
        assert_eq!(status.active_claims[0].repository, "a");
        assert!(!status.active_claims[0].exclusive);
        assert_eq!(status.available_capacity, 1);
    }

    #[test]
    fn test_out_of_range_ttl_rejected() {
        let h = harness(StaticMetadataProvider::new());
        let id = port(&h);

        for ttl in [u64::MAX, 1 << 63] {
            let result = h.coordinator.claim_resource(
                id,
                "A",
                &ClaimOperation::exclusive("deploy").with_ttl_ms(ttl),
            );
            assert!(matches!(result, Err(CoordinationError::InvalidInput(_))));
        }

        h.coordinator
            .claim_resource(id, "A", &ClaimOperation::exclusive("deploy"))
            .unwrap();
        assert!(matches!(
            h.coordinator
                .claim_resource(id, "B", &ClaimOperation::exclusive("deploy").with_ttl_ms(u64::MAX)),
            Err(CoordinationError::InvalidInput(_))
        ));
        assert!(matches!(
            h.coordinator.claim_resource(id, "B", &ClaimOperation::exclusive("deploy")),
            Err(CoordinationError::ResourceConflict { .. })
        ));
        assert_eq!(h.coordinator.get_system_health().active_claims, 1);
    }

    #[test]
    fn test_out_of_range_window_fails_change() {
        let mut config = CoordinatorConfig::default();
        config.resolution.time_window_ms = u64::MAX;
        let coordinator = SharedResourceCoordinator::new(
            &config,
            Arc::new(StaticMetadataProvider::new()),
            Arc::new(BroadcastEventSink::default()),
            Arc::new(ManualClock::default()),
        );
        let id = coordinator
            .register_shared_resource(ResourceSpec::new("port", "8080"))
            .unwrap();
        let conflict = Conflict::resource(
            id,
            "port:8080".to_string(),
            vec!["A".to_string(), "B".to_string()],
            Severity::Medium,
            Utc::now(),
        );

        let resolution = coordinator.generate_resolution(&conflict).unwrap();
        let result = coordinator
            .apply_resolution(&resolution, SPLIT_BY_TIME_WINDOW)
            .unwrap();

        assert!(!result.success);
        assert!(matches!(result.changes[1].outcome, ChangeOutcome::Failed { .. }));
    }

    #[test]
    fn test_reassign_lower_priority() {
        let h = harness(StaticMetadataProvider::new());
        let id = port(&h);
        h.coordinator
            .claim_resource(id, "B", &ClaimOperation::exclusive("deploy"))
            .unwrap();

        let conflict = Conflict::resource(
            id,
            "port:8080".to_string(),
            vec!["A".to_string(), "B".to_string()],
            Severity::Medium,
            h.clock.now(),
        );
        let resolution = h.coordinator.generate_resolution(&conflict).unwrap();
        let result = h
            .coordinator
            .apply_resolution(&resolution, REASSIGN_LOWER_PRIORITY)
            .unwrap();

        assert!(result.success);
        let holders: Vec<_> = h
            .coordinator
            .get_resource_status(id)
            .unwrap()
            .active_claims
            .into_iter()
            .map(|c| c.repository)
            .collect();
        assert_eq!(holders, vec!["A"]);
        assert_eq!(h.coordinator.get_conflict_history(None).len(), 1);
    }

    #[test]
    fn test_dry_run_does_not_mutate() {
        let h = harness(StaticMetadataProvider::new());
        let id = port(&h);
        let conflict = Conflict::resource(
            id,
            "port:8080".to_string(),
            vec!["A".to_string(), "B".to_string()],
            Severity::Medium,
            h.clock.now(),
        );
        let resolution = h.coordinator.generate_resolution(&conflict).unwrap();

        let result = h
            .coordinator
            .dry_run_resolution(&resolution, REASSIGN_LOWER_PRIORITY)
            .unwrap();

        assert!(result.dry_run);
        assert!(result
            .changes
            .iter()
            .all(|c| c.outcome == ChangeOutcome::Planned));
        assert!(h.coordinator.get_resource_status(id).unwrap().active_claims.is_empty());
        assert!(h.coordinator.get_conflict_history(None).is_empty());
        assert!(h.events.recent().is_empty());
    }

    #[tokio::test]
    async fn test_shared_configuration_and_resolution() {
        let provider = StaticMetadataProvider::new()
            .with_configuration("a", "dns.upstream", json!("1.1.1.1"))
            .with_configuration("b", "dns.upstream", json!("9.9.9.9"))
            .with_configuration("a", "timezone", json!("UTC"))
            .with_configuration("b", "timezone", json!("UTC"))
            .with_configuration("b", "log", json!({"level": "info"}));
        let h = harness(provider);

        let coordination = h
            .coordinator
            .coordinate_shared_configuration(&["a", "b"])
            .await
            .unwrap();

        assert_eq!(coordination.status, SharedConfigStatus::ConflictsDetected);
        assert_eq!(coordination.conflicts.len(), 1);
        assert_eq!(coordination.conflicts[0].key, "dns.upstream");
        assert_eq!(coordination.shared_configs["timezone"].len(), 2);

        let resolution = &coordination.resolutions[0];
        h.coordinator.apply_resolution(resolution, MANUAL_MERGE).unwrap();
        assert_eq!(h.coordinator.pending_reviews(), vec!["dns.upstream"]);

        h.coordinator
            .apply_resolution(resolution, KEEP_FIRST_REGISTERED)
            .unwrap();
        let resolved = h.coordinator.resolved_config("dns.upstream").unwrap();
        assert_eq!(resolved.value, json!("1.1.1.1"));
        assert_eq!(resolved.source.as_deref(), Some("a"));
        assert!(h.coordinator.pending_reviews().is_empty());
    }

    #[tokio::test]
    async fn test_claim_with_retry_gives_up() {
        let h = harness(StaticMetadataProvider::new());
        let id = port(&h);
        h.coordinator
            .claim_resource(id, "A", &ClaimOperation::exclusive("deploy"))
            .unwrap();

        let result = h
            .coordinator
            .claim_resource_with_retry(id, "B", &ClaimOperation::exclusive("deploy"))
            .await;
        assert!(matches!(result, Err(CoordinationError::ResourceConflict { .. })));
    }
}
