//! Shared resource registry and lock table
//!
//! A resource with capacity N admits up to N concurrent shared claims, or a
//! single exclusive claim that excludes everything else. A repository holds
//! at most one claim per resource. Expired claims are reaped, never renewed.

use crate::dependency_graph::RepoId;
use crate::error::{CoordinationError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type ResourceId = Uuid;
pub type ClaimId = Uuid;

/// Registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// e.g. `port`, `config-file`, `credential`, `endpoint`
    pub resource_type: String,
    pub identifier: String,
    /// Defaults to 1 (exclusive)
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ResourceSpec {
    pub fn new(resource_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            identifier: identifier.into(),
            capacity: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Registered resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedResource {
    pub id: ResourceId,
    pub resource_type: String,
    pub identifier: String,
    pub capacity: u32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub registered_at: DateTime<Utc>,
}

impl SharedResource {
    pub(crate) fn from_spec(spec: ResourceSpec, now: DateTime<Utc>) -> Result<Self> {
        let resource_type = spec.resource_type.trim().to_string();
        let identifier = spec.identifier.trim().to_string();

        if resource_type.is_empty() {
            return Err(CoordinationError::invalid_input("resource type must not be empty"));
        }
        if identifier.is_empty() {
            return Err(CoordinationError::invalid_input(
                "resource identifier must not be empty",
            ));
        }

        let capacity = spec.capacity.unwrap_or(1);
        if capacity == 0 {
            return Err(CoordinationError::InvalidInput(format!(
                "capacity of {}:{} must be at least 1",
                resource_type, identifier
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            resource_type,
            identifier,
            capacity,
            metadata: spec.metadata,
            registered_at: now,
        })
    }

    /// `type:identifier`
    pub fn key(&self) -> String {
        format!("{}:{}", self.resource_type, self.identifier)
    }
}

/// A repository's declared use of a shared resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    pub resource_type: String,
    pub identifier: String,
    #[serde(default = "default_true")]
    pub exclusive: bool,
}

fn default_true() -> bool {
    true
}

impl ResourceDeclaration {
    pub fn exclusive(resource_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            identifier: identifier.into(),
            exclusive: true,
        }
    }

    pub fn shared(resource_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            exclusive: false,
            ..Self::exclusive(resource_type, identifier)
        }
    }
}

/// A registered resource a task must hold while it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub resource_id: ResourceId,
    pub exclusive: bool,
}

/// How a claim intends to use the resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimOperation {
    pub operation_type: String,
    pub exclusive: bool,
    /// Overrides the coordinator's default TTL
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

impl ClaimOperation {
    pub fn exclusive(operation_type: impl Into<String>) -> Self {
        Self {
            operation_type: operation_type.into(),
            exclusive: true,
            ttl_ms: None,
        }
    }

    pub fn shared(operation_type: impl Into<String>) -> Self {
        Self {
            exclusive: false,
            ..Self::exclusive(operation_type)
        }
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }
}

/// Active reservation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub id: ClaimId,
    pub resource_id: ResourceId,
    pub repository: RepoId,
    pub operation_type: String,
    pub exclusive: bool,
    pub ttl_ms: Option<u64>,
    pub claimed_at: DateTime<Utc>,
    /// `claimed_at + ttl` when a TTL applies
    pub expires_at: Option<DateTime<Utc>>,
}

/// `now + ms`, or `None` when it leaves chrono's representable range
pub fn offset_by_ms(now: DateTime<Utc>, ms: u64) -> Option<DateTime<Utc>> {
    i64::try_from(ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .and_then(|delta| now.checked_add_signed(delta))
}

/// Expiry of a claim granted at `now` with `ttl_ms`
pub(crate) fn claim_expiry(now: DateTime<Utc>, ttl_ms: Option<u64>) -> Result<Option<DateTime<Utc>>> {
    match ttl_ms {
        None => Ok(None),
        Some(0) => Err(CoordinationError::invalid_input("claim ttl must be positive")),
        Some(ttl) => offset_by_ms(now, ttl).map(Some).ok_or_else(|| {
            CoordinationError::InvalidInput(format!("claim ttl of {}ms is out of range", ttl))
        }),
    }
}

impl ResourceClaim {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// Resource id → claims. Not synchronized; the coordinator owns the guard.
#[derive(Debug, Default)]
pub struct LockTable {
    claims: HashMap<ResourceId, Vec<ResourceClaim>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired claims on one resource
    pub fn reap_expired(&mut self, resource_id: ResourceId, now: DateTime<Utc>) -> Vec<ResourceClaim> {
        let Some(claims) = self.claims.get_mut(&resource_id) else {
            return Vec::new();
        };

        let (expired, active): (Vec<_>, Vec<_>) =
            claims.drain(..).partition(|claim| claim.is_expired(now));
        *claims = active;
        if claims.is_empty() {
            self.claims.remove(&resource_id);
        }
        expired
    }

    /// Remove expired claims everywhere
    pub fn reap_all_expired(&mut self, now: DateTime<Utc>) -> Vec<ResourceClaim> {
        let ids: Vec<ResourceId> = self.claims.keys().copied().collect();
        ids.into_iter()
            .flat_map(|id| self.reap_expired(id, now))
            .collect()
    }

    /// Admission check + insert. Expired claims must be reaped beforehand.
    pub fn admit(
        &mut self,
        resource: &SharedResource,
        repository: &str,
        operation: &ClaimOperation,
        ttl_ms: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<ResourceClaim> {
        let expires_at = claim_expiry(now, ttl_ms)?;
        let active: Vec<&ResourceClaim> = self
            .claims
            .get(&resource.id)
            .map(|claims| claims.iter().filter(|c| !c.is_expired(now)).collect())
            .unwrap_or_default();

        let conflict = || CoordinationError::ResourceConflict {
            resource_id: resource.id,
            repository: repository.to_string(),
            holders: active.iter().map(|c| c.repository.clone()).collect(),
        };

        if active.iter().any(|c| c.repository == repository) {
            return Err(conflict());
        }

        let admitted = if operation.exclusive || resource.capacity == 1 {
            active.is_empty()
        } else {
            !active.iter().any(|c| c.exclusive) && (active.len() as u32) < resource.capacity
        };

        if !admitted {
            return Err(conflict());
        }

        let claim = ResourceClaim {
            id: Uuid::new_v4(),
            resource_id: resource.id,
            repository: repository.to_string(),
            operation_type: operation.operation_type.clone(),
            exclusive: operation.exclusive || resource.capacity == 1,
            ttl_ms,
            claimed_at: now,
            expires_at,
        };

        self.claims
            .entry(resource.id)
            .or_default()
            .push(claim.clone());
        Ok(claim)
    }

    pub fn release(&mut self, resource_id: ResourceId, claim_id: ClaimId) -> Option<ResourceClaim> {
        let claims = self.claims.get_mut(&resource_id)?;
        let pos = claims.iter().position(|c| c.id == claim_id)?;
        let claim = claims.remove(pos);
        if claims.is_empty() {
            self.claims.remove(&resource_id);
        }
        Some(claim)
    }

    /// Drop every claim `repository` holds on the resource
    pub fn release_repository(&mut self, resource_id: ResourceId, repository: &str) -> Vec<ResourceClaim> {
        let Some(claims) = self.claims.get_mut(&resource_id) else {
            return Vec::new();
        };
        let (released, kept): (Vec<_>, Vec<_>) =
            claims.drain(..).partition(|c| c.repository == repository);
        *claims = kept;
        if claims.is_empty() {
            self.claims.remove(&resource_id);
        }
        released
    }

    pub fn active_claims(&self, resource_id: ResourceId, now: DateTime<Utc>) -> Vec<ResourceClaim> {
        self.claims
            .get(&resource_id)
            .map(|claims| {
                claims
                    .iter()
                    .filter(|c| !c.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn active_count(&self, now: DateTime<Utc>) -> usize {
        self.claims
            .values()
            .flat_map(|claims| claims.iter())
            .filter(|c| !c.is_expired(now))
            .count()
    }

    /// Expired claims still waiting for a sweep
    pub fn expired_count(&self, now: DateTime<Utc>) -> usize {
        self.claims
            .values()
            .flat_map(|claims| claims.iter())
            .filter(|c| c.is_expired(now))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(capacity: u32) -> SharedResource {
        SharedResource::from_spec(
            ResourceSpec::new("port", "8080").with_capacity(capacity),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_spec_validation() {
        let now = Utc::now();
        assert!(SharedResource::from_spec(ResourceSpec::new("", "x"), now).is_err());
        assert!(SharedResource::from_spec(ResourceSpec::new("port", "  "), now).is_err());
        assert!(
            SharedResource::from_spec(ResourceSpec::new("port", "1").with_capacity(0), now)
                .is_err()
        );
        let res = SharedResource::from_spec(ResourceSpec::new("port", "80"), now).unwrap();
        assert_eq!(res.capacity, 1);
        assert_eq!(res.key(), "port:80");
    }

    #[test]
    fn test_exclusive_admission() {
        let res = resource(1);
        let mut table = LockTable::new();
        let now = Utc::now();

        table
            .admit(&res, "a", &ClaimOperation::exclusive("deploy"), None, now)
            .unwrap();
        let second = table.admit(&res, "b", &ClaimOperation::exclusive("deploy"), None, now);

        match second {
            Err(CoordinationError::ResourceConflict { holders, .. }) => {
                assert_eq!(holders, vec!["a".to_string()]);
            }
            other => panic!("Expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_capacity() {
        let res = resource(2);
        let mut table = LockTable::new();
        let now = Utc::now();
        let op = ClaimOperation::shared("read");

        table.admit(&res, "a", &op, None, now).unwrap();
        table.admit(&res, "b", &op, None, now).unwrap();
        assert!(table.admit(&res, "c", &op, None, now).is_err());
        assert_eq!(table.active_count(now), 2);
    }

    #[test]
    fn test_exclusive_blocks_shared_and_vice_versa() {
        let res = resource(3);
        let mut table = LockTable::new();
        let now = Utc::now();

        table
            .admit(&res, "a", &ClaimOperation::shared("read"), None, now)
            .unwrap();
        assert!(table
            .admit(&res, "b", &ClaimOperation::exclusive("write"), None, now)
            .is_err());

        let mut table = LockTable::new();
        table
            .admit(&res, "a", &ClaimOperation::exclusive("write"), None, now)
            .unwrap();
        assert!(table
            .admit(&res, "b", &ClaimOperation::shared("read"), None, now)
            .is_err());
    }

    #[test]
    fn test_one_slot_per_repository() {
        let res = resource(5);
        let mut table = LockTable::new();
        let now = Utc::now();
        let op = ClaimOperation::shared("read");

        table.admit(&res, "a", &op, None, now).unwrap();
        assert!(table.admit(&res, "a", &op, None, now).is_err());
    }

    #[test]
    fn test_expiry_and_reap() {
        let res = resource(1);
        let mut table = LockTable::new();
        let now = Utc::now();

        let claim = table
            .admit(&res, "a", &ClaimOperation::exclusive("deploy"), Some(1_000), now)
            .unwrap();
        assert_eq!(claim.expires_at, Some(now + Duration::milliseconds(1_000)));

        let later = now + Duration::seconds(2);
        assert_eq!(table.expired_count(later), 1);
        assert_eq!(table.reap_all_expired(later).len(), 1);
        assert_eq!(table.reap_all_expired(later).len(), 0);
        assert_eq!(table.expired_count(later), 0);
    }

    #[test]
    fn test_out_of_range_ttl_rejected() {
        let res = resource(1);
        let mut table = LockTable::new();
        let now = Utc::now();
        let op = ClaimOperation::exclusive("deploy");

        for ttl in [u64::MAX, 1 << 63, i64::MAX as u64] {
            assert!(matches!(
                table.admit(&res, "a", &op, Some(ttl), now),
                Err(CoordinationError::InvalidInput(_))
            ));
        }
        assert!(table.active_claims(res.id, now).is_empty());

        // Still exclusive after the rejected attempts
        table.admit(&res, "a", &op, Some(1_000), now).unwrap();
        assert!(table.admit(&res, "b", &op, None, now).is_err());
    }

    #[test]
    fn test_offset_by_ms() {
        let now = Utc::now();
        assert_eq!(offset_by_ms(now, 1_500), Some(now + Duration::milliseconds(1_500)));
        assert_eq!(offset_by_ms(now, u64::MAX), None);
        assert_eq!(offset_by_ms(now, i64::MAX as u64), None);
    }

    #[test]
    fn test_release() {
        let res = resource(1);
        let mut table = LockTable::new();
        let now = Utc::now();

        let claim = table
            .admit(&res, "a", &ClaimOperation::exclusive("deploy"), None, now)
            .unwrap();
        assert!(table.release(res.id, Uuid::new_v4()).is_none());
        assert!(table.release(res.id, claim.id).is_some());
        assert!(table.release(res.id, claim.id).is_none());
        assert!(table.active_claims(res.id, now).is_empty());
    }
}
