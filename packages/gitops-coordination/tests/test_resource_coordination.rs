//! Integration tests for the shared resource coordinator
//!
//! Covers:
//! - Exclusive claims, conflicts, release and retry
//! - Concurrent claim races
//! - TTL expiry and idempotent cleanup
//! - Resolution strategies (apply, dry run, unknown strategy)
//! - Shared configuration coordination

use chrono::{Duration, Utc};
use gitops_coordination::conflict::{
    KEEP_MOST_RECENT, MANUAL_MERGE, REASSIGN_LOWER_PRIORITY, SPLIT_BY_TIME_WINDOW,
};
use gitops_coordination::{
    BroadcastEventSink, ChangeOutcome, ClaimOperation, Clock, Conflict, CoordinationError,
    CoordinatorConfig, HealthStatus, ManualClock, RepositoryMetadataProvider, ResourceDeclaration,
    ResourceSpec, Severity, SharedResourceCoordinator, StaticMetadataProvider,
};
use serde_json::json;
use std::sync::Arc;

struct Harness {
    coordinator: Arc<SharedResourceCoordinator>,
    clock: Arc<ManualClock>,
    events: Arc<BroadcastEventSink>,
}

fn harness_with(provider: StaticMetadataProvider, config: CoordinatorConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let events = Arc::new(BroadcastEventSink::default());
    let provider: Arc<dyn RepositoryMetadataProvider> = Arc::new(provider);
    let coordinator = Arc::new(SharedResourceCoordinator::new(
        &config,
        provider,
        events.clone(),
        clock.clone() as Arc<dyn Clock>,
    ));
    Harness {
        coordinator,
        clock,
        events,
    }
}

fn harness(provider: StaticMetadataProvider) -> Harness {
    harness_with(provider, CoordinatorConfig::default())
}

#[tokio::test]
async fn test_port_claim_conflict_release_retry() {
    let h = harness(StaticMetadataProvider::new());
    let port = h
        .coordinator
        .register_shared_resource(ResourceSpec::new("port", "8080").with_capacity(1))
        .expect("Registration failed");

    let deploy = ClaimOperation::exclusive("deploy");
    let claim_a = h.coordinator.claim_resource(port, "A", &deploy).unwrap();

    match h.coordinator.claim_resource(port, "B", &deploy) {
        Err(CoordinationError::ResourceConflict { holders, .. }) => {
            assert_eq!(holders, vec!["A".to_string()]);
        }
        other => panic!("expected ResourceConflict, got {:?}", other),
    }

    assert!(h.coordinator.release_resource(port, claim_a));
    let claim_b = h.coordinator.claim_resource(port, "B", &deploy).unwrap();

    let status = h.coordinator.get_resource_status(port).unwrap();
    assert_eq!(status.active_claims.len(), 1);
    assert_eq!(status.active_claims[0].id, claim_b);
    assert_eq!(status.available_capacity, 0);

    assert_eq!(
        h.events.recent_names(),
        vec!["resourceClaimed", "resourceReleased", "resourceClaimed"]
    );
}

#[tokio::test]
async fn test_retry_succeeds_after_release() {
    let mut config = CoordinatorConfig::default();
    config.claims.retry_attempts = 10;
    config.claims.retry_backoff_ms = 10;
    let h = harness_with(StaticMetadataProvider::new(), config);
    let port = h
        .coordinator
        .register_shared_resource(ResourceSpec::new("port", "8080"))
        .unwrap();

    let deploy = ClaimOperation::exclusive("deploy");
    let claim_a = h.coordinator.claim_resource(port, "A", &deploy).unwrap();

    let releaser = {
        let coordinator = h.coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            coordinator.release_resource(port, claim_a)
        })
    };

    let claim_b = h
        .coordinator
        .claim_resource_with_retry(port, "B", &deploy)
        .await
        .expect("Retry should succeed once A releases");
    assert!(releaser.await.unwrap());
    assert_eq!(
        h.coordinator.get_resource_status(port).unwrap().active_claims[0].id,
        claim_b
    );
}

#[tokio::test]
async fn test_concurrent_exclusive_claims_one_wins() {
    let h = harness(StaticMetadataProvider::new());
    let db = h
        .coordinator
        .register_shared_resource(ResourceSpec::new("database", "primary").with_capacity(4))
        .unwrap();

    let attempts: Vec<_> = ["A", "B"]
        .into_iter()
        .map(|repo| {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move {
                coordinator.claim_resource(db, repo, &ClaimOperation::exclusive("migrate"))
            })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(CoordinationError::ResourceConflict { .. })))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_shared_claims_up_to_capacity() {
    let h = harness(StaticMetadataProvider::new());
    let cache = h
        .coordinator
        .register_shared_resource(ResourceSpec::new("cache", "redis").with_capacity(2))
        .unwrap();
    let read = ClaimOperation::shared("read");

    h.coordinator.claim_resource(cache, "A", &read).unwrap();
    h.coordinator.claim_resource(cache, "B", &read).unwrap();
    assert!(h.coordinator.claim_resource(cache, "C", &read).is_err());
    assert!(h
        .coordinator
        .claim_resource(cache, "C", &ClaimOperation::exclusive("flush"))
        .is_err());
}

#[tokio::test]
async fn test_release_unknown_claim_is_false() {
    let h = harness(StaticMetadataProvider::new());
    let port = h
        .coordinator
        .register_shared_resource(ResourceSpec::new("port", "8080"))
        .unwrap();

    assert!(!h.coordinator.release_resource(port, uuid::Uuid::new_v4()));
    assert!(!h
        .coordinator
        .release_resource(uuid::Uuid::new_v4(), uuid::Uuid::new_v4()));
}

#[tokio::test]
async fn test_claim_unknown_resource() {
    let h = harness(StaticMetadataProvider::new());
    let result = h.coordinator.claim_resource(
        uuid::Uuid::new_v4(),
        "A",
        &ClaimOperation::exclusive("deploy"),
    );
    assert!(matches!(result, Err(CoordinationError::ResourceNotFound(_))));
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let h = harness(StaticMetadataProvider::new());
    h.coordinator
        .register_shared_resource(ResourceSpec::new("port", "8080"))
        .unwrap();
    let result = h
        .coordinator
        .register_shared_resource(ResourceSpec::new("port", "8080"));
    assert!(matches!(
        result,
        Err(CoordinationError::DuplicateResource { .. })
    ));
}

#[tokio::test]
async fn test_expiry_and_idempotent_cleanup() {
    let h = harness(StaticMetadataProvider::new());
    let port = h
        .coordinator
        .register_shared_resource(ResourceSpec::new("port", "8080"))
        .unwrap();

    h.coordinator
        .claim_resource(port, "A", &ClaimOperation::exclusive("deploy").with_ttl_ms(1_000))
        .unwrap();
    h.clock.advance(Duration::seconds(2));

    assert_eq!(h.coordinator.get_system_health().status, HealthStatus::Degraded);
    assert_eq!(h.coordinator.cleanup_expired_locks(), 1);
    assert_eq!(h.coordinator.cleanup_expired_locks(), 0);
    assert_eq!(h.coordinator.get_system_health().status, HealthStatus::Healthy);
    assert!(h.events.recent_names().contains(&"claimExpired"));

    // Expired claims never block new ones
    h.coordinator
        .claim_resource(port, "B", &ClaimOperation::exclusive("deploy"))
        .unwrap();
}

#[tokio::test]
async fn test_unknown_strategy_mutates_nothing() {
    let h = harness(
        StaticMetadataProvider::new()
            .with_resource("A", ResourceDeclaration::exclusive("port", "8080"))
            .with_resource("B", ResourceDeclaration::exclusive("port", "8080")),
    );

    let conflicts = h.coordinator.check_resource_conflicts(&["A", "B"]).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    let resolution = h.coordinator.generate_resolution(&conflicts[0]).unwrap();
    let port = conflicts[0].resource_id.unwrap();
    let before = h.events.recent().len();

    let result = h.coordinator.apply_resolution(&resolution, "flip-a-coin");

    assert!(matches!(
        result,
        Err(CoordinationError::UnknownStrategy { .. })
    ));
    assert!(h.coordinator.get_conflict_history(None).is_empty());
    assert!(h.coordinator.get_resource_status(port).unwrap().active_claims.is_empty());
    assert_eq!(h.events.recent().len(), before);
}

#[tokio::test]
async fn test_reassign_moves_claim_to_first_repository() {
    let h = harness(StaticMetadataProvider::new());
    let port = h
        .coordinator
        .register_shared_resource(ResourceSpec::new("port", "8080"))
        .unwrap();
    h.coordinator
        .claim_resource(port, "B", &ClaimOperation::exclusive("deploy"))
        .unwrap();

    let conflict = Conflict::resource(
        port,
        "port:8080".to_string(),
        vec!["A".to_string(), "B".to_string()],
        Severity::High,
        h.clock.now(),
    );
    let resolution = h.coordinator.generate_resolution(&conflict).unwrap();

    let dry = h
        .coordinator
        .dry_run_resolution(&resolution, REASSIGN_LOWER_PRIORITY)
        .unwrap();
    assert!(dry.dry_run);
    assert!(dry
        .changes
        .iter()
        .all(|c| matches!(c.outcome, ChangeOutcome::Planned)));
    assert_eq!(
        h.coordinator.get_resource_status(port).unwrap().active_claims[0].repository,
        "B"
    );

    let applied = h
        .coordinator
        .apply_resolution(&resolution, REASSIGN_LOWER_PRIORITY)
        .unwrap();
    assert!(applied.success);

    let holders = h.coordinator.get_resource_status(port).unwrap().active_claims;
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].repository, "A");
    assert_eq!(h.coordinator.get_conflict_history(Some(10)).len(), 1);
}

#[tokio::test]
async fn test_split_by_time_window_records_windows() {
    let h = harness(
        StaticMetadataProvider::new()
            .with_resource("A", ResourceDeclaration::exclusive("database", "primary"))
            .with_resource("B", ResourceDeclaration::exclusive("database", "primary")),
    );
    let conflicts = h.coordinator.check_resource_conflicts(&["A", "B"]).await.unwrap();
    let resolution = h.coordinator.generate_resolution(&conflicts[0]).unwrap();

    h.coordinator
        .apply_resolution(&resolution, SPLIT_BY_TIME_WINDOW)
        .unwrap();

    let windows = h
        .coordinator
        .scheduled_windows(conflicts[0].resource_id.unwrap());
    assert_eq!(windows.len(), 2);
    assert!(windows[0].starts_at < windows[1].starts_at);
}

#[tokio::test]
async fn test_shared_configuration_resolution() {
    let h = harness(
        StaticMetadataProvider::new()
            .with_configuration("A", "log.level", json!("info"))
            .with_configuration("B", "log.level", json!("debug"))
            .with_configuration("A", "features", json!({"beta": true}))
            .with_configuration("B", "features", json!({"tracing": {"enabled": true}}))
            .with_configuration("A", "region", json!("eu-west-1"))
            .with_configuration("B", "region", json!("eu-west-1")),
    );

    let coordination = h
        .coordinator
        .coordinate_shared_configuration(&["A", "B"])
        .await
        .unwrap();
    assert_eq!(coordination.conflicts.len(), 2);
    assert_eq!(coordination.resolutions.len(), 2);

    let by_key = |key: &str| {
        coordination
            .conflicts
            .iter()
            .position(|c| c.key == key)
            .unwrap()
    };

    h.coordinator
        .apply_resolution(&coordination.resolutions[by_key("log.level")], KEEP_MOST_RECENT)
        .unwrap();
    assert_eq!(
        h.coordinator.resolved_config("log.level").unwrap().value,
        json!("debug")
    );

    h.coordinator
        .apply_resolution(&coordination.resolutions[by_key("features")], MANUAL_MERGE)
        .unwrap();
    assert_eq!(
        h.coordinator.resolved_config("features").unwrap().value,
        json!({"beta": true, "tracing": {"enabled": true}})
    );
    assert!(h.coordinator.pending_reviews().is_empty());
}
