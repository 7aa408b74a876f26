/*
 * GitOps Coordination - multi-repository deployment control plane
 *
 * Architecture:
 * - Dependency Analyzer (discovery, cycles, deployment waves, change impact)
 * - Shared Resource Coordinator (TTL claims, conflicts, resolutions)
 * - Pipeline Orchestrator (staged execution, bounded concurrency, cancellation)
 * - Pluggable collaborators (metadata provider, event sink, clock)
 */

// Public modules
pub mod analyzer;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod dag;
pub mod dependency_graph;
pub mod error;
pub mod events;
pub mod orchestration;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod resources;
pub mod service;
pub mod telemetry;

// Re-exports
pub use analyzer::{
    AnalysisMetadata, AnalysisResult, ChangeType, Coordination, DependencyAnalyzer, DirectImpact,
    ImpactAnalysis, RepositoryImportance, RiskAssessment, RiskLevel, TransitiveImpact,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoordinatorConfig, CyclePolicy, DeploymentOptions};
pub use conflict::{
    ChangeOutcome, Conflict, ConflictType, ProposedChange, Resolution, ResolutionResult,
    ResolutionStrategy, Severity,
};
pub use coordinator::{
    HealthStatus, ResourceStatus, SharedConfigCoordination, SharedConfigStatus,
    SharedResourceCoordinator, SystemHealth,
};
pub use dag::{Adjacency, Cycle};
pub use dependency_graph::{
    DependencyEdge, DependencyGraphStore, DependencyKind, ImpactLevel, RepoId,
};
pub use error::{CoordinationError, ErrorCategory, Result};
pub use events::{
    BroadcastEventSink, CoordinationEvent, EventSink, NoopEventSink, TracingEventSink,
};
pub use orchestration::{
    Orchestration, OrchestrationStatus, StageRun, StageStatus, TaskRun, TaskStatus,
};
pub use orchestrator::{OrchestrationHandle, PipelineOrchestrator};
pub use pipeline::{
    PipelineConfig, PipelineOptions, StageSpec, TaskContext, TaskHandler, TaskOutput, TaskSpec,
};
pub use provider::{RepositoryMetadataProvider, StaticMetadataProvider};
pub use resources::{
    ClaimId, ClaimOperation, ResourceClaim, ResourceDeclaration, ResourceId, ResourceSpec,
    SharedResource,
};
pub use service::{CoordinationService, CoordinationServiceBuilder, Deployment, DeploymentStatus};
