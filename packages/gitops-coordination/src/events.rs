//! Lifecycle notifications published by the coordination core
//!
//! The core only depends on the [`EventSink`] trait. Publishing is
//! fire-and-forget: sinks must not block and must swallow their own delivery
//! failures, so an unavailable monitor never fails a claim or a pipeline.

use crate::dependency_graph::RepoId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// Notification payloads
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum CoordinationEvent {
    ResourceClaimed {
        resource_id: Uuid,
        claim_id: Uuid,
        repository: RepoId,
        operation: String,
        exclusive: bool,
        at: DateTime<Utc>,
    },
    ResourceReleased {
        resource_id: Uuid,
        claim_id: Uuid,
        repository: RepoId,
        at: DateTime<Utc>,
    },
    ClaimExpired {
        resource_id: Uuid,
        claim_id: Uuid,
        repository: RepoId,
        at: DateTime<Utc>,
    },
    ResolutionApplied {
        conflict_id: Uuid,
        strategy: String,
        success: bool,
        at: DateTime<Utc>,
    },
    StageStarted {
        orchestration_id: Uuid,
        stage: String,
        index: usize,
        at: DateTime<Utc>,
    },
    StageCompleted {
        orchestration_id: Uuid,
        stage: String,
        index: usize,
        status: String,
        at: DateTime<Utc>,
    },
    TaskStarted {
        orchestration_id: Uuid,
        stage: String,
        repository: RepoId,
        task_type: String,
        at: DateTime<Utc>,
    },
    TaskCompleted {
        orchestration_id: Uuid,
        stage: String,
        repository: RepoId,
        task_type: String,
        status: String,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    OrchestrationCompleted {
        orchestration_id: Uuid,
        at: DateTime<Utc>,
    },
    OrchestrationFailed {
        orchestration_id: Uuid,
        reason: String,
        at: DateTime<Utc>,
    },
    OrchestrationCancelled {
        orchestration_id: Uuid,
        at: DateTime<Utc>,
    },
}

impl CoordinationEvent {
    /// Event name as seen by monitoring consumers
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResourceClaimed { .. } => "resourceClaimed",
            Self::ResourceReleased { .. } => "resourceReleased",
            Self::ClaimExpired { .. } => "claimExpired",
            Self::ResolutionApplied { .. } => "resolutionApplied",
            Self::StageStarted { .. } => "stage:started",
            Self::StageCompleted { .. } => "stage:completed",
            Self::TaskStarted { .. } => "task:started",
            Self::TaskCompleted { .. } => "task:completed",
            Self::OrchestrationCompleted { .. } => "orchestration:completed",
            Self::OrchestrationFailed { .. } => "orchestration:failed",
            Self::OrchestrationCancelled { .. } => "orchestration:cancelled",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Receiver of lifecycle notifications
pub trait EventSink: Send + Sync {
    fn publish(&self, event: CoordinationEvent);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: CoordinationEvent) {}
}

/// Writes every event to the tracing pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: CoordinationEvent) {
        info!(event = event.name(), payload = %event.payload(), "coordination event");
    }
}

const DEFAULT_EVENT_HISTORY: usize = 100;

/// Fan-out over a tokio broadcast channel, keeping the most recent events
/// for late subscribers
pub struct BroadcastEventSink {
    sender: broadcast::Sender<CoordinationEvent>,
    history: Mutex<VecDeque<CoordinationEvent>>,
    max_history: usize,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize, max_history: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(max_history)),
            max_history,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.sender.subscribe()
    }

    /// Most recent events, oldest first
    pub fn recent(&self) -> Vec<CoordinationEvent> {
        self.history.lock().iter().cloned().collect()
    }

    /// Names of the recent events, oldest first
    pub fn recent_names(&self) -> Vec<&'static str> {
        self.history.lock().iter().map(|e| e.name()).collect()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024, DEFAULT_EVENT_HISTORY)
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: CoordinationEvent) {
        {
            let mut history = self.history.lock();
            if self.max_history > 0 {
                if history.len() >= self.max_history {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }

        // No subscribers is not a failure
        if self.sender.send(event).is_err() {
            debug!("No subscribers for coordination event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed() -> CoordinationEvent {
        CoordinationEvent::OrchestrationCompleted {
            orchestration_id: Uuid::new_v4(),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(completed().name(), "orchestration:completed");
        let claimed = CoordinationEvent::ResourceClaimed {
            resource_id: Uuid::new_v4(),
            claim_id: Uuid::new_v4(),
            repository: "org/web".to_string(),
            operation: "deploy".to_string(),
            exclusive: true,
            at: Utc::now(),
        };
        assert_eq!(claimed.name(), "resourceClaimed");
        assert_eq!(claimed.payload()["repository"], "org/web");
    }

    #[test]
    fn test_broadcast_without_subscribers_keeps_history() {
        let sink = BroadcastEventSink::new(8, 2);
        sink.publish(completed());
        sink.publish(completed());
        sink.publish(completed());

        assert_eq!(sink.recent().len(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscriber() {
        let sink = BroadcastEventSink::default();
        let mut rx = sink.subscribe();

        sink.publish(completed());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "orchestration:completed");
    }
}
