use crate::orchestration::OrchestrationStatus;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, CoordinationError>;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate resource: {resource_type}:{identifier} already registered as {existing}")]
    DuplicateResource {
        resource_type: String,
        identifier: String,
        existing: Uuid,
    },

    #[error("Resource conflict on {resource_id} for {repository} (held by: {})", holders.join(", "))]
    ResourceConflict {
        resource_id: Uuid,
        repository: String,
        holders: Vec<String>,
    },

    #[error("Unknown strategy '{strategy}' (available: {})", available.join(", "))]
    UnknownStrategy {
        strategy: String,
        available: Vec<String>,
    },

    #[error("Circular dependency detected: {}", format_cycles(cycles))]
    CircularDependency { cycles: Vec<Vec<String>> },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Orchestration {id} is not running (status: {status})")]
    NotRunning {
        id: Uuid,
        status: OrchestrationStatus,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Metadata provider error: {0}")]
    Provider(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|cycle| {
            let mut path = cycle.clone();
            if let Some(first) = cycle.first() {
                path.push(first.clone());
            }
            path.join(" -> ")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

impl CoordinationError {
    pub fn invalid_input<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidInput(e.to_string())
    }

    pub fn provider<E: std::fmt::Display>(e: E) -> Self {
        Self::Provider(e.to_string())
    }

    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    /// Retry classification for callers deciding whether to re-submit
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ResourceConflict { .. } | Self::Timeout(_) | Self::Provider(_) => {
                ErrorCategory::Transient
            }
            Self::Io(_) => ErrorCategory::Infrastructure,
            _ => ErrorCategory::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - caller may retry (e.g., contention, timeout)
    Transient,
    /// Permanent error - don't retry (e.g., invalid input, unknown strategy)
    Permanent,
    /// Infrastructure error - alert ops (e.g., disk full)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_transient() {
        let err = CoordinationError::ResourceConflict {
            resource_id: Uuid::new_v4(),
            repository: "org/web".to_string(),
            holders: vec!["org/api".to_string()],
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("org/api"));
    }

    #[test]
    fn test_invalid_input_is_permanent() {
        let err = CoordinationError::invalid_input("empty repository list");
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cycle_message_closes_loop() {
        let err = CoordinationError::CircularDependency {
            cycles: vec![vec!["a".to_string(), "b".to_string()]],
        };
        assert_eq!(err.to_string(), "Circular dependency detected: a -> b -> a");
    }

    #[test]
    fn test_unknown_strategy_lists_available() {
        let err = CoordinationError::UnknownStrategy {
            strategy: "yolo".to_string(),
            available: vec!["wait-and-retry".to_string(), "manual-merge".to_string()],
        };
        assert!(err.to_string().contains("wait-and-retry, manual-merge"));
    }
}
