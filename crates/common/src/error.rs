//! Error types for Adaptest

use thiserror::Error;

/// Result type alias using Adaptest Error
pub type Result<T> = std::result::Result<T, Error>;

/// Adaptest error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Sandbox pool exhausted ({in_use}/{max_size} in use)")]
    PoolExhausted { in_use: usize, max_size: usize },

    #[error("Allocation conflict: {0}")]
    AllocationConflict(String),

    #[error("Sandbox {sandbox_id} is unhealthy: {reason}")]
    SandboxUnhealthy { sandbox_id: String, reason: String },

    #[error("Step {step_number} execution failed: {reason}")]
    StepExecution { step_number: u32, reason: String },

    #[error("Recovery failed for step {step_number}: {reason}")]
    RecoveryFailed { step_number: u32, reason: String },

    #[error("Adaptation budget exhausted: {used} of {budget} adaptations used")]
    AdaptationBudgetExhausted { used: u32, budget: u32 },

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Test run cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors the detecting component retries locally before escalating.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::StepExecution { .. }
                | Error::Runtime(_)
                | Error::Timeout { .. }
                | Error::PoolExhausted { .. }
        )
    }

    /// Errors that end a test run and are persisted on it.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            Error::AdaptationBudgetExhausted { .. }
                | Error::AllocationConflict(_)
                | Error::RecoveryFailed { .. }
                | Error::Cancelled
        )
    }

    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::Runtime("exec failed".into()).is_transient());
        assert!(!Error::Runtime("exec failed".into()).is_run_terminal());
        assert!(Error::AdaptationBudgetExhausted { used: 3, budget: 3 }.is_run_terminal());
        assert!(!Error::AllocationConflict("run-1".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = Error::PoolExhausted { in_use: 2, max_size: 2 };
        assert_eq!(err.to_string(), "Sandbox pool exhausted (2/2 in use)");
    }
}
