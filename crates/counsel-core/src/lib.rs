//! Core error definitions and tracing setup for the counsel agent orchestrator.
//!
//! # Main types
//!
//! - [`CounselError`]: Unified error enum covering configuration, queueing, and execution.
//! - [`CounselResult`]: Convenience alias for `Result<T, CounselError>`.

/// Tracing subscriber initialisation.
pub mod telemetry;

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the orchestrator.
///
/// Variants follow the failure taxonomy of the scheduling pipeline: configuration
/// problems are fatal at registration time, everything else is recovered by the
/// component that observes it.
#[derive(Debug, thiserror::Error)]
pub enum CounselError {
    /// Bad schedule expression, invalid concurrency, unbound capability, unreadable config.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An agent with the same id is already registered.
    #[error("Duplicate agent id: {0}")]
    DuplicateAgent(String),

    /// Unknown agent or task id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A context provider failed or did not answer in time.
    #[error("Context unavailable: {0}")]
    ContextUnavailable(String),

    /// The collaborator did not finish before the task deadline.
    #[error("Execution of task {task_id} timed out after {timeout_ms}ms")]
    ExecutionTimeout {
        /// Task whose invocation timed out.
        task_id: Uuid,
        /// Deadline that was applied.
        timeout_ms: u64,
    },

    /// The completion/action collaborator returned an error.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// The category result handler rejected the result.
    #[error("Result handler error: {0}")]
    ResultHandler(String),

    /// A task queue is closed or unreachable.
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CounselError {
    /// Whether this error must abort registration instead of being recovered.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CounselError::Configuration(_) | CounselError::DuplicateAgent(_)
        )
    }

    /// Whether the execution engine should retry the task that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CounselError::ExecutionTimeout { .. }
                | CounselError::Collaborator(_)
                | CounselError::ResultHandler(_)
                | CounselError::ContextUnavailable(_)
        )
    }
}

/// A convenience `Result` alias using [`CounselError`].
pub type CounselResult<T> = Result<T, CounselError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(CounselError::Configuration("bad cron".into()).is_configuration());
        assert!(CounselError::DuplicateAgent("a".into()).is_configuration());
        assert!(!CounselError::Collaborator("boom".into()).is_configuration());
    }

    #[test]
    fn test_retryable_classification() {
        let timeout = CounselError::ExecutionTimeout {
            task_id: Uuid::new_v4(),
            timeout_ms: 50,
        };
        assert!(timeout.is_retryable());
        assert!(CounselError::ResultHandler("rejected".into()).is_retryable());
        assert!(!CounselError::NotFound("agent".into()).is_retryable());
        assert!(!CounselError::QueueUnavailable("closed".into()).is_retryable());
    }

    #[test]
    fn test_timeout_display_mentions_deadline() {
        let id = Uuid::new_v4();
        let err = CounselError::ExecutionTimeout {
            task_id: id,
            timeout_ms: 1500,
        };
        let msg = err.to_string();
        assert!(msg.contains("1500ms"));
        assert!(msg.contains(&id.to_string()));
    }
}
