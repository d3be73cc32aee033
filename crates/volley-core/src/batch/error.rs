//! Error types for batch processing.

use crate::batch::config::BatchConfigError;
use crate::batch::types::BatchStatus;
use std::time::Duration;
use thiserror::Error;

/// Result type for batch operations.
pub type Result<T> = std::result::Result<T, BatchError>;

/// Errors that can occur while submitting, scheduling, or running batches.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The batch carries no requests.
    #[error("Batch request list is empty: at least one request is required")]
    EmptyBatch,

    /// Generic validation failure at submission time.
    #[error("Batch validation failed: {0}")]
    Validation(String),

    /// A batch with this ID is already tracked.
    #[error("Batch '{0}' already exists")]
    Duplicate(String),

    /// The batch depends on an ID nobody submitted.
    #[error("Unknown dependency '{0}'")]
    UnknownDependency(String),

    /// A dependency reached a terminal state other than completed.
    #[error("Dependency '{dependency}' did not complete successfully (status: {status})")]
    DependencyFailed {
        /// ID of the dependency batch.
        dependency: String,
        /// Terminal status the dependency ended in.
        status: BatchStatus,
    },

    /// The bounded queue has no room.
    #[error("Batch queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// No batch with this ID is tracked.
    #[error("Batch '{0}' not found")]
    NotFound(String),

    /// The batch exceeded its wall-clock budget.
    #[error("Batch timeout after {0:?}")]
    Timeout(Duration),

    /// The orchestration itself failed (not an individual request).
    #[error("Batch execution failed: {0}")]
    Execution(String),

    /// The batch was cancelled by the caller.
    #[error("Batch was cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Invalid batch configuration: {0}")]
    Config(#[from] BatchConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_batch_mentions_empty() {
        assert!(BatchError::EmptyBatch.to_string().contains("empty"));
    }

    #[test]
    fn test_timeout_mentions_timeout() {
        let err = BatchError::Timeout(Duration::from_millis(100));
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_dependency_failed_display() {
        let err = BatchError::DependencyFailed {
            dependency: "batch-a".to_string(),
            status: BatchStatus::Cancelled,
        };
        let msg = err.to_string();
        assert!(msg.contains("batch-a"));
        assert!(msg.contains("cancelled"));
    }

    #[test]
    fn test_config_error_conversion() {
        let err: BatchError = BatchConfigError::InvalidMaxQueueSize.into();
        assert!(matches!(err, BatchError::Config(BatchConfigError::InvalidMaxQueueSize)));
        assert!(err.to_string().contains("Invalid batch configuration"));
    }
}
