//! Error types for the rollup engine.
//!
//! Task-level failures are classified so orchestrators can tell configuration
//! problems (never retried) from collaborator failures (resumed next cycle).

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, RollupError>;

#[derive(Error, Debug)]
pub enum RollupError {
    // Configuration errors: fail at task start
    #[error("Invalid task for {resource_id}: {reason}")]
    InvalidTask { resource_id: String, reason: String },

    #[error("Resource not found: {resource_id}")]
    ResourceNotFound { resource_id: String },

    #[error("Empty resource selection: {reason}")]
    EmptySelection { reason: String },

    // Collaborator errors
    #[error("Stats adapter {adapter} failed for {resource_id}: {reason}")]
    Adapter {
        adapter: String,
        resource_id: String,
        reason: String,
    },

    #[error("Stats adapter {adapter} ended without a final batch for {resource_id}")]
    IncompleteStream { adapter: String, resource_id: String },

    #[error("Metric cache error: {reason}")]
    Cache { reason: String },

    #[error("Resource query failed: {reason}")]
    Query { reason: String },

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Blob encode/decode error: {reason}")]
    Blob { reason: String },

    // Orchestration errors
    #[error("Task {task} expired after {after_secs}s")]
    Expired { task: String, after_secs: u64 },

    #[error("{failed} of {total} jobs failed in page: {first}")]
    PageFailed {
        failed: usize,
        total: usize,
        first: String,
    },

    #[error("Job for {resource_id} was dropped before reporting completion")]
    JobAbandoned { resource_id: String },

    // Data-shape errors
    #[error("Malformed metric key: {key}")]
    MalformedKey { key: String },
}

impl RollupError {
    /// Configuration errors are permanent for the given task input.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RollupError::InvalidTask { .. }
                | RollupError::ResourceNotFound { .. }
                | RollupError::EmptySelection { .. }
        )
    }

    pub fn invalid_task(resource_id: impl Into<String>, reason: impl Into<String>) -> Self {
        RollupError::InvalidTask {
            resource_id: resource_id.into(),
            reason: reason.into(),
        }
    }

    pub fn cache(reason: impl std::fmt::Display) -> Self {
        RollupError::Cache {
            reason: reason.to_string(),
        }
    }

    pub fn query(reason: impl std::fmt::Display) -> Self {
        RollupError::Query {
            reason: reason.to_string(),
        }
    }
}
