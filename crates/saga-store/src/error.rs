use thiserror::Error;

use crate::{CorrelationId, Version};

/// Errors that can occur when interacting with a saga repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The stored version did not match the version the caller loaded.
    #[error(
        "Concurrency conflict for saga {correlation_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        correlation_id: CorrelationId,
        expected: Version,
        actual: Version,
    },

    /// An instance with the same correlation id or natural key already exists.
    #[error("Duplicate saga instance {correlation_id} (key: {key})")]
    DuplicateKey {
        correlation_id: CorrelationId,
        key: String,
    },

    /// The instance does not exist.
    #[error("Saga instance not found: {0}")]
    NotFound(CorrelationId),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RepositoryError {
    /// Returns true for errors a caller should answer by reloading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RepositoryError::ConcurrencyConflict { .. } | RepositoryError::DuplicateKey { .. }
        )
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;
