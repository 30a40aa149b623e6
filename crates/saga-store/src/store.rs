use async_trait::async_trait;

use crate::{CorrelationId, Result, SagaRecord, Version};

/// Storage contract for saga instances.
///
/// All implementations must be thread-safe (Send + Sync). Instances are
/// keyed by `(saga_type, correlation_id)`; a record's `unique_key`, when
/// set, must also be unique within its saga type.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Loads an instance.
    ///
    /// Returns None if no instance exists for the id.
    async fn load(
        &self,
        saga_type: &str,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaRecord>>;

    /// Stores a new instance.
    ///
    /// Fails with `DuplicateKey` if the correlation id or the natural key is
    /// already taken. Returns the stored version (`Version::first()`).
    async fn insert(&self, record: SagaRecord) -> Result<Version>;

    /// Replaces an existing instance if its stored version equals `expected`.
    ///
    /// Fails with `ConcurrencyConflict` on a version mismatch and `NotFound`
    /// if the instance has been removed. Returns the new version.
    async fn save(&self, record: SagaRecord, expected: Version) -> Result<Version>;

    /// Removes an instance if its stored version equals `expected`.
    ///
    /// Removing an instance that no longer exists is not an error.
    async fn delete(
        &self,
        saga_type: &str,
        correlation_id: CorrelationId,
        expected: Version,
    ) -> Result<()>;

    /// Returns every instance of a saga type, oldest first.
    ///
    /// Used for predicate correlation, where the engine evaluates a
    /// predicate against each candidate.
    async fn list(&self, saga_type: &str) -> Result<Vec<SagaRecord>>;
}
