use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationId, Version};

/// Persisted form of one saga instance.
///
/// The engine serializes everything beyond the columns the store needs to
/// index (type, id, natural key, state, version) into `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    /// The saga type (definition name), e.g. "Reservation".
    pub saga_type: String,

    /// The correlation id, unique per saga type.
    pub correlation_id: CorrelationId,

    /// Optional natural key, unique per saga type when present.
    pub unique_key: Option<String>,

    /// Name of the current state.
    pub state: String,

    /// Concurrency token; `Version::initial()` for a record never stored.
    pub version: Version,

    /// Serialized instance body (domain data, slots, pending requests).
    pub payload: serde_json::Value,

    /// When the instance was first stored.
    pub created_at: DateTime<Utc>,

    /// When the instance was last stored.
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    /// Creates a record that has not been stored yet.
    pub fn new(
        saga_type: impl Into<String>,
        correlation_id: CorrelationId,
        state: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            saga_type: saga_type.into(),
            correlation_id,
            unique_key: None,
            state: state.into(),
            version: Version::initial(),
            payload,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the natural key used for duplicate detection.
    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    /// Returns true if this record has never been stored.
    pub fn is_new(&self) -> bool {
        self.version == Version::initial()
    }
}
