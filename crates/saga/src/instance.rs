//! Saga instance: state, domain data, timer slots, pending requests.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{CorrelationId, RequestId, ScheduleToken};
use saga_store::{SagaRecord, Version};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::state::INITIAL;

/// Trait for the domain fields a workflow keeps per instance.
pub trait SagaData: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> SagaData for T where T: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// An outbound request waiting for its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub requested_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// One correlated workflow instance.
#[derive(Debug, Clone)]
pub struct SagaInstance<D> {
    correlation_id: CorrelationId,
    state: String,
    version: Version,
    data: D,
    slots: BTreeMap<String, ScheduleToken>,
    pending: BTreeMap<String, PendingRequest>,
    composites: BTreeMap<String, u32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct BodyRef<'a, D> {
    data: &'a D,
    slots: &'a BTreeMap<String, ScheduleToken>,
    pending: &'a BTreeMap<String, PendingRequest>,
    composites: &'a BTreeMap<String, u32>,
}

#[derive(Deserialize)]
struct Body<D> {
    data: D,
    #[serde(default)]
    slots: BTreeMap<String, ScheduleToken>,
    #[serde(default)]
    pending: BTreeMap<String, PendingRequest>,
    #[serde(default)]
    composites: BTreeMap<String, u32>,
}

impl<D: SagaData> SagaInstance<D> {
    /// Creates an instance in the `Initial` state that has never been stored.
    pub fn new(correlation_id: CorrelationId, now: DateTime<Utc>) -> Self {
        Self {
            correlation_id,
            state: INITIAL.to_string(),
            version: Version::initial(),
            data: D::default(),
            slots: BTreeMap::new(),
            pending: BTreeMap::new(),
            composites: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuilds an instance from its stored record.
    pub fn from_record(record: SagaRecord) -> Result<Self, serde_json::Error> {
        let body: Body<D> = serde_json::from_value(record.payload)?;
        Ok(Self {
            correlation_id: record.correlation_id,
            state: record.state,
            version: record.version,
            data: body.data,
            slots: body.slots,
            pending: body.pending,
            composites: body.composites,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    /// Converts the instance to a record for the repository.
    pub fn to_record(
        &self,
        saga_type: &str,
        unique_key: Option<String>,
    ) -> Result<SagaRecord, serde_json::Error> {
        let payload = serde_json::to_value(BodyRef {
            data: &self.data,
            slots: &self.slots,
            pending: &self.pending,
            composites: &self.composites,
        })?;

        Ok(SagaRecord {
            saga_type: saga_type.to_string(),
            correlation_id: self.correlation_id,
            unique_key,
            state: self.state.clone(),
            version: self.version,
            payload,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl<D> SagaInstance<D> {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Returns the current state name.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Returns true if the instance is in the named state.
    pub fn is_in(&self, state: &str) -> bool {
        self.state == state
    }

    /// Returns the stored version; `Version::initial()` if never stored.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns true if the instance has never been stored.
    pub fn is_new(&self) -> bool {
        self.version == Version::initial()
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns the live token of a scheduled slot, if any.
    pub fn slot(&self, slot: &str) -> Option<ScheduleToken> {
        self.slots.get(slot).copied()
    }

    /// Returns the outstanding request with the given name, if any.
    pub fn pending_request(&self, request: &str) -> Option<&PendingRequest> {
        self.pending.get(request)
    }

    /// Returns the composite bitmask for the named composite event.
    pub fn composite_mask(&self, composite: &str) -> u32 {
        self.composites.get(composite).copied().unwrap_or(0)
    }

    pub(crate) fn set_state(&mut self, state: &str) {
        if self.state != state {
            self.state = state.to_string();
        }
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    pub(crate) fn set_slot(&mut self, slot: &str, token: ScheduleToken) -> Option<ScheduleToken> {
        self.slots.insert(slot.to_string(), token)
    }

    pub(crate) fn clear_slot(&mut self, slot: &str) -> Option<ScheduleToken> {
        self.slots.remove(slot)
    }

    pub(crate) fn set_pending(&mut self, request: &str, pending: PendingRequest) {
        self.pending.insert(request.to_string(), pending);
    }

    pub(crate) fn clear_pending(&mut self, request: &str) -> Option<PendingRequest> {
        self.pending.remove(request)
    }

    pub(crate) fn set_composite_mask(&mut self, composite: &str, mask: u32) {
        self.composites.insert(composite.to_string(), mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Book {
        title: String,
    }

    #[test]
    fn new_instance_is_initial_and_unstored() {
        let instance = SagaInstance::<Book>::new(CorrelationId::new(), Utc::now());
        assert_eq!(instance.state(), INITIAL);
        assert!(instance.is_new());
        assert_eq!(instance.composite_mask("Ready"), 0);
    }

    #[test]
    fn record_conversion_keeps_slots_and_requests() {
        let now = Utc::now();
        let mut instance = SagaInstance::<Book>::new(CorrelationId::new(), now);
        instance.data_mut().title = "Neuromancer".into();
        instance.set_state("Reserved");
        let token = ScheduleToken::new();
        instance.set_slot("Expiration", token);
        instance.set_pending(
            "ChargeFine",
            PendingRequest {
                request_id: RequestId::new(),
                requested_at: now,
                deadline: now,
            },
        );
        instance.set_composite_mask("Ready", 0b01);

        let record = instance.to_record("Book", Some("k".into())).unwrap();
        assert_eq!(record.state, "Reserved");
        assert_eq!(record.unique_key.as_deref(), Some("k"));

        let restored = SagaInstance::<Book>::from_record(record).unwrap();
        assert_eq!(restored.data().title, "Neuromancer");
        assert_eq!(restored.slot("Expiration"), Some(token));
        assert!(restored.pending_request("ChargeFine").is_some());
        assert_eq!(restored.composite_mask("Ready"), 0b01);
    }

    #[test]
    fn body_without_engine_fields_still_loads() {
        let record = SagaRecord::new(
            "Book",
            CorrelationId::new(),
            "Available",
            serde_json::json!({"data": {"title": "Dune"}}),
        );
        let instance = SagaInstance::<Book>::from_record(record).unwrap();
        assert_eq!(instance.data().title, "Dune");
        assert!(instance.slot("anything").is_none());
    }
}
