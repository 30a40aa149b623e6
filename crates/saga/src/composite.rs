//! Composite (join) events.
//!
//! A composite fires once every prerequisite event has been observed by an
//! instance, in any order. Progress is a bitmask stored with the instance,
//! one bit per prerequisite, so the join survives restarts.

use crate::error::DefinitionError;
use crate::event::EventKey;
use crate::instance::SagaInstance;
use crate::state::INITIAL;

/// Most prerequisites a composite can have.
pub const MAX_PREREQUISITES: usize = 32;

/// Declaration of a composite event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeSpec {
    name: &'static str,
    prerequisites: Vec<EventKey>,
    include_initial: bool,
}

impl CompositeSpec {
    /// Declares a composite raised after all `prerequisites` were observed.
    pub fn new<I, K>(name: &'static str, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<EventKey>,
    {
        Self {
            name,
            prerequisites: prerequisites.into_iter().map(Into::into).collect(),
            include_initial: false,
        }
    }

    /// Counts prerequisites observed while the instance is still `Initial`,
    /// i.e. by the event that creates it.
    pub fn include_initial(mut self) -> Self {
        self.include_initial = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The key under which transitions for this composite are declared.
    pub fn key(&self) -> EventKey {
        EventKey::Composite(self.name)
    }

    pub fn prerequisites(&self) -> &[EventKey] {
        &self.prerequisites
    }

    /// Bitmask with one bit set per prerequisite.
    pub fn full_mask(&self) -> u32 {
        match self.prerequisites.len() {
            MAX_PREREQUISITES => u32::MAX,
            n => (1u32 << n) - 1,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), DefinitionError> {
        match self.prerequisites.len() {
            0 => Err(DefinitionError::EmptyComposite(self.name)),
            n if n > MAX_PREREQUISITES => Err(DefinitionError::TooManyPrerequisites {
                name: self.name,
                count: n,
            }),
            _ => Ok(()),
        }
    }

    fn bit(&self, key: EventKey) -> Option<u32> {
        self.prerequisites
            .iter()
            .position(|k| *k == key)
            .map(|i| 1u32 << i)
    }
}

/// Result of recording one event against the composites of an instance.
#[derive(Debug, Default)]
pub(crate) struct Progress<'c> {
    /// Some mask gained a bit.
    pub changed: bool,
    /// Composites that became complete; each is reported at most once over
    /// the life of an instance.
    pub completed: Vec<&'c CompositeSpec>,
}

/// Records `key` against every composite that lists it.
///
/// `start_state` is the state the instance was in when the event arrived.
pub(crate) fn track<'c, D>(
    composites: &'c [CompositeSpec],
    key: EventKey,
    start_state: &str,
    instance: &mut SagaInstance<D>,
) -> Progress<'c> {
    let mut progress = Progress::default();

    for composite in composites {
        let Some(bit) = composite.bit(key) else {
            continue;
        };
        if start_state == INITIAL && !composite.include_initial {
            continue;
        }

        let full = composite.full_mask();
        let mask = instance.composite_mask(composite.name);
        if mask == full || mask & bit != 0 {
            continue;
        }

        let mask = mask | bit;
        instance.set_composite_mask(composite.name, mask);
        progress.changed = true;
        tracing::debug!(composite = composite.name, mask, "composite prerequisite observed");

        if mask == full {
            progress.completed.push(composite);
        }
    }

    progress
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use common::CorrelationId;

    use super::*;

    fn ready() -> CompositeSpec {
        CompositeSpec::new("ReadyToThank", ["BookReserved", "BookCheckedOut"])
    }

    fn instance() -> SagaInstance<()> {
        SagaInstance::new(CorrelationId::new(), Utc::now())
    }

    #[test]
    fn full_mask_covers_every_prerequisite() {
        assert_eq!(ready().full_mask(), 0b11);
        let wide = CompositeSpec::new("Wide", (0..32).map(|_| "X"));
        assert_eq!(wide.full_mask(), u32::MAX);
    }

    #[test]
    fn validation() {
        let empty = CompositeSpec::new("Empty", Vec::<EventKey>::new());
        assert_eq!(empty.validate(), Err(DefinitionError::EmptyComposite("Empty")));

        let wide = CompositeSpec::new("Wide", (0..33).map(|_| "X"));
        assert!(matches!(
            wide.validate(),
            Err(DefinitionError::TooManyPrerequisites { count: 33, .. })
        ));
    }

    #[test]
    fn fires_once_regardless_of_order() {
        let composites = vec![ready()];
        let mut saga = instance();

        let first = track(&composites, "BookCheckedOut".into(), "Active", &mut saga);
        assert!(first.changed);
        assert!(first.completed.is_empty());
        assert_eq!(saga.composite_mask("ReadyToThank"), 0b10);

        let second = track(&composites, "BookReserved".into(), "Active", &mut saga);
        assert_eq!(second.completed.len(), 1);

        let again = track(&composites, "BookReserved".into(), "Ready", &mut saga);
        assert!(!again.changed);
        assert!(again.completed.is_empty());
        assert_eq!(saga.composite_mask("ReadyToThank"), 0b11);
    }

    #[test]
    fn redelivery_does_not_change_mask() {
        let composites = vec![ready()];
        let mut saga = instance();
        track(&composites, "BookReserved".into(), "Active", &mut saga);
        let mask = saga.composite_mask("ReadyToThank");
        let progress = track(&composites, "BookReserved".into(), "Active", &mut saga);
        assert!(!progress.changed);
        assert_eq!(saga.composite_mask("ReadyToThank"), mask);
    }

    #[test]
    fn initial_events_count_only_when_included() {
        let mut saga = instance();
        track(&[ready()], "BookReserved".into(), INITIAL, &mut saga);
        assert_eq!(saga.composite_mask("ReadyToThank"), 0);

        track(&[ready().include_initial()], "BookReserved".into(), INITIAL, &mut saga);
        assert_eq!(saga.composite_mask("ReadyToThank"), 0b01);
    }
}
