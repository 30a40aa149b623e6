//! Correlation of inbound envelopes to instances.

use common::CorrelationId;
use saga_store::SagaRepository;

use crate::definition::{Correlation, NewId, SagaDefinition};
use crate::error::Result;
use crate::event::{Envelope, EventKey, SagaMessage};
use crate::instance::{SagaData, SagaInstance};

/// Where an envelope should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// The instance with this id; `may_create` if the event may create it.
    Found {
        correlation_id: CorrelationId,
        may_create: bool,
    },

    /// The event is declared but no instance matches and none may be created.
    Missing,

    /// The envelope does not belong to this definition.
    Unroutable,
}

/// Resolves the instance an envelope refers to.
///
/// Predicate correlation reads every instance of the saga type, so the
/// result may be outdated by the time the caller takes the instance lock;
/// the caller reloads by id and treats a vanished instance as missing.
pub(crate) async fn resolve<D, M, R>(
    definition: &SagaDefinition<D, M>,
    repository: &R,
    envelope: &Envelope<M>,
) -> Result<Resolution>
where
    D: SagaData,
    M: SagaMessage,
    R: SagaRepository,
{
    let delivery = match envelope {
        Envelope::Message(delivery) => delivery,
        Envelope::Timeout(timeout) => {
            return Ok(by_id(definition, &timeout.saga_type, timeout.correlation_id));
        }
        Envelope::Response(response) => {
            return Ok(by_id(
                definition,
                &response.saga_type,
                response.correlation_id,
            ));
        }
    };

    let message = &delivery.message;
    let message_type = message.message_type();
    let Some(event) = definition.event(message_type) else {
        return Ok(Resolution::Unroutable);
    };
    let may_create = event.inserts_on_initial()
        && !event.is_read_only()
        && definition.creates_on(EventKey::Message(message_type));

    match &event.correlation {
        Correlation::Unset => Ok(Resolution::Unroutable),
        Correlation::ById(id) => match id(message) {
            Some(correlation_id) => Ok(Resolution::Found {
                correlation_id,
                may_create,
            }),
            None => {
                tracing::warn!(
                    saga_type = definition.name(),
                    message_type,
                    "message carries no correlation id"
                );
                Ok(Resolution::Unroutable)
            }
        },
        Correlation::ByPredicate { matches, new_id } => {
            let mut found = Vec::new();
            for record in repository.list(definition.name()).await? {
                if definition.is_final(&record.state) {
                    continue;
                }
                let instance = SagaInstance::<D>::from_record(record)?;
                if matches(instance.data(), message) {
                    found.push(instance.correlation_id());
                }
            }

            if found.len() > 1 {
                tracing::warn!(
                    saga_type = definition.name(),
                    message_type,
                    matches = found.len(),
                    "ambiguous correlation, using the oldest match"
                );
            }

            match found.first() {
                Some(&correlation_id) => Ok(Resolution::Found {
                    correlation_id,
                    may_create,
                }),
                None if may_create => Ok(Resolution::Found {
                    correlation_id: match new_id {
                        NewId::MessageId => CorrelationId::from(delivery.message_id.as_uuid()),
                        NewId::Fresh => CorrelationId::new(),
                    },
                    may_create,
                }),
                None => Ok(Resolution::Missing),
            }
        }
    }
}

fn by_id<D, M>(
    definition: &SagaDefinition<D, M>,
    saga_type: &str,
    correlation_id: CorrelationId,
) -> Resolution
where
    D: SagaData,
    M: SagaMessage,
{
    if saga_type == definition.name() {
        Resolution::Found {
            correlation_id,
            may_create: false,
        }
    } else {
        Resolution::Unroutable
    }
}
