//! Execution context handed to activities.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::CorrelationId;

use crate::definition::SagaDefinition;
use crate::event::{Fault, SagaMessage, Timeout};
use crate::instance::{SagaData, SagaInstance};
use crate::messaging::{Headers, ResponseAddress};
use crate::state::FINAL;

/// What caused the current behavior to run.
#[derive(Debug)]
pub enum Trigger<'a, M> {
    /// A workflow message, a scheduled message, or a request's response.
    Message(&'a M),

    /// A request's fault.
    Fault(&'a Fault),

    /// A request's deadline passed.
    Expired,

    /// A composite event became ready.
    Composite(&'static str),
}

impl<M> Clone for Trigger<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for Trigger<'_, M> {}

/// An outbound effect held until the instance is persisted.
#[derive(Debug)]
pub(crate) enum Effect<M> {
    Publish(M),
    Send {
        destination: String,
        message: M,
        headers: Headers,
    },
    Respond {
        address: ResponseAddress,
        message: M,
    },
    Schedule {
        delay: Duration,
        timeout: Timeout<M>,
    },
}

/// Effects buffered during one evaluation, in the order they were produced.
#[derive(Debug)]
pub(crate) struct Outbox<M> {
    effects: Vec<Effect<M>>,
}

impl<M> Outbox<M> {
    pub(crate) fn new() -> Self {
        Self {
            effects: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, effect: Effect<M>) {
        self.effects.push(effect);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub(crate) fn into_effects(self) -> Vec<Effect<M>> {
        self.effects
    }
}

/// The instance and event an activity operates on.
///
/// Activities read the triggering message, mutate instance data and queue
/// outbound effects. Nothing leaves the engine until the instance has been
/// stored, so an activity that fails leaves no trace.
pub struct BehaviorContext<'a, D, M> {
    pub(crate) definition: &'a SagaDefinition<D, M>,
    pub(crate) instance: &'a mut SagaInstance<D>,
    trigger: Trigger<'a, M>,
    response_address: Option<&'a ResponseAddress>,
    now: DateTime<Utc>,
    pub(crate) outbox: Outbox<M>,
}

impl<'a, D: SagaData, M: SagaMessage> BehaviorContext<'a, D, M> {
    pub(crate) fn new(
        definition: &'a SagaDefinition<D, M>,
        instance: &'a mut SagaInstance<D>,
        trigger: Trigger<'a, M>,
        response_address: Option<&'a ResponseAddress>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            definition,
            instance,
            trigger,
            response_address,
            now,
            outbox: Outbox::new(),
        }
    }

    /// Returns the message being handled, if the trigger carries one.
    pub fn message(&self) -> Option<&'a M> {
        match self.trigger {
            Trigger::Message(message) => Some(message),
            _ => None,
        }
    }

    /// Returns the request fault being handled, if any.
    pub fn fault(&self) -> Option<&'a Fault> {
        match self.trigger {
            Trigger::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn trigger(&self) -> Trigger<'a, M> {
        self.trigger
    }

    pub(crate) fn set_trigger(&mut self, trigger: Trigger<'a, M>) {
        self.trigger = trigger;
    }

    pub fn instance(&self) -> &SagaInstance<D> {
        self.instance
    }

    pub fn data(&self) -> &D {
        self.instance.data()
    }

    pub fn data_mut(&mut self) -> &mut D {
        self.instance.data_mut()
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.instance.correlation_id()
    }

    pub fn state(&self) -> &str {
        self.instance.state()
    }

    pub fn saga_type(&self) -> &'static str {
        self.definition.name()
    }

    /// Time at which dispatch of the current event started.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Returns the requester's address, if the inbound message has one.
    pub fn response_address(&self) -> Option<&'a ResponseAddress> {
        self.response_address
    }

    /// Queues a message for publication.
    pub fn publish(&mut self, message: M) {
        self.outbox.push(Effect::Publish(message));
    }

    /// Queues a message for one destination.
    pub fn send(&mut self, destination: impl Into<String>, message: M) {
        let headers = self.headers(None);
        self.outbox.push(Effect::Send {
            destination: destination.into(),
            message,
            headers,
        });
    }

    /// Queues a response to the requester of the current message.
    ///
    /// Does nothing if the message carries no response address.
    pub fn respond(&mut self, message: M) {
        match self.response_address {
            Some(address) => self.outbox.push(Effect::Respond {
                address: address.clone(),
                message,
            }),
            None => tracing::warn!(
                saga_type = self.saga_type(),
                correlation_id = %self.correlation_id(),
                message_type = message.message_type(),
                "response dropped, no response address"
            ),
        }
    }

    pub(crate) fn headers(&self, request: Option<(&str, common::RequestId)>) -> Headers {
        Headers {
            saga_type: self.saga_type().to_string(),
            correlation_id: self.correlation_id(),
            request: request.map(|(name, _)| name.to_string()),
            request_id: request.map(|(_, id)| id),
        }
    }

    pub(crate) fn into_outbox(self) -> Outbox<M> {
        self.outbox
    }

    /// Moves the instance to a declared state.
    pub(crate) fn transition_to(&mut self, state: &'static str) {
        tracing::debug!(
            saga_type = self.saga_type(),
            from = self.instance.state(),
            to = state,
            "transition"
        );
        self.instance.set_state(state);
    }

    /// Moves the instance to `Final`.
    pub(crate) fn finalize(&mut self) {
        self.transition_to(FINAL);
    }
}
