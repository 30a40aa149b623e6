//! Message substrate port and an in-memory implementation.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::{CorrelationId, RequestId};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::event::SagaMessage;

/// Where a response to an inbound message should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseAddress {
    /// Transport address of the requester.
    pub address: String,

    /// Request id the requester will match the response against.
    pub request_id: Option<RequestId>,
}

impl ResponseAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            request_id: Some(RequestId::new()),
        }
    }
}

/// Headers attached to messages the engine sends.
///
/// A service answering a request echoes these back in a
/// [`Response`](crate::event::Response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    pub saga_type: String,
    pub correlation_id: CorrelationId,
    pub request: Option<String>,
    pub request_id: Option<RequestId>,
}

/// Outbound operations the engine needs from the transport.
///
/// All operations are fire-and-forget: success means the transport
/// accepted the message, not that anyone consumed it.
#[async_trait]
pub trait MessageBus<M: SagaMessage>: Send + Sync {
    /// Publishes a message to every subscriber.
    async fn publish(&self, message: M) -> Result<(), TransportError>;

    /// Sends a message to one destination.
    async fn send(
        &self,
        destination: &str,
        message: M,
        headers: Headers,
    ) -> Result<(), TransportError>;

    /// Responds to the requester of an inbound message.
    async fn respond(&self, address: &ResponseAddress, message: M) -> Result<(), TransportError>;
}

/// A message captured by [`InMemoryBus::send`].
#[derive(Debug, Clone)]
pub struct SentMessage<M> {
    pub destination: String,
    pub message: M,
    pub headers: Headers,
}

#[derive(Debug)]
struct InMemoryBusState<M> {
    published: Vec<M>,
    sent: Vec<SentMessage<M>>,
    responses: Vec<(ResponseAddress, M)>,
    fail_on_publish: bool,
}

impl<M> Default for InMemoryBusState<M> {
    fn default() -> Self {
        Self {
            published: Vec::new(),
            sent: Vec::new(),
            responses: Vec::new(),
            fail_on_publish: false,
        }
    }
}

/// In-memory message bus for testing.
///
/// Records every outbound message; tests drain the records and feed them
/// back into engines to simulate routing.
#[derive(Debug)]
pub struct InMemoryBus<M> {
    state: Arc<RwLock<InMemoryBusState<M>>>,
}

impl<M> Clone for InMemoryBus<M> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<M> Default for InMemoryBus<M> {
    fn default() -> Self {
        Self {
            state: Arc::new(RwLock::new(InMemoryBusState::default())),
        }
    }
}

impl<M: Clone> InMemoryBus<M> {
    /// Creates a new in-memory bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures publish calls to fail.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.state.write().unwrap().fail_on_publish = fail;
    }

    /// Returns every published message without draining.
    pub fn published(&self) -> Vec<M> {
        self.state.read().unwrap().published.clone()
    }

    /// Drains the published messages.
    pub fn take_published(&self) -> Vec<M> {
        std::mem::take(&mut self.state.write().unwrap().published)
    }

    /// Returns every sent message without draining.
    pub fn sent(&self) -> Vec<SentMessage<M>> {
        self.state.read().unwrap().sent.clone()
    }

    /// Drains the sent messages.
    pub fn take_sent(&self) -> Vec<SentMessage<M>> {
        std::mem::take(&mut self.state.write().unwrap().sent)
    }

    /// Returns every response without draining.
    pub fn responses(&self) -> Vec<(ResponseAddress, M)> {
        self.state.read().unwrap().responses.clone()
    }

    /// Returns the responses sent to one requester.
    pub fn responses_to(&self, address: &ResponseAddress) -> Vec<M> {
        self.state
            .read()
            .unwrap()
            .responses
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl<M: SagaMessage> MessageBus<M> for InMemoryBus<M> {
    async fn publish(&self, message: M) -> Result<(), TransportError> {
        let mut state = self.state.write().unwrap();
        if state.fail_on_publish {
            return Err(TransportError::Publish(format!(
                "bus rejected {}",
                message.message_type()
            )));
        }
        state.published.push(message);
        Ok(())
    }

    async fn send(
        &self,
        destination: &str,
        message: M,
        headers: Headers,
    ) -> Result<(), TransportError> {
        self.state.write().unwrap().sent.push(SentMessage {
            destination: destination.to_string(),
            message,
            headers,
        });
        Ok(())
    }

    async fn respond(&self, address: &ResponseAddress, message: M) -> Result<(), TransportError> {
        self.state
            .write()
            .unwrap()
            .responses
            .push((address.clone(), message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Note(&'static str);

    impl SagaMessage for Note {
        fn message_type(&self) -> &'static str {
            "Note"
        }
    }

    #[tokio::test]
    async fn records_and_drains_published() {
        let bus = InMemoryBus::new();
        bus.publish(Note("a")).await.unwrap();
        bus.publish(Note("b")).await.unwrap();

        assert_eq!(bus.published().len(), 2);
        assert_eq!(bus.take_published(), vec![Note("a"), Note("b")]);
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failure() {
        let bus = InMemoryBus::new();
        bus.set_fail_on_publish(true);
        let err = bus.publish(Note("a")).await.unwrap_err();
        assert!(matches!(err, TransportError::Publish(_)));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn responses_are_grouped_by_address() {
        let bus = InMemoryBus::new();
        let alice = ResponseAddress::new("client-a");
        let bob = ResponseAddress::new("client-b");

        bus.respond(&alice, Note("hi")).await.unwrap();
        bus.respond(&bob, Note("yo")).await.unwrap();

        assert_eq!(bus.responses_to(&alice), vec![Note("hi")]);
        assert_eq!(bus.responses().len(), 2);
    }
}
