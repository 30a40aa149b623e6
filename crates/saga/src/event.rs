//! Inbound event shapes and transition-table keys.

use common::{CorrelationId, MessageId, RequestId, ScheduleToken};
use serde::{Deserialize, Serialize};

use crate::messaging::ResponseAddress;

/// Trait for the message type a workflow exchanges with the transport.
///
/// Workflows usually define one enum covering every contract they publish
/// or consume; `message_type` names the variant.
pub trait SagaMessage: std::fmt::Debug + Clone + Send + Sync + 'static {
    /// Returns the message type name used as the transition-table key.
    fn message_type(&self) -> &'static str;
}

/// Key under which transitions are declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// A workflow message of the named type (including scheduled messages).
    Message(&'static str),

    /// The named request received its response.
    Completed(&'static str),

    /// The named request faulted.
    Faulted(&'static str),

    /// The named request did not resolve before its deadline.
    TimeoutExpired(&'static str),

    /// The named composite event became ready.
    Composite(&'static str),
}

impl EventKey {
    /// Key for a workflow message type.
    pub fn message(message_type: &'static str) -> Self {
        EventKey::Message(message_type)
    }
}

impl From<&'static str> for EventKey {
    fn from(message_type: &'static str) -> Self {
        EventKey::Message(message_type)
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKey::Message(name) => write!(f, "{name}"),
            EventKey::Completed(name) => write!(f, "{name}.Completed"),
            EventKey::Faulted(name) => write!(f, "{name}.Faulted"),
            EventKey::TimeoutExpired(name) => write!(f, "{name}.TimeoutExpired"),
            EventKey::Composite(name) => write!(f, "{name}"),
        }
    }
}

/// A message delivered by the transport, with the headers the engine uses.
#[derive(Debug, Clone)]
pub struct Delivery<M> {
    /// Transport message id; used as the new correlation id by
    /// predicate-correlated events that create instances.
    pub message_id: MessageId,

    /// The message itself.
    pub message: M,

    /// Where to send responses, if the sender expects one.
    pub response_address: Option<ResponseAddress>,
}

impl<M> Delivery<M> {
    /// Wraps a message with a fresh message id and no response address.
    pub fn new(message: M) -> Self {
        Self {
            message_id: MessageId::new(),
            message,
            response_address: None,
        }
    }

    /// Sets the response address.
    pub fn with_response_address(mut self, address: ResponseAddress) -> Self {
        self.response_address = Some(address);
        self
    }

    /// Sets the message id.
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }
}

/// A timer delivery produced by the scheduler.
#[derive(Debug, Clone)]
pub struct Timeout<M> {
    pub saga_type: String,
    pub correlation_id: CorrelationId,
    pub slot: String,
    pub token: ScheduleToken,
    pub payload: TimeoutPayload<M>,
}

/// What a timer delivers once its token is confirmed current.
#[derive(Debug, Clone)]
pub enum TimeoutPayload<M> {
    /// A workflow message scheduled by an activity.
    Message(M),

    /// The deadline of an outstanding request.
    RequestExpired {
        request: String,
        request_id: RequestId,
    },
}

/// Outcome of an outstanding request, routed back to the instance.
#[derive(Debug, Clone)]
pub struct Response<M> {
    pub saga_type: String,
    pub correlation_id: CorrelationId,
    pub request: String,
    pub request_id: RequestId,
    pub outcome: Outcome<M>,
}

/// Result reported by the service that handled a request.
#[derive(Debug, Clone)]
pub enum Outcome<M> {
    Completed(M),
    Faulted(Fault),
}

/// Description of a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub reason: String,
}

impl Fault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Everything the dispatcher can be asked to handle.
#[derive(Debug, Clone)]
pub enum Envelope<M> {
    /// A workflow message published or sent by another participant.
    Message(Delivery<M>),

    /// A scheduled timer firing.
    Timeout(Timeout<M>),

    /// A response, fault, or explicit reply for an outstanding request.
    Response(Response<M>),
}

impl<M: SagaMessage> Envelope<M> {
    /// Wraps a bare message in a delivery with a fresh message id.
    pub fn message(message: M) -> Self {
        Envelope::Message(Delivery::new(message))
    }

    /// Short name used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Message(_) => "message",
            Envelope::Timeout(_) => "timeout",
            Envelope::Response(_) => "response",
        }
    }

    /// Human-readable description of the carried event.
    pub fn describe(&self) -> String {
        match self {
            Envelope::Message(d) => d.message.message_type().to_string(),
            Envelope::Timeout(t) => match &t.payload {
                TimeoutPayload::Message(m) => m.message_type().to_string(),
                TimeoutPayload::RequestExpired { request, .. } => {
                    format!("{request}.TimeoutExpired")
                }
            },
            Envelope::Response(r) => match &r.outcome {
                Outcome::Completed(_) => format!("{}.Completed", r.request),
                Outcome::Faulted(_) => format!("{}.Faulted", r.request),
            },
        }
    }
}
