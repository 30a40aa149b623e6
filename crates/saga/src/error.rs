//! Saga engine error types.

use common::CorrelationId;
use saga_store::RepositoryError;
use thiserror::Error;

/// Errors that can occur while dispatching an event.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The repository failed or rejected a write.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// The instance body could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An activity failed; nothing was persisted or emitted.
    #[error("Activity failed in {saga_type} on {event}: {source}")]
    Activity {
        saga_type: &'static str,
        event: String,
        #[source]
        source: ActivityError,
    },

    /// Every attempt to persist lost a concurrency race.
    #[error("Concurrency retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: RepositoryError,
    },

    /// No instance matched and the event's missing-instance policy is Fault.
    #[error("No {saga_type} instance for {event}")]
    MissingInstance {
        saga_type: &'static str,
        event: String,
    },

    /// A stored instance is in a state the definition does not declare.
    #[error("Saga {correlation_id} is in undeclared state '{state}'")]
    InvalidState {
        correlation_id: CorrelationId,
        state: String,
    },

    /// Outbound delivery failed after the instance was persisted.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors raised by activities bound to a transition.
#[derive(Debug, Error)]
pub enum ActivityError {
    /// The activity refused to proceed (e.g. a business rule failed).
    #[error("{0}")]
    Rejected(String),

    /// The activity issued a request the definition does not declare.
    #[error("Undeclared request '{0}'")]
    UndeclaredRequest(String),

    /// Any other failure.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ActivityError {
    /// Creates a rejection with the given reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        ActivityError::Rejected(reason.into())
    }
}

/// Errors reported by the message bus or timer provider.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Send to '{destination}' failed: {reason}")]
    Send { destination: String, reason: String },

    #[error("Respond failed: {0}")]
    Respond(String),

    #[error("Timer scheduling failed: {0}")]
    Timer(String),
}

/// Errors detected while building a saga definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("State '{0}' is declared twice")]
    DuplicateState(&'static str),

    #[error("Event '{0}' is declared twice")]
    DuplicateEvent(&'static str),

    #[error("State '{state}' referenced by {context} is not declared")]
    UnknownState {
        state: &'static str,
        context: String,
    },

    #[error("Event '{0}' has no correlation strategy")]
    Uncorrelated(&'static str),

    #[error("Request '{0}' is used but not declared")]
    UndeclaredRequest(&'static str),

    #[error("Request '{0}' is declared twice")]
    DuplicateRequest(&'static str),

    #[error("Composite '{0}' is declared twice")]
    DuplicateComposite(&'static str),

    #[error("Composite '{0}' has no prerequisites")]
    EmptyComposite(&'static str),

    #[error("Composite '{name}' has {count} prerequisites, at most 32 are supported")]
    TooManyPrerequisites { name: &'static str, count: usize },
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
