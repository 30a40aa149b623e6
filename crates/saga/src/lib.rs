//! Saga orchestration engine.
//!
//! A saga is a long-running workflow driven by messages. Each workflow is a
//! [`SagaDefinition`]: a table of states, the events that move instances
//! between them, and the activities bound to each transition. A
//! [`SagaEngine`] runs one definition:
//!
//! 1. Correlate the inbound envelope to an instance (by id or predicate)
//! 2. Load it, or create it if an `Initially` rule handles the event
//! 3. Run the activities of every rule that applies in the current state
//! 4. Store the instance with an optimistic version check, retrying the
//!    whole cycle on conflict
//! 5. Publish, send, respond and arm timers, only after the write succeeded
//!
//! Timers are cancelled by token: every schedule stores a fresh token in a
//! named slot and a timeout is applied only if its token is still current.
//! Requests and composite (join) events build on the same mechanics.

pub mod clock;
pub mod composite;
pub mod config;
pub mod context;
mod correlation;
pub mod definition;
pub mod engine;
pub mod error;
pub mod event;
pub mod instance;
mod lock;
pub mod messaging;
pub mod request;
pub mod scheduler;
pub mod state;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use composite::CompositeSpec;
pub use config::{EngineConfig, FinalizePolicy, LogFormat};
pub use context::{BehaviorContext, Trigger};
pub use definition::{
    Activities, Activity, Behavior, CustomActivity, EventConfig, MissingInstance, NewId,
    SagaDefinition, SagaDefinitionBuilder, Transition,
};
pub use engine::{DispatchOutcome, SagaEngine};
pub use error::{ActivityError, DefinitionError, Result, SagaError, TransportError};
pub use event::{
    Delivery, Envelope, EventKey, Fault, Outcome, Response, SagaMessage, Timeout, TimeoutPayload,
};
pub use instance::{PendingRequest, SagaData, SagaInstance};
pub use messaging::{Headers, InMemoryBus, MessageBus, ResponseAddress, SentMessage};
pub use request::RequestSpec;
pub use scheduler::{ManualTimer, TimerService, TokioTimer};
pub use state::{FINAL, INITIAL};

pub use common::{CorrelationId, MessageId, RequestId, ScheduleToken};
pub use saga_store::{InMemorySagaRepository, PostgresSagaRepository, SagaRepository, Version};

/// Everything needed to write a workflow definition.
pub mod prelude {
    pub use crate::{
        Activities, ActivityError, BehaviorContext, CompositeSpec, CorrelationId, CustomActivity,
        EventKey, FINAL, INITIAL, NewId, RequestSpec, SagaDefinition, SagaMessage,
    };
}
