//! Identifier newtypes shared by the saga store, the engine and workflows.

mod types;

pub use types::{CorrelationId, MessageId, RequestId, ScheduleToken};
