//! Persistence contract for saga instances.
//!
//! The engine only needs load/insert/save/delete with optimistic
//! concurrency; this crate defines that contract and ships two
//! implementations: an in-memory store for tests and single-process use,
//! and a PostgreSQL store using a version column for multi-process
//! deployments.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;
pub mod version;

pub use common::CorrelationId;
pub use error::{RepositoryError, Result};
pub use memory::InMemorySagaRepository;
pub use postgres::PostgresSagaRepository;
pub use record::SagaRecord;
pub use store::SagaRepository;
pub use version::Version;
