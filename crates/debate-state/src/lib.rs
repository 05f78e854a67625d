//! Debate-State: persistence for the debate coordination engine
//!
//! This crate owns every durable fact the engine relies on: tasks and their
//! lifecycle status, rounds, agent runs with their findings, consensus
//! results, execution claims, completion markers and task leases. It also
//! defines the job stream the coordinator and dispatcher workers talk over.
//!
//! ## Key Components
//!
//! - `storage_traits`: `TaskStore`, `RoundStore`, `ClaimStore`, `ContextStore`,
//!   `EventStore`
//! - `queue`: `JobQueue` consumer-group stream and `JobEnvelope`
//! - `fakes`: in-memory implementations for tests and ephemeral runs
//! - `SurrealDebateStore`: durable SurrealDB backend

mod error;
pub mod fakes;
pub mod handle;
pub mod migrations;
pub mod queue;
pub mod records;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{QueueError, StateError, StorageError};
pub use fakes::{MemoryDebateStore, MemoryJobQueue};
pub use handle::CloudConfig;
pub use queue::{
    Delivery, JobEnvelope, JobQueue, QueueResult, ANALYSIS_STREAM, DEAD_LETTER_STREAM,
    WORKER_GROUP,
};
pub use records::*;
pub use storage_traits::{
    AgentRunId, ClaimStore, ConsensusId, ContentDigest, ContextStore, DebateStore, EventId,
    EventStore, FindingId, RoundId, RoundStore, StorageResult, TaskId, TaskStore,
};
pub use surreal_store::SurrealDebateStore;

/// Result type for connection and schema setup
pub type Result<T> = std::result::Result<T, StateError>;
