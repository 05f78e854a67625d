//! Storage trait definitions for the debate engine
//!
//! These traits define the persistence seams used by the coordinator and the
//! dispatcher workers:
//! - `TaskStore`: tasks and their lifecycle status (compare-and-set updates)
//! - `RoundStore`: rounds, agent runs, findings and consensus results
//! - `ClaimStore`: execution claims, completion markers and task leases
//! - `ContextStore`: content-addressed round context blobs
//! - `EventStore`: the append-only per-task event log
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module; `surreal_store` is the durable backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;
use crate::records::*;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random identifier.
            pub fn new() -> Self {
                $name(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// Unique identifier for a task
    TaskId
);
record_id!(
    /// Unique identifier for a debate round
    RoundId
);
record_id!(
    /// Unique identifier for one agent run within a round
    AgentRunId
);
record_id!(FindingId);
record_id!(ConsensusId);
record_id!(EventId);

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Task persistence.
///
/// Guarantees:
/// - Slugs are unique across tasks.
/// - `update_task` is a compare-and-set on the stored status: the write is
///   applied only if the stored status equals `expected`, otherwise
///   `StorageError::Conflict` is returned and nothing changes.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task. Fails with `Conflict` if the slug is taken.
    async fn create_task(&self, task: TaskRecord) -> StorageResult<TaskRecord>;

    async fn get_task(&self, id: &TaskId) -> StorageResult<TaskRecord>;

    async fn find_task_by_slug(&self, slug: &str) -> StorageResult<Option<TaskRecord>>;

    /// Replace the stored task if its status is still `expected`.
    async fn update_task(&self, task: &TaskRecord, expected: TaskStatus) -> StorageResult<()>;

    /// All tasks, newest first.
    async fn list_tasks(&self) -> StorageResult<Vec<TaskRecord>>;
}

// ---------------------------------------------------------------------------
// RoundStore
// ---------------------------------------------------------------------------

/// Round, agent run, finding and consensus persistence.
///
/// Guarantees:
/// - `(task_id, round_number)` is unique.
/// - `idempotency_key` is unique across agent runs.
/// - At most one agent run per `(round, role)` is `Running` at a time.
/// - Terminal agent runs are immutable.
/// - `complete_agent_run` writes the terminal run and its findings together,
///   and only from `Running`.
/// - At most one consensus result exists per round.
#[async_trait]
pub trait RoundStore: Send + Sync {
    async fn create_round(&self, round: RoundRecord) -> StorageResult<RoundRecord>;

    async fn get_round(&self, id: &RoundId) -> StorageResult<RoundRecord>;

    async fn find_round(
        &self,
        task_id: &TaskId,
        round_number: u32,
    ) -> StorageResult<Option<RoundRecord>>;

    /// Rounds of a task ordered by round number.
    async fn list_rounds(&self, task_id: &TaskId) -> StorageResult<Vec<RoundRecord>>;

    async fn update_round(&self, round: &RoundRecord) -> StorageResult<()>;

    /// Insert a scheduled agent run. `Conflict` if the idempotency key exists.
    async fn insert_agent_run(&self, run: AgentRunRecord) -> StorageResult<AgentRunRecord>;

    async fn find_agent_run(&self, idempotency_key: &str)
        -> StorageResult<Option<AgentRunRecord>>;

    /// Agent runs of a round ordered by creation time.
    async fn list_agent_runs(&self, round_id: &RoundId) -> StorageResult<Vec<AgentRunRecord>>;

    /// Replace a non-terminal agent run.
    async fn update_agent_run(&self, run: &AgentRunRecord) -> StorageResult<()>;

    /// Move a `Running` agent run to its terminal state and attach findings.
    async fn complete_agent_run(
        &self,
        run: &AgentRunRecord,
        findings: Vec<FindingRecord>,
    ) -> StorageResult<()>;

    async fn list_findings(&self, run_id: &AgentRunId) -> StorageResult<Vec<FindingRecord>>;

    /// Persist the round's consensus result. `Conflict` if one exists.
    async fn insert_consensus(&self, result: ConsensusRecord) -> StorageResult<ConsensusRecord>;

    async fn get_consensus(&self, round_id: &RoundId) -> StorageResult<Option<ConsensusRecord>>;
}

// ---------------------------------------------------------------------------
// ClaimStore
// ---------------------------------------------------------------------------

/// Execution claims, completion markers and task leases.
///
/// Guarantees:
/// - A claim for a `lock_key` is granted only when no unexpired claim by a
///   different owner exists; the check and the write are one atomic step.
/// - Completion markers are write-once.
/// - Releasing a claim or lease held by another owner is a no-op.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Try to take (or renew) the claim. Returns `false` if held elsewhere.
    async fn try_claim(&self, claim: ClaimRecord, now: DateTime<Utc>) -> StorageResult<bool>;

    async fn release_claim(&self, lock_key: &str, owner: &str) -> StorageResult<()>;

    async fn get_claim(&self, lock_key: &str) -> StorageResult<Option<ClaimRecord>>;

    /// Record a completion. Returns `false` if a marker already exists.
    async fn put_completion_marker(&self, marker: CompletionMarker) -> StorageResult<bool>;

    async fn get_completion_marker(
        &self,
        idempotency_key: &str,
    ) -> StorageResult<Option<CompletionMarker>>;

    /// Try to take (or renew) the coordinator lease on a task.
    async fn try_acquire_lease(&self, lease: TaskLease, now: DateTime<Utc>) -> StorageResult<bool>;

    async fn release_lease(&self, task_id: &TaskId, owner: &str) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// ContextStore
// ---------------------------------------------------------------------------

/// Content-addressed store for round context payloads.
///
/// Guarantees:
/// - `put(data)` always returns the SHA-256 digest of `data`.
/// - `get(digest)` returns the exact bytes previously stored.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn put_context(&self, data: &[u8]) -> StorageResult<ContentDigest>;

    /// Retrieve bytes by digest. Returns `StorageError::NotFound` if absent.
    async fn get_context(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

/// Append-only audit trail per task.
///
/// Guarantees:
/// - Events are never updated or deleted.
/// - `list_events` returns a task's events in the order they were logged.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn log_event(&self, event: EventRecord) -> StorageResult<()>;

    async fn list_events(&self, task_id: &TaskId) -> StorageResult<Vec<EventRecord>>;
}

/// Everything the engine needs from persistence.
pub trait DebateStore: TaskStore + RoundStore + ClaimStore + ContextStore + EventStore {}

impl<T> DebateStore for T where
    T: TaskStore + RoundStore + ClaimStore + ContextStore + EventStore
{
}
