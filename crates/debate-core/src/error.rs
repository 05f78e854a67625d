//! Error taxonomy for the debate engine.

use debate_state::{QueueError, StorageError, TaskStatus};

/// Errors produced by the coordinator, dispatcher and their collaborators.
///
/// Agent failures never appear here: they are absorbed into the agent run's
/// terminal status and surface to callers through the task's status and
/// `pending_escalation` flag.
#[derive(Debug, thiserror::Error)]
pub enum DebateError {
    /// A status change the lifecycle graph does not allow.
    #[error("task {task_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The call is valid in general but not for the task's current state.
    #[error("task {task_id} ({status}): {detail}")]
    Precondition {
        task_id: String,
        status: TaskStatus,
        detail: String,
    },

    #[error("task {task_id} round {round_number}: {detail}")]
    InvalidRound {
        task_id: String,
        round_number: u32,
        detail: String,
    },

    #[error("task {task_id} is owned by another coordinator")]
    LeaseHeld { task_id: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("job stream is full: {0}")]
    Backpressure(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("queue error: {0}")]
    Queue(QueueError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("triage error: {0}")]
    Triage(String),
}

impl From<QueueError> for DebateError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::QueueFull { .. } => DebateError::Backpressure(err.to_string()),
            other => DebateError::Queue(other),
        }
    }
}

impl DebateError {
    /// Store or queue connectivity failures; the only class fatal to a
    /// coordinator once retries are spent.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            DebateError::Storage(e) => e.is_transient(),
            DebateError::Queue(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, DebateError>;
