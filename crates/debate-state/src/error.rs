//! Error types for debate-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the store traits.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// The addressed record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness or compare-and-set check failed.
    #[error("{entity} conflict on {key}: {detail}")]
    Conflict {
        entity: &'static str,
        key: String,
        detail: String,
    },

    /// The record exists but is not in a state that permits the write.
    #[error("{entity} {id} is {status}, expected {expected}")]
    InvalidState {
        entity: &'static str,
        id: String,
        status: String,
        expected: String,
    },

    /// Digest string is not 64 lowercase hex characters.
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// The backend could not be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("storage serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Backend(_))
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StorageError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn conflict(
        entity: &'static str,
        key: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        StorageError::Conflict {
            entity,
            key: key.into(),
            detail: detail.into(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors returned by [`crate::queue::JobQueue`] implementations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    /// The stream has reached its configured depth.
    #[error("stream {stream} is full ({depth} pending entries)")]
    QueueFull { stream: String, depth: usize },

    /// Ack or claim referenced a message the group does not have pending.
    #[error("message {message_id} is not pending in {stream}/{group}")]
    UnknownMessage {
        stream: String,
        group: String,
        message_id: String,
    },

    /// Transport failure.
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Backend(_))
    }
}
