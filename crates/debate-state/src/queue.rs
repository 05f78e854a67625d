//! Job stream abstraction used between the coordinator and dispatcher workers.
//!
//! The model is a consumer-group stream: entries are appended, delivered to
//! one consumer of a group, and stay pending until acknowledged. Entries left
//! pending longer than a minimum idle time can be reclaimed by another
//! consumer, which is how a crashed worker's jobs get picked up again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::records::Role;
use crate::storage_traits::{ContentDigest, TaskId};

/// Stream carrying analysis jobs.
pub const ANALYSIS_STREAM: &str = "jobs:analysis";
/// Stream receiving jobs that exhausted their retries or failed permanently.
pub const DEAD_LETTER_STREAM: &str = "jobs:dead_letter";
/// Consumer group shared by all dispatcher workers.
pub const WORKER_GROUP: &str = "debate-workers";

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// One unit of agent work as it travels through the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: String,
    pub task_id: TaskId,
    pub round_number: u32,
    pub role: Role,
    pub model: String,
    /// Dispatch epoch; part of the idempotency key.
    pub attempt: u32,
    pub idempotency_key: String,
    pub context_reference: ContentDigest,
    pub enqueued_at: DateTime<Utc>,
    /// Set on dead-letter entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// An envelope handed to a consumer, with its stream bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: String,
    pub stream: String,
    pub envelope: JobEnvelope,
    /// How many times this entry has been delivered, including this one.
    pub delivery_count: u32,
}

/// Consumer-group job stream.
///
/// Guarantees:
/// - An entry is delivered to at most one consumer at a time.
/// - Unacknowledged entries stay pending and can be reclaimed after
///   `min_idle` by `reclaim_stale`.
/// - `append` fails with `QueueFull` once `len` reaches the stream's depth.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append an entry and return its message id.
    async fn append(&self, stream: &str, envelope: JobEnvelope) -> QueueResult<String>;

    /// Deliver up to `count` never-delivered entries to `consumer`, waiting
    /// up to `block` for new entries if none are available.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>>;

    /// Acknowledge an entry, removing it from the group's pending list.
    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> QueueResult<()>;

    /// Transfer entries pending longer than `min_idle` to `consumer`.
    async fn reclaim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Entries appended and not yet acknowledged.
    async fn len(&self, stream: &str) -> QueueResult<usize>;

    /// Snapshot of the unacknowledged entries, oldest first.
    async fn entries(&self, stream: &str) -> QueueResult<Vec<JobEnvelope>>;
}
