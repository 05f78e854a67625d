//! Row definitions for the debate engine's SurrealDB tables
//!
//! Tables:
//! - tasks: one row per task, `status` and `slug` lifted out for indexes
//! - rounds: keyed by `(task_id, round_number)`
//! - agent_runs: keyed by `idempotency_key`
//! - findings: attached to an agent run
//! - consensus: one row per round
//! - claims / completion_markers / task_leases: dispatcher coordination
//! - contexts: content-addressed round context
//! - events: append-only per-task event log
//!
//! Each row carries the indexed columns next to a `body` holding the full
//! domain record, which is what the store traits hand back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::records::*;

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub task_id: String,
    pub slug: String,
    pub status: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    pub body: TaskRecord,
}

impl From<&TaskRecord> for TaskRow {
    fn from(task: &TaskRecord) -> Self {
        Self {
            id: None,
            task_id: task.id.0.clone(),
            slug: task.slug.clone(),
            status: task.status.as_str().to_string(),
            created_at: task.created_at,
            body: task.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRow {
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub round_id: String,
    pub task_id: String,
    pub round_number: u32,
    pub body: RoundRecord,
}

impl From<&RoundRecord> for RoundRow {
    fn from(round: &RoundRecord) -> Self {
        Self {
            id: None,
            round_id: round.id.0.clone(),
            task_id: round.task_id.0.clone(),
            round_number: round.round_number,
            body: round.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunRow {
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    pub round_id: String,
    pub role: String,
    pub status: String,
    pub idempotency_key: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    pub body: AgentRunRecord,
}

impl From<&AgentRunRecord> for AgentRunRow {
    fn from(run: &AgentRunRecord) -> Self {
        Self {
            id: None,
            run_id: run.id.0.clone(),
            round_id: run.round_id.0.clone(),
            role: run.role.as_str().to_string(),
            status: run.status.as_str().to_string(),
            idempotency_key: run.idempotency_key.clone(),
            created_at: run.created_at,
            body: run.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingRow {
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub finding_id: String,
    pub run_id: String,
    /// Position within the agent's output.
    pub ordinal: u32,
    pub body: FindingRecord,
}

impl FindingRow {
    pub fn new(ordinal: u32, finding: &FindingRecord) -> Self {
        Self {
            id: None,
            finding_id: finding.id.0.clone(),
            run_id: finding.run_id.0.clone(),
            ordinal,
            body: finding.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRow {
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub round_id: String,
    pub task_id: String,
    pub body: ConsensusRecord,
}

impl From<&ConsensusRecord> for ConsensusRow {
    fn from(result: &ConsensusRecord) -> Self {
        Self {
            id: None,
            round_id: result.round_id.0.clone(),
            task_id: result.task_id.0.clone(),
            body: result.clone(),
        }
    }
}

/// Claims and leases compare expiry as epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRow {
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub lock_key: String,
    pub owner: String,
    pub expires_at_ms: i64,
    pub body: ClaimRecord,
}

impl From<&ClaimRecord> for ClaimRow {
    fn from(claim: &ClaimRecord) -> Self {
        Self {
            id: None,
            lock_key: claim.lock_key.clone(),
            owner: claim.owner.clone(),
            expires_at_ms: claim.expires_at.timestamp_millis(),
            body: claim.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerRow {
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub idempotency_key: String,
    pub body: CompletionMarker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRow {
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub task_id: String,
    pub owner: String,
    pub expires_at_ms: i64,
    pub body: TaskLease,
}

impl From<&TaskLease> for LeaseRow {
    fn from(lease: &TaskLease) -> Self {
        Self {
            id: None,
            task_id: lease.task_id.0.clone(),
            owner: lease.owner.clone(),
            expires_at_ms: lease.expires_at.timestamp_millis(),
            body: lease.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRow {
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub digest: String,
    /// Payload bytes, hex encoded.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub event_id: String,
    pub task_id: String,
    pub kind: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    pub body: EventRecord,
}

impl From<&EventRecord> for EventRow {
    fn from(event: &EventRecord) -> Self {
        Self {
            id: None,
            event_id: event.id.0.clone(),
            task_id: event.task_id.0.clone(),
            kind: event.kind.as_str().to_string(),
            created_at: event.created_at,
            body: event.clone(),
        }
    }
}
