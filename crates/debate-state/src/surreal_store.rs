//! SurrealDB-backed implementation of the store traits
//!
//! Uses the row types in `schema` for persistence, converting to and from the
//! domain records at the boundary. Multi-step guarantees (terminal run plus
//! findings, claim check plus write) run inside a single SurrealQL
//! transaction; failed preconditions abort it with `THROW`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::handle;
use crate::records::*;
use crate::schema::*;
use crate::storage_traits::*;

/// SurrealDB-backed implementation of [`DebateStore`].
#[derive(Clone)]
pub struct SurrealDebateStore {
    db: Surreal<Any>,
}

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn is_unique_violation(msg: &str) -> bool {
    msg.contains("already contains")
}

/// Collapse per-statement errors of a response into one message.
fn statement_errors(errors: HashMap<usize, surrealdb::Error>) -> Option<String> {
    if errors.is_empty() {
        return None;
    }
    let mut ordered: Vec<(usize, String)> =
        errors.into_iter().map(|(i, e)| (i, e.to_string())).collect();
    ordered.sort_by_key(|(i, _)| *i);
    Some(
        ordered
            .into_iter()
            .map(|(_, m)| m)
            .collect::<Vec<_>>()
            .join("; "),
    )
}

impl SurrealDebateStore {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = handle::connect_url("mem://").await?;
        info!("SurrealDebateStore connected (in-memory)");
        Ok(Self::new(db))
    }

    /// Open a local `surrealkv` database at `path`.
    pub async fn open_local(path: &Path) -> crate::Result<Self> {
        Ok(Self::new(handle::connect_local(path).await?))
    }

    /// Resolve the backend from `SURREALDB_*` environment variables.
    pub async fn from_env() -> crate::Result<Self> {
        Ok(Self::new(handle::connect_from_env().await?))
    }

    // -- private helpers -----------------------------------------------------

    async fn select<T: DeserializeOwned>(
        &self,
        sql: &'static str,
        binds: Vec<(&'static str, String)>,
    ) -> StorageResult<Vec<T>> {
        let mut query = self.db.query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let mut res = query.await.map_err(backend)?;
        res.take(0).map_err(backend)
    }

    async fn create_row<T>(
        &self,
        table: &'static str,
        row: T,
        entity: &'static str,
        key: &str,
    ) -> StorageResult<()>
    where
        T: serde::Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let _created: Option<T> = self.db.create(table).content(row).await.map_err(|e| {
            let msg = e.to_string();
            if is_unique_violation(&msg) {
                StorageError::conflict(entity, key, "already exists")
            } else {
                StorageError::Backend(msg)
            }
        })?;
        Ok(())
    }

    async fn fetch_run_by_id(&self, run_id: &str) -> StorageResult<Option<AgentRunRecord>> {
        let rows: Vec<AgentRunRow> = self
            .select(
                "SELECT * FROM agent_runs WHERE run_id = $rid",
                vec![("rid", run_id.to_string())],
            )
            .await?;
        Ok(rows.into_iter().next().map(|r| r.body))
    }

    /// Delete-then-create under a unique index; a live foreign row makes the
    /// create fail and the grant is refused.
    async fn exclusive_upsert<T>(
        &self,
        table: &'static str,
        key_column: &'static str,
        key: String,
        owner: String,
        row: T,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>
    where
        T: serde::Serialize + Send + Sync + 'static,
    {
        let sql = format!(
            "BEGIN TRANSACTION;
             DELETE {table} WHERE {key_column} = $key AND (owner = $owner OR expires_at_ms <= $now);
             CREATE {table} CONTENT $row;
             COMMIT TRANSACTION;"
        );
        let mut res = self
            .db
            .query(sql)
            .bind(("key", key))
            .bind(("owner", owner))
            .bind(("now", now.timestamp_millis()))
            .bind(("row", row))
            .await
            .map_err(backend)?;
        match statement_errors(res.take_errors()) {
            None => Ok(true),
            Some(msg) if is_unique_violation(&msg) => Ok(false),
            Some(msg) => Err(StorageError::Backend(msg)),
        }
    }
}

#[async_trait]
impl TaskStore for SurrealDebateStore {
    async fn create_task(&self, task: TaskRecord) -> StorageResult<TaskRecord> {
        debug!(task_id = %task.id, slug = %task.slug, "creating task");
        self.create_row("tasks", TaskRow::from(&task), "task", &task.slug)
            .await?;
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> StorageResult<TaskRecord> {
        let rows: Vec<TaskRow> = self
            .select(
                "SELECT * FROM tasks WHERE task_id = $tid",
                vec![("tid", id.0.clone())],
            )
            .await?;
        rows.into_iter()
            .next()
            .map(|r| r.body)
            .ok_or_else(|| StorageError::not_found("task", id.as_str()))
    }

    async fn find_task_by_slug(&self, slug: &str) -> StorageResult<Option<TaskRecord>> {
        let rows: Vec<TaskRow> = self
            .select(
                "SELECT * FROM tasks WHERE slug = $slug",
                vec![("slug", slug.to_string())],
            )
            .await?;
        Ok(rows.into_iter().next().map(|r| r.body))
    }

    async fn update_task(&self, task: &TaskRecord, expected: TaskStatus) -> StorageResult<()> {
        let row = TaskRow::from(task);
        let mut res = self
            .db
            .query(
                "UPDATE tasks SET status = $new_status, body = $body \
                 WHERE task_id = $tid AND status = $expected AND slug = $slug RETURN AFTER",
            )
            .bind(("new_status", row.status))
            .bind(("slug", row.slug))
            .bind(("body", row.body))
            .bind(("tid", task.id.0.clone()))
            .bind(("expected", expected.as_str().to_string()))
            .await
            .map_err(backend)?;
        let updated: Vec<TaskRow> = res.take(0).map_err(backend)?;
        if updated.is_empty() {
            let stored = self.get_task(&task.id).await?;
            if stored.slug != task.slug {
                return Err(StorageError::conflict(
                    "task",
                    task.id.as_str(),
                    "slug is immutable",
                ));
            }
            return Err(StorageError::conflict(
                "task",
                task.id.as_str(),
                format!("status is {}, expected {}", stored.status, expected),
            ));
        }
        Ok(())
    }

    async fn list_tasks(&self) -> StorageResult<Vec<TaskRecord>> {
        let rows: Vec<TaskRow> = self
            .select("SELECT * FROM tasks ORDER BY created_at DESC", Vec::new())
            .await?;
        Ok(rows.into_iter().map(|r| r.body).collect())
    }
}

#[async_trait]
impl RoundStore for SurrealDebateStore {
    async fn create_round(&self, round: RoundRecord) -> StorageResult<RoundRecord> {
        let key = format!("{}:{}", round.task_id, round.round_number);
        let highest = self
            .list_rounds(&round.task_id)
            .await?
            .iter()
            .map(|r| r.round_number)
            .max();
        if let Some(highest) = highest.filter(|h| round.round_number <= *h) {
            return Err(StorageError::conflict(
                "round",
                key,
                format!("round number must exceed {highest}"),
            ));
        }
        self.create_row("rounds", RoundRow::from(&round), "round", &key)
            .await?;
        Ok(round)
    }

    async fn get_round(&self, id: &RoundId) -> StorageResult<RoundRecord> {
        let rows: Vec<RoundRow> = self
            .select(
                "SELECT * FROM rounds WHERE round_id = $rid",
                vec![("rid", id.0.clone())],
            )
            .await?;
        rows.into_iter()
            .next()
            .map(|r| r.body)
            .ok_or_else(|| StorageError::not_found("round", id.as_str()))
    }

    async fn find_round(
        &self,
        task_id: &TaskId,
        round_number: u32,
    ) -> StorageResult<Option<RoundRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM rounds WHERE task_id = $tid AND round_number = $n")
            .bind(("tid", task_id.0.clone()))
            .bind(("n", round_number))
            .await
            .map_err(backend)?;
        let rows: Vec<RoundRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next().map(|r| r.body))
    }

    async fn list_rounds(&self, task_id: &TaskId) -> StorageResult<Vec<RoundRecord>> {
        let rows: Vec<RoundRow> = self
            .select(
                "SELECT * FROM rounds WHERE task_id = $tid ORDER BY round_number ASC",
                vec![("tid", task_id.0.clone())],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.body).collect())
    }

    async fn update_round(&self, round: &RoundRecord) -> StorageResult<()> {
        let mut res = self
            .db
            .query("UPDATE rounds SET body = $body WHERE round_id = $rid RETURN AFTER")
            .bind(("body", round.clone()))
            .bind(("rid", round.id.0.clone()))
            .await
            .map_err(backend)?;
        let updated: Vec<RoundRow> = res.take(0).map_err(backend)?;
        if updated.is_empty() {
            return Err(StorageError::not_found("round", round.id.as_str()));
        }
        Ok(())
    }

    async fn insert_agent_run(&self, run: AgentRunRecord) -> StorageResult<AgentRunRecord> {
        debug!(run_id = %run.id, role = %run.role, key = %run.idempotency_key, "inserting agent run");
        self.create_row(
            "agent_runs",
            AgentRunRow::from(&run),
            "agent_run",
            &run.idempotency_key,
        )
        .await?;
        Ok(run)
    }

    async fn find_agent_run(
        &self,
        idempotency_key: &str,
    ) -> StorageResult<Option<AgentRunRecord>> {
        let rows: Vec<AgentRunRow> = self
            .select(
                "SELECT * FROM agent_runs WHERE idempotency_key = $key",
                vec![("key", idempotency_key.to_string())],
            )
            .await?;
        Ok(rows.into_iter().next().map(|r| r.body))
    }

    async fn list_agent_runs(&self, round_id: &RoundId) -> StorageResult<Vec<AgentRunRecord>> {
        let rows: Vec<AgentRunRow> = self
            .select(
                "SELECT * FROM agent_runs WHERE round_id = $rid ORDER BY created_at ASC",
                vec![("rid", round_id.0.clone())],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.body).collect())
    }

    async fn update_agent_run(&self, run: &AgentRunRecord) -> StorageResult<()> {
        let row = AgentRunRow::from(run);
        let mut res = self
            .db
            .query(
                r#"BEGIN TRANSACTION;
                LET $stored = (SELECT VALUE status FROM agent_runs WHERE run_id = $rid);
                IF array::len($stored) == 0 { THROW "run_missing"; };
                IF $stored[0] NOTINSIDE ["scheduled", "running"] { THROW "run_terminal"; };
                LET $busy = (SELECT VALUE run_id FROM agent_runs
                    WHERE round_id = $round AND role = $role AND status = "running" AND run_id != $rid);
                IF $new_status == "running" AND array::len($busy) > 0 { THROW "role_busy"; };
                UPDATE agent_runs SET status = $new_status, body = $body WHERE run_id = $rid;
                COMMIT TRANSACTION;"#,
            )
            .bind(("rid", row.run_id))
            .bind(("round", row.round_id))
            .bind(("role", row.role))
            .bind(("new_status", row.status))
            .bind(("body", row.body))
            .await
            .map_err(backend)?;

        let Some(msg) = statement_errors(res.take_errors()) else {
            return Ok(());
        };
        if msg.contains("run_missing") {
            Err(StorageError::not_found("agent_run", run.id.as_str()))
        } else if msg.contains("run_terminal") {
            let status = self
                .fetch_run_by_id(run.id.as_str())
                .await?
                .map(|r| r.status.to_string())
                .unwrap_or_default();
            Err(StorageError::InvalidState {
                entity: "agent_run",
                id: run.id.0.clone(),
                status,
                expected: "scheduled or running".to_string(),
            })
        } else if msg.contains("role_busy") {
            Err(StorageError::conflict(
                "agent_run",
                format!("{}:{}", run.round_id, run.role),
                "another run for this role is running",
            ))
        } else {
            Err(StorageError::Backend(msg))
        }
    }

    async fn complete_agent_run(
        &self,
        run: &AgentRunRecord,
        findings: Vec<FindingRecord>,
    ) -> StorageResult<()> {
        if !run.status.is_terminal() {
            return Err(StorageError::InvalidState {
                entity: "agent_run",
                id: run.id.0.clone(),
                status: run.status.to_string(),
                expected: "a terminal status".to_string(),
            });
        }

        let rows: Vec<FindingRow> = findings
            .iter()
            .enumerate()
            .map(|(i, f)| FindingRow::new(i as u32, f))
            .collect();
        let insert = if rows.is_empty() {
            ""
        } else {
            "INSERT INTO findings $findings;"
        };
        let sql = format!(
            r#"BEGIN TRANSACTION;
            LET $updated = (UPDATE agent_runs SET status = $new_status, body = $body
                WHERE run_id = $rid AND status = "running" RETURN AFTER);
            IF array::len($updated) == 0 {{ THROW "run_not_running"; }};
            {insert}
            COMMIT TRANSACTION;"#
        );

        let row = AgentRunRow::from(run);
        let mut res = self
            .db
            .query(sql)
            .bind(("rid", row.run_id))
            .bind(("new_status", row.status))
            .bind(("body", row.body))
            .bind(("findings", rows))
            .await
            .map_err(backend)?;

        let Some(msg) = statement_errors(res.take_errors()) else {
            debug!(run_id = %run.id, status = %run.status, findings = findings.len(), "agent run completed");
            return Ok(());
        };
        if !msg.contains("run_not_running") {
            return Err(StorageError::Backend(msg));
        }
        match self.fetch_run_by_id(run.id.as_str()).await? {
            None => Err(StorageError::not_found("agent_run", run.id.as_str())),
            Some(stored) => Err(StorageError::InvalidState {
                entity: "agent_run",
                id: run.id.0.clone(),
                status: stored.status.to_string(),
                expected: "running".to_string(),
            }),
        }
    }

    async fn list_findings(&self, run_id: &AgentRunId) -> StorageResult<Vec<FindingRecord>> {
        let rows: Vec<FindingRow> = self
            .select(
                "SELECT * FROM findings WHERE run_id = $rid ORDER BY ordinal ASC",
                vec![("rid", run_id.0.clone())],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.body).collect())
    }

    async fn insert_consensus(&self, result: ConsensusRecord) -> StorageResult<ConsensusRecord> {
        self.create_row(
            "consensus",
            ConsensusRow::from(&result),
            "consensus",
            result.round_id.as_str(),
        )
        .await?;
        Ok(result)
    }

    async fn get_consensus(&self, round_id: &RoundId) -> StorageResult<Option<ConsensusRecord>> {
        let rows: Vec<ConsensusRow> = self
            .select(
                "SELECT * FROM consensus WHERE round_id = $rid",
                vec![("rid", round_id.0.clone())],
            )
            .await?;
        Ok(rows.into_iter().next().map(|r| r.body))
    }
}

#[async_trait]
impl ClaimStore for SurrealDebateStore {
    async fn try_claim(&self, claim: ClaimRecord, now: DateTime<Utc>) -> StorageResult<bool> {
        let row = ClaimRow::from(&claim);
        self.exclusive_upsert(
            "claims",
            "lock_key",
            claim.lock_key.clone(),
            claim.owner.clone(),
            row,
            now,
        )
        .await
    }

    async fn release_claim(&self, lock_key: &str, owner: &str) -> StorageResult<()> {
        self.db
            .query("DELETE claims WHERE lock_key = $key AND owner = $owner")
            .bind(("key", lock_key.to_string()))
            .bind(("owner", owner.to_string()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn get_claim(&self, lock_key: &str) -> StorageResult<Option<ClaimRecord>> {
        let rows: Vec<ClaimRow> = self
            .select(
                "SELECT * FROM claims WHERE lock_key = $key",
                vec![("key", lock_key.to_string())],
            )
            .await?;
        Ok(rows.into_iter().next().map(|r| r.body))
    }

    async fn put_completion_marker(&self, marker: CompletionMarker) -> StorageResult<bool> {
        let key = marker.idempotency_key.clone();
        let row = MarkerRow {
            id: None,
            idempotency_key: key.clone(),
            body: marker,
        };
        match self
            .create_row("completion_markers", row, "completion_marker", &key)
            .await
        {
            Ok(()) => Ok(true),
            Err(StorageError::Conflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_completion_marker(
        &self,
        idempotency_key: &str,
    ) -> StorageResult<Option<CompletionMarker>> {
        let rows: Vec<MarkerRow> = self
            .select(
                "SELECT * FROM completion_markers WHERE idempotency_key = $key",
                vec![("key", idempotency_key.to_string())],
            )
            .await?;
        Ok(rows.into_iter().next().map(|r| r.body))
    }

    async fn try_acquire_lease(&self, lease: TaskLease, now: DateTime<Utc>) -> StorageResult<bool> {
        let row = LeaseRow::from(&lease);
        self.exclusive_upsert(
            "task_leases",
            "task_id",
            lease.task_id.0.clone(),
            lease.owner.clone(),
            row,
            now,
        )
        .await
    }

    async fn release_lease(&self, task_id: &TaskId, owner: &str) -> StorageResult<()> {
        self.db
            .query("DELETE task_leases WHERE task_id = $key AND owner = $owner")
            .bind(("key", task_id.0.clone()))
            .bind(("owner", owner.to_string()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl ContextStore for SurrealDebateStore {
    async fn put_context(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let row = ContextRow {
            id: None,
            digest: digest.as_str().to_string(),
            data: hex::encode(data),
        };
        match self
            .create_row("contexts", row, "context", digest.as_str())
            .await
        {
            Ok(()) | Err(StorageError::Conflict { .. }) => Ok(digest),
            Err(e) => Err(e),
        }
    }

    async fn get_context(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let rows: Vec<ContextRow> = self
            .select(
                "SELECT * FROM contexts WHERE digest = $digest",
                vec![("digest", digest.as_str().to_string())],
            )
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::not_found("context", digest.as_str()))?;
        hex::decode(row.data).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl EventStore for SurrealDebateStore {
    async fn log_event(&self, event: EventRecord) -> StorageResult<()> {
        self.create_row("events", EventRow::from(&event), "event", event.id.as_str())
            .await
    }

    async fn list_events(&self, task_id: &TaskId) -> StorageResult<Vec<EventRecord>> {
        let rows: Vec<EventRow> = self
            .select(
                "SELECT * FROM events WHERE task_id = $tid ORDER BY created_at ASC",
                vec![("tid", task_id.0.clone())],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.body).collect())
    }
}
