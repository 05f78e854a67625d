//! In-memory implementations of the store traits and the job stream.
//!
//! `MemoryDebateStore` and `MemoryJobQueue` satisfy the trait contracts
//! without external services. They back the test suites and the CLI's
//! `--ephemeral` mode.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{QueueError, StorageError};
use crate::queue::{Delivery, JobEnvelope, JobQueue, QueueResult};
use crate::records::*;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryDebateStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreState {
    tasks: HashMap<String, TaskRecord>,
    rounds: HashMap<String, RoundRecord>,
    runs: HashMap<String, AgentRunRecord>,
    run_order: Vec<String>,
    run_keys: HashMap<String, String>,
    findings: HashMap<String, Vec<FindingRecord>>,
    consensus: HashMap<String, ConsensusRecord>,
    claims: HashMap<String, ClaimRecord>,
    markers: HashMap<String, CompletionMarker>,
    leases: HashMap<String, TaskLease>,
    contexts: HashMap<String, Vec<u8>>,
    events: Vec<EventRecord>,
}

/// In-memory implementation of every store trait behind one mutex, so each
/// call is atomic with respect to the others.
#[derive(Debug, Default)]
pub struct MemoryDebateStore {
    state: Mutex<StoreState>,
    injected_failures: AtomicU32,
}

impl MemoryDebateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` store calls fail with `StorageError::Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, StoreState>> {
        let pending = self.injected_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.injected_failures.store(pending - 1, Ordering::SeqCst);
            return Err(StorageError::Unavailable("injected failure".to_string()));
        }
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl TaskStore for MemoryDebateStore {
    async fn create_task(&self, task: TaskRecord) -> StorageResult<TaskRecord> {
        let mut state = self.lock()?;
        if state.tasks.values().any(|t| t.slug == task.slug) {
            return Err(StorageError::conflict("task", &task.slug, "slug already exists"));
        }
        if state.tasks.contains_key(task.id.as_str()) {
            return Err(StorageError::conflict("task", task.id.as_str(), "id already exists"));
        }
        state.tasks.insert(task.id.0.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> StorageResult<TaskRecord> {
        let state = self.lock()?;
        state
            .tasks
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| StorageError::not_found("task", id.as_str()))
    }

    async fn find_task_by_slug(&self, slug: &str) -> StorageResult<Option<TaskRecord>> {
        let state = self.lock()?;
        Ok(state.tasks.values().find(|t| t.slug == slug).cloned())
    }

    async fn update_task(&self, task: &TaskRecord, expected: TaskStatus) -> StorageResult<()> {
        let mut state = self.lock()?;
        let stored = state
            .tasks
            .get_mut(task.id.as_str())
            .ok_or_else(|| StorageError::not_found("task", task.id.as_str()))?;
        if stored.status != expected {
            return Err(StorageError::conflict(
                "task",
                task.id.as_str(),
                format!("status is {}, expected {}", stored.status, expected),
            ));
        }
        if stored.slug != task.slug {
            return Err(StorageError::conflict("task", task.id.as_str(), "slug is immutable"));
        }
        *stored = task.clone();
        Ok(())
    }

    async fn list_tasks(&self) -> StorageResult<Vec<TaskRecord>> {
        let state = self.lock()?;
        let mut tasks: Vec<TaskRecord> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.slug.cmp(&b.slug)));
        Ok(tasks)
    }
}

#[async_trait]
impl RoundStore for MemoryDebateStore {
    async fn create_round(&self, round: RoundRecord) -> StorageResult<RoundRecord> {
        let mut state = self.lock()?;
        let highest = state
            .rounds
            .values()
            .filter(|r| r.task_id == round.task_id)
            .map(|r| r.round_number)
            .max();
        if let Some(highest) = highest.filter(|h| round.round_number <= *h) {
            return Err(StorageError::conflict(
                "round",
                format!("{}:{}", round.task_id, round.round_number),
                format!("round number must exceed {highest}"),
            ));
        }
        state.rounds.insert(round.id.0.clone(), round.clone());
        Ok(round)
    }

    async fn get_round(&self, id: &RoundId) -> StorageResult<RoundRecord> {
        let state = self.lock()?;
        state
            .rounds
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| StorageError::not_found("round", id.as_str()))
    }

    async fn find_round(
        &self,
        task_id: &TaskId,
        round_number: u32,
    ) -> StorageResult<Option<RoundRecord>> {
        let state = self.lock()?;
        Ok(state
            .rounds
            .values()
            .find(|r| &r.task_id == task_id && r.round_number == round_number)
            .cloned())
    }

    async fn list_rounds(&self, task_id: &TaskId) -> StorageResult<Vec<RoundRecord>> {
        let state = self.lock()?;
        let mut rounds: Vec<RoundRecord> = state
            .rounds
            .values()
            .filter(|r| &r.task_id == task_id)
            .cloned()
            .collect();
        rounds.sort_by_key(|r| r.round_number);
        Ok(rounds)
    }

    async fn update_round(&self, round: &RoundRecord) -> StorageResult<()> {
        let mut state = self.lock()?;
        let stored = state
            .rounds
            .get_mut(round.id.as_str())
            .ok_or_else(|| StorageError::not_found("round", round.id.as_str()))?;
        *stored = round.clone();
        Ok(())
    }

    async fn insert_agent_run(&self, run: AgentRunRecord) -> StorageResult<AgentRunRecord> {
        let mut state = self.lock()?;
        if state.run_keys.contains_key(&run.idempotency_key) {
            return Err(StorageError::conflict(
                "agent_run",
                &run.idempotency_key,
                "idempotency key already exists",
            ));
        }
        state
            .run_keys
            .insert(run.idempotency_key.clone(), run.id.0.clone());
        state.run_order.push(run.id.0.clone());
        state.runs.insert(run.id.0.clone(), run.clone());
        Ok(run)
    }

    async fn find_agent_run(
        &self,
        idempotency_key: &str,
    ) -> StorageResult<Option<AgentRunRecord>> {
        let state = self.lock()?;
        Ok(state
            .run_keys
            .get(idempotency_key)
            .and_then(|id| state.runs.get(id))
            .cloned())
    }

    async fn list_agent_runs(&self, round_id: &RoundId) -> StorageResult<Vec<AgentRunRecord>> {
        let state = self.lock()?;
        Ok(state
            .run_order
            .iter()
            .filter_map(|id| state.runs.get(id))
            .filter(|r| &r.round_id == round_id)
            .cloned()
            .collect())
    }

    async fn update_agent_run(&self, run: &AgentRunRecord) -> StorageResult<()> {
        let mut state = self.lock()?;
        let stored = state
            .runs
            .get(run.id.as_str())
            .ok_or_else(|| StorageError::not_found("agent_run", run.id.as_str()))?;
        if stored.status.is_terminal() {
            return Err(StorageError::InvalidState {
                entity: "agent_run",
                id: run.id.0.clone(),
                status: stored.status.to_string(),
                expected: "scheduled or running".to_string(),
            });
        }
        if run.status == AgentRunStatus::Running {
            let other_running = state.runs.values().any(|r| {
                r.id != run.id
                    && r.round_id == run.round_id
                    && r.role == run.role
                    && r.status == AgentRunStatus::Running
            });
            if other_running {
                return Err(StorageError::conflict(
                    "agent_run",
                    format!("{}:{}", run.round_id, run.role),
                    "another run for this role is running",
                ));
            }
        }
        state.runs.insert(run.id.0.clone(), run.clone());
        Ok(())
    }

    async fn complete_agent_run(
        &self,
        run: &AgentRunRecord,
        findings: Vec<FindingRecord>,
    ) -> StorageResult<()> {
        let mut state = self.lock()?;
        let stored = state
            .runs
            .get(run.id.as_str())
            .ok_or_else(|| StorageError::not_found("agent_run", run.id.as_str()))?;
        if stored.status != AgentRunStatus::Running {
            return Err(StorageError::InvalidState {
                entity: "agent_run",
                id: run.id.0.clone(),
                status: stored.status.to_string(),
                expected: "running".to_string(),
            });
        }
        if !run.status.is_terminal() {
            return Err(StorageError::InvalidState {
                entity: "agent_run",
                id: run.id.0.clone(),
                status: run.status.to_string(),
                expected: "a terminal status".to_string(),
            });
        }
        if state.findings.contains_key(run.id.as_str()) {
            return Err(StorageError::conflict(
                "finding",
                run.id.as_str(),
                "findings already recorded",
            ));
        }
        state.runs.insert(run.id.0.clone(), run.clone());
        if !findings.is_empty() {
            state.findings.insert(run.id.0.clone(), findings);
        }
        Ok(())
    }

    async fn list_findings(&self, run_id: &AgentRunId) -> StorageResult<Vec<FindingRecord>> {
        let state = self.lock()?;
        Ok(state
            .findings
            .get(run_id.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_consensus(&self, result: ConsensusRecord) -> StorageResult<ConsensusRecord> {
        let mut state = self.lock()?;
        if state.consensus.contains_key(result.round_id.as_str()) {
            return Err(StorageError::conflict(
                "consensus",
                result.round_id.as_str(),
                "round already has a consensus result",
            ));
        }
        state
            .consensus
            .insert(result.round_id.0.clone(), result.clone());
        Ok(result)
    }

    async fn get_consensus(&self, round_id: &RoundId) -> StorageResult<Option<ConsensusRecord>> {
        let state = self.lock()?;
        Ok(state.consensus.get(round_id.as_str()).cloned())
    }
}

#[async_trait]
impl ClaimStore for MemoryDebateStore {
    async fn try_claim(&self, claim: ClaimRecord, now: DateTime<Utc>) -> StorageResult<bool> {
        let mut state = self.lock()?;
        if let Some(existing) = state.claims.get(&claim.lock_key) {
            if existing.owner != claim.owner && existing.is_live(now) {
                return Ok(false);
            }
        }
        state.claims.insert(claim.lock_key.clone(), claim);
        Ok(true)
    }

    async fn release_claim(&self, lock_key: &str, owner: &str) -> StorageResult<()> {
        let mut state = self.lock()?;
        if state
            .claims
            .get(lock_key)
            .is_some_and(|c| c.owner == owner)
        {
            state.claims.remove(lock_key);
        }
        Ok(())
    }

    async fn get_claim(&self, lock_key: &str) -> StorageResult<Option<ClaimRecord>> {
        let state = self.lock()?;
        Ok(state.claims.get(lock_key).cloned())
    }

    async fn put_completion_marker(&self, marker: CompletionMarker) -> StorageResult<bool> {
        let mut state = self.lock()?;
        if state.markers.contains_key(&marker.idempotency_key) {
            return Ok(false);
        }
        state
            .markers
            .insert(marker.idempotency_key.clone(), marker);
        Ok(true)
    }

    async fn get_completion_marker(
        &self,
        idempotency_key: &str,
    ) -> StorageResult<Option<CompletionMarker>> {
        let state = self.lock()?;
        Ok(state.markers.get(idempotency_key).cloned())
    }

    async fn try_acquire_lease(&self, lease: TaskLease, now: DateTime<Utc>) -> StorageResult<bool> {
        let mut state = self.lock()?;
        if let Some(existing) = state.leases.get(lease.task_id.as_str()) {
            if existing.owner != lease.owner && existing.expires_at > now {
                return Ok(false);
            }
        }
        state.leases.insert(lease.task_id.0.clone(), lease);
        Ok(true)
    }

    async fn release_lease(&self, task_id: &TaskId, owner: &str) -> StorageResult<()> {
        let mut state = self.lock()?;
        if state
            .leases
            .get(task_id.as_str())
            .is_some_and(|l| l.owner == owner)
        {
            state.leases.remove(task_id.as_str());
        }
        Ok(())
    }
}

#[async_trait]
impl ContextStore for MemoryDebateStore {
    async fn put_context(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let mut state = self.lock()?;
        state
            .contexts
            .insert(digest.as_str().to_string(), data.to_vec());
        Ok(digest)
    }

    async fn get_context(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let state = self.lock()?;
        state
            .contexts
            .get(digest.as_str())
            .cloned()
            .ok_or_else(|| StorageError::not_found("context", digest.as_str()))
    }
}

#[async_trait]
impl EventStore for MemoryDebateStore {
    async fn log_event(&self, event: EventRecord) -> StorageResult<()> {
        let mut state = self.lock()?;
        state.events.push(event);
        Ok(())
    }

    async fn list_events(&self, task_id: &TaskId) -> StorageResult<Vec<EventRecord>> {
        let state = self.lock()?;
        let mut events: Vec<EventRecord> = state
            .events
            .iter()
            .filter(|e| e.task_id == *task_id)
            .cloned()
            .collect();
        // Stable: same-instant events keep logging order.
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// MemoryJobQueue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<u64, JobEnvelope>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    streams: HashMap<String, StreamState>,
    limits: HashMap<String, usize>,
}

/// In-memory consumer-group stream.
///
/// Acknowledged entries are dropped from the stream, so `len` reports the
/// entries still waiting for or undergoing processing.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    appended: Notify,
}

fn message_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_message_id(stream: &str, group: &str, id: &str) -> QueueResult<u64> {
    id.split('-')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| QueueError::UnknownMessage {
            stream: stream.to_string(),
            group: group.to_string(),
            message_id: id.to_string(),
        })
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of unacknowledged entries `stream` may hold.
    pub fn with_max_depth(self, stream: &str, depth: usize) -> Self {
        self.lock().limits.insert(stream.to_string(), depth);
        self
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver_new(&self, stream: &str, group: &str, consumer: &str, count: usize) -> Vec<Delivery> {
        let mut state = self.lock();
        let Some(s) = state.streams.get_mut(stream) else {
            return Vec::new();
        };
        let g = s.groups.entry(group.to_string()).or_default();
        let fresh: Vec<(u64, JobEnvelope)> = s
            .entries
            .range(g.last_delivered + 1..)
            .take(count)
            .map(|(seq, env)| (*seq, env.clone()))
            .collect();

        let now = Instant::now();
        fresh
            .into_iter()
            .map(|(seq, envelope)| {
                g.last_delivered = seq;
                g.pending.insert(
                    seq,
                    PendingEntry {
                        consumer: consumer.to_string(),
                        delivered_at: now,
                        delivery_count: 1,
                    },
                );
                Delivery {
                    message_id: message_id(seq),
                    stream: stream.to_string(),
                    envelope,
                    delivery_count: 1,
                }
            })
            .collect()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn append(&self, stream: &str, envelope: JobEnvelope) -> QueueResult<String> {
        let id = {
            let mut state = self.lock();
            let limit = state.limits.get(stream).copied();
            let depth = state.streams.get(stream).map_or(0, |s| s.entries.len());
            if let Some(max) = limit {
                if depth >= max {
                    return Err(QueueError::QueueFull {
                        stream: stream.to_string(),
                        depth,
                    });
                }
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            state
                .streams
                .entry(stream.to_string())
                .or_default()
                .entries
                .insert(seq, envelope);
            message_id(seq)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delivered = self.deliver_new(stream, group, consumer, count);
            if !delivered.is_empty() {
                return Ok(delivered);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> QueueResult<()> {
        let seq = parse_message_id(stream, group, message_id)?;
        let mut state = self.lock();
        let removed = state
            .streams
            .get_mut(stream)
            .and_then(|s| {
                let pending = s.groups.get_mut(group)?.pending.remove(&seq);
                if pending.is_some() {
                    s.entries.remove(&seq);
                }
                pending
            })
            .is_some();
        if !removed {
            return Err(QueueError::UnknownMessage {
                stream: stream.to_string(),
                group: group.to_string(),
                message_id: message_id.to_string(),
            });
        }
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut state = self.lock();
        let Some(s) = state.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut reclaimed = Vec::new();
        for (seq, entry) in g.pending.iter_mut() {
            if reclaimed.len() >= count {
                break;
            }
            if now.duration_since(entry.delivered_at) < min_idle {
                continue;
            }
            let Some(envelope) = s.entries.get(seq) else {
                continue;
            };
            entry.consumer = consumer.to_string();
            entry.delivered_at = now;
            entry.delivery_count += 1;
            reclaimed.push(Delivery {
                message_id: message_id(*seq),
                stream: stream.to_string(),
                envelope: envelope.clone(),
                delivery_count: entry.delivery_count,
            });
        }
        Ok(reclaimed)
    }

    async fn len(&self, stream: &str) -> QueueResult<usize> {
        let state = self.lock();
        Ok(state.streams.get(stream).map_or(0, |s| s.entries.len()))
    }

    async fn entries(&self, stream: &str) -> QueueResult<Vec<JobEnvelope>> {
        let state = self.lock();
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.entries.values().cloned().collect())
            .unwrap_or_default())
    }
}
