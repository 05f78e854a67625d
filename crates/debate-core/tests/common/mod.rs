//! Shared fixtures for the debate-core integration suites.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use debate_core::{
    AgentExecutor, AgentFailure, AgentRequest, DebateEngine, EngineConfig, RetryConfig,
    TimeoutConfig,
};
use debate_state::{
    AgentRunId, AgentRunRecord, ClaimRecord, ClaimStore, CompletionMarker, ConsensusRecord,
    ContentDigest, ContextStore, EventRecord, EventStore, FindingRecord, MemoryDebateStore,
    MemoryJobQueue, Role, RoundId, RoundRecord, RoundStore, Severity, StorageError,
    StorageResult, TaskId, TaskLease, TaskRecord, TaskStatus, TaskStore, ANALYSIS_STREAM,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Defaults with short timers; every test runs on paused time.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.timeouts = TimeoutConfig {
        agent_secs: 5,
        round_secs: 60,
        debate_secs: 3_600,
        claim_grace_secs: 1,
    };
    config.retry = RetryConfig {
        max_attempts: 3,
        base_delay_ms: 10,
        max_delay_ms: 100,
    };
    config.storage_retry = RetryConfig {
        max_attempts: 2,
        base_delay_ms: 1,
        max_delay_ms: 10,
    };
    config.queue.poll_interval_ms = 50;
    config.workers = 2;
    config
}

// ---------------------------------------------------------------------------
// Agent replies
// ---------------------------------------------------------------------------

/// A fenced structured reply with `(category, file, severity)` findings.
pub fn reply(findings: &[(&str, &str, Severity)], recommendations: &[&str]) -> String {
    reply_with_agreements(findings, recommendations, &[])
}

pub fn reply_with_agreements(
    findings: &[(&str, &str, Severity)],
    recommendations: &[&str],
    agreed_topics: &[&str],
) -> String {
    let findings: Vec<_> = findings
        .iter()
        .map(|(category, file, severity)| {
            json!({
                "category": category,
                "file_path": file,
                "severity": severity,
                "description": format!("{category} issue in {file}"),
            })
        })
        .collect();
    let agreements: Vec<_> = agreed_topics
        .iter()
        .map(|t| json!({ "topic": t, "stance": "agree" }))
        .collect();
    let body = json!({
        "findings": findings,
        "recommendations": recommendations,
        "explicit_agreements": agreements,
    });
    format!("Analysis follows.\n\n```json:structured_output\n{body}\n```\n")
}

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Transient,
    Permanent,
    /// Never returns; counts a drop when the call is abandoned.
    Hang,
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Executor answering from a per-role script. The last step of a script
/// repeats once the others are used up.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<Role, VecDeque<Step>>>,
    calls: Mutex<Vec<AgentRequest>>,
    abandoned: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, role: Role, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(role, steps.into_iter().collect());
        self
    }

    pub fn calls(&self) -> Vec<AgentRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, role: Role) -> usize {
        self.calls().iter().filter(|c| c.role == role).count()
    }

    /// Hanging calls that were dropped by a timeout or cancellation.
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    fn next_step(&self, role: Role) -> Step {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&role) {
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap(),
            Some(steps) if steps.len() == 1 => steps[0].clone(),
            _ => Step::Permanent,
        }
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(&self, request: &AgentRequest) -> Result<String, AgentFailure> {
        self.calls.lock().unwrap().push(request.clone());
        match self.next_step(request.role) {
            Step::Reply(raw) => Ok(raw),
            Step::Transient => Err(AgentFailure::Transient("rate limited".into())),
            Step::Permanent => Err(AgentFailure::Permanent("model refused".into())),
            Step::Hang => {
                let _guard = DropCounter(Arc::clone(&self.abandoned));
                std::future::pending::<Result<String, AgentFailure>>().await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store with targeted failure injection
// ---------------------------------------------------------------------------

/// Delegates to [`MemoryDebateStore`]; `get_consensus` can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryDebateStore,
    consensus_failures: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_consensus_reads(&self, count: u32) {
        self.consensus_failures.store(count, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryDebateStore {
        &self.inner
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn create_task(&self, task: TaskRecord) -> StorageResult<TaskRecord> {
        self.inner.create_task(task).await
    }
    async fn get_task(&self, id: &TaskId) -> StorageResult<TaskRecord> {
        self.inner.get_task(id).await
    }
    async fn find_task_by_slug(&self, slug: &str) -> StorageResult<Option<TaskRecord>> {
        self.inner.find_task_by_slug(slug).await
    }
    async fn update_task(&self, task: &TaskRecord, expected: TaskStatus) -> StorageResult<()> {
        self.inner.update_task(task, expected).await
    }
    async fn list_tasks(&self) -> StorageResult<Vec<TaskRecord>> {
        self.inner.list_tasks().await
    }
}

#[async_trait]
impl RoundStore for FlakyStore {
    async fn create_round(&self, round: RoundRecord) -> StorageResult<RoundRecord> {
        self.inner.create_round(round).await
    }
    async fn get_round(&self, id: &RoundId) -> StorageResult<RoundRecord> {
        self.inner.get_round(id).await
    }
    async fn find_round(
        &self,
        task_id: &TaskId,
        round_number: u32,
    ) -> StorageResult<Option<RoundRecord>> {
        self.inner.find_round(task_id, round_number).await
    }
    async fn list_rounds(&self, task_id: &TaskId) -> StorageResult<Vec<RoundRecord>> {
        self.inner.list_rounds(task_id).await
    }
    async fn update_round(&self, round: &RoundRecord) -> StorageResult<()> {
        self.inner.update_round(round).await
    }
    async fn insert_agent_run(&self, run: AgentRunRecord) -> StorageResult<AgentRunRecord> {
        self.inner.insert_agent_run(run).await
    }
    async fn find_agent_run(&self, key: &str) -> StorageResult<Option<AgentRunRecord>> {
        self.inner.find_agent_run(key).await
    }
    async fn list_agent_runs(&self, round_id: &RoundId) -> StorageResult<Vec<AgentRunRecord>> {
        self.inner.list_agent_runs(round_id).await
    }
    async fn update_agent_run(&self, run: &AgentRunRecord) -> StorageResult<()> {
        self.inner.update_agent_run(run).await
    }
    async fn complete_agent_run(
        &self,
        run: &AgentRunRecord,
        findings: Vec<FindingRecord>,
    ) -> StorageResult<()> {
        self.inner.complete_agent_run(run, findings).await
    }
    async fn list_findings(&self, run_id: &AgentRunId) -> StorageResult<Vec<FindingRecord>> {
        self.inner.list_findings(run_id).await
    }
    async fn insert_consensus(&self, result: ConsensusRecord) -> StorageResult<ConsensusRecord> {
        self.inner.insert_consensus(result).await
    }
    async fn get_consensus(&self, round_id: &RoundId) -> StorageResult<Option<ConsensusRecord>> {
        let pending = self.consensus_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.consensus_failures.store(pending - 1, Ordering::SeqCst);
            return Err(StorageError::Unavailable("injected failure".into()));
        }
        self.inner.get_consensus(round_id).await
    }
}

#[async_trait]
impl ClaimStore for FlakyStore {
    async fn try_claim(&self, claim: ClaimRecord, now: DateTime<Utc>) -> StorageResult<bool> {
        self.inner.try_claim(claim, now).await
    }
    async fn release_claim(&self, lock_key: &str, owner: &str) -> StorageResult<()> {
        self.inner.release_claim(lock_key, owner).await
    }
    async fn get_claim(&self, lock_key: &str) -> StorageResult<Option<ClaimRecord>> {
        self.inner.get_claim(lock_key).await
    }
    async fn put_completion_marker(&self, marker: CompletionMarker) -> StorageResult<bool> {
        self.inner.put_completion_marker(marker).await
    }
    async fn get_completion_marker(&self, key: &str) -> StorageResult<Option<CompletionMarker>> {
        self.inner.get_completion_marker(key).await
    }
    async fn try_acquire_lease(&self, lease: TaskLease, now: DateTime<Utc>) -> StorageResult<bool> {
        self.inner.try_acquire_lease(lease, now).await
    }
    async fn release_lease(&self, task_id: &TaskId, owner: &str) -> StorageResult<()> {
        self.inner.release_lease(task_id, owner).await
    }
}

#[async_trait]
impl ContextStore for FlakyStore {
    async fn put_context(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        self.inner.put_context(data).await
    }
    async fn get_context(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        self.inner.get_context(digest).await
    }
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn log_event(&self, event: EventRecord) -> StorageResult<()> {
        self.inner.log_event(event).await
    }
    async fn list_events(&self, task_id: &TaskId) -> StorageResult<Vec<EventRecord>> {
        self.inner.list_events(task_id).await
    }
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub engine: DebateEngine,
    pub store: Arc<FlakyStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub executor: Arc<ScriptedExecutor>,
}

/// Engine over in-memory backends with workers running.
pub fn harness(config: EngineConfig, executor: ScriptedExecutor) -> Harness {
    let store = Arc::new(FlakyStore::new());
    let queue = Arc::new(
        MemoryJobQueue::new().with_max_depth(ANALYSIS_STREAM, config.queue.max_depth),
    );
    let executor = Arc::new(executor);
    let mut engine = DebateEngine::new(
        store.clone(),
        queue.clone(),
        executor.clone(),
        config,
    )
    .expect("valid config");
    engine.start_workers();
    Harness {
        engine,
        store,
        queue,
        executor,
    }
}

/// Parse the round context an agent received.
pub fn context_of(request: &AgentRequest) -> serde_json::Value {
    serde_json::from_slice(&request.context).expect("context is JSON")
}
