//! Task state machine.
//!
//! The [`Coordinator`] is the only writer of task status. It creates tasks,
//! drives the round loop through the [`Dispatcher`], scores rounds with the
//! [`ConsensusEngine`] and applies the human decisions that follow. Every
//! status write is a compare-and-set against the status the coordinator last
//! read, so a concurrent writer surfaces as a conflict instead of a lost
//! update.

mod context;
mod debate;
mod round;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use debate_state::{
    AgentRunStatus, Complexity, ConsensusRecord, DebateStore, EscalationReason, EventKind,
    EventRecord, RoundStatus, StorageError, TaskRecord, TaskStatus,
};

use crate::config::{EngineConfig, RoundPolicy};
use crate::consensus::ConsensusEngine;
use crate::dispatch::Dispatcher;
use crate::domain::lifecycle::transition;
use crate::domain::slug::{disambiguate, slugify};
use crate::error::{DebateError, Result};
use crate::obs;
use crate::retry::with_retry;
use crate::triage::TriageClassifier;

pub use context::{PeerReview, RoundContext};

/// Input to [`Coordinator::start`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Files the caller expects to touch, if known.
    #[serde(default)]
    pub change_estimate: Option<u32>,
    /// Run the explorer role before scoping.
    #[serde(default)]
    pub explore: bool,
}

impl TaskRequest {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    fn triage_text(&self) -> String {
        if self.description.trim().is_empty() {
            self.title.clone()
        } else {
            format!("{}\n{}", self.title, self.description)
        }
    }
}

/// A human decision on a plan awaiting approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    /// Send the plan back for another round.
    Revise,
    Reject,
}

/// What a caller needs to know to act on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_slug: String,
    pub status: TaskStatus,
    pub current_round: u32,
    pub max_rounds: u32,
    pub complexity: Option<Complexity>,
    pub last_consensus_score: Option<f64>,
    pub pending_escalation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<EscalationReason>,
}

impl From<&TaskRecord> for TaskStatusView {
    fn from(task: &TaskRecord) -> Self {
        Self {
            task_slug: task.slug.clone(),
            status: task.status,
            current_round: task.current_round,
            max_rounds: task.max_rounds,
            complexity: task.complexity,
            last_consensus_score: task.last_consensus_score,
            pending_escalation: task.pending_escalation,
            escalation_reason: task.escalation_reason,
        }
    }
}

pub struct Coordinator {
    store: Arc<dyn DebateStore>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<EngineConfig>,
    triage: TriageClassifier,
    consensus: ConsensusEngine,
    /// Lease owner id of this instance.
    owner: String,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn DebateStore>,
        dispatcher: Arc<Dispatcher>,
        config: Arc<EngineConfig>,
    ) -> Result<Self> {
        Ok(Self {
            triage: TriageClassifier::new()?,
            consensus: ConsensusEngine::new(&config.consensus),
            owner: format!("coordinator-{}", Uuid::new_v4().simple()),
            store,
            dispatcher,
            config,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Round policy for the task's routed tier, with its own round budget.
    fn policy_for(&self, task: &TaskRecord) -> RoundPolicy {
        let base = self
            .config
            .round_policy(task.complexity.unwrap_or(Complexity::Standard));
        RoundPolicy {
            max_rounds: task.max_rounds.max(1),
            ..base
        }
    }

    async fn load(&self, slug: &str) -> Result<TaskRecord> {
        with_retry(&self.config.storage_retry, "find_task_by_slug", || {
            self.store.find_task_by_slug(slug)
        })
        .await?
        .ok_or_else(|| DebateError::TaskNotFound(slug.to_string()))
    }

    async fn reload(&self, task: &TaskRecord) -> Result<TaskRecord> {
        Ok(with_retry(&self.config.storage_retry, "get_task", || {
            self.store.get_task(&task.id)
        })
        .await?)
    }

    /// Write `task`, expecting the stored status to be `expected`.
    async fn save(&self, task: &TaskRecord, expected: TaskStatus) -> Result<()> {
        with_retry(&self.config.storage_retry, "update_task", || {
            self.store.update_task(task, expected)
        })
        .await?;
        Ok(())
    }

    async fn log(&self, event: EventRecord) {
        obs::persist(self.store.as_ref(), event).await;
    }

    /// Transition and persist in one step.
    ///
    /// Cancel flags are dropped once no run can start for the task until a
    /// human acts.
    async fn move_to(&self, task: &mut TaskRecord, to: TaskStatus) -> Result<()> {
        let from = transition(task, to)?;
        self.save(task, from).await?;
        obs::emit_task_transition(task.id.as_str(), from, to);
        self.log(obs::transition_event(&task.id, from, to)).await;
        if to == TaskStatus::AwaitingApproval || to.is_terminal() {
            self.dispatcher.cancels().clear(&task.id);
        }
        Ok(())
    }

    fn require(task: &TaskRecord, status: TaskStatus, action: &str) -> Result<()> {
        if task.status == status {
            return Ok(());
        }
        Err(DebateError::Precondition {
            task_id: task.id.0.clone(),
            status: task.status,
            detail: format!("{action} requires status {status}"),
        })
    }

    /// Create a task, triage it, optionally explore and move it to `scoping`.
    ///
    /// Tasks routed `trivial` skip exploration.
    #[instrument(skip(self, request), fields(title = %request.title))]
    pub async fn start(&self, request: TaskRequest) -> Result<TaskRecord> {
        let retry = &self.config.storage_retry;
        let base = slugify(&request.title);

        let mut task = None;
        for _ in 0..3 {
            let existing = with_retry(retry, "list_tasks", || self.store.list_tasks()).await?;
            let taken: HashSet<String> = existing.into_iter().map(|t| t.slug).collect();
            let slug = disambiguate(&base, |s| taken.contains(s));
            let record = TaskRecord::new(slug, &request.title, &request.description);
            match with_retry(retry, "create_task", || self.store.create_task(record.clone())).await {
                Ok(created) => {
                    task = Some(created);
                    break;
                }
                // Lost a race for the slug; pick again.
                Err(StorageError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let mut task = task.ok_or_else(|| DebateError::Precondition {
            task_id: String::new(),
            status: TaskStatus::Created,
            detail: format!("no free slug for {base:?}"),
        })?;
        obs::emit_task_created(task.id.as_str(), &task.slug);
        self.log(EventRecord::new(
            task.id.clone(),
            EventKind::TaskCreated,
            format!("created as {}", task.slug),
        ))
        .await;

        let verdict = self
            .triage
            .classify(&request.triage_text(), request.change_estimate);
        let shadow = self.config.triage.shadow_mode;
        let routed = if shadow {
            Complexity::Standard
        } else {
            verdict.complexity
        };
        obs::emit_triage_classified(task.id.as_str(), &verdict, routed, shadow);

        task.triage = Some(verdict.snapshot(shadow));
        task.complexity = Some(routed);
        task.max_rounds = self.config.round_policy(routed).max_rounds;

        // Fast-tracked tasks get their single round and nothing before it.
        let explore = request.explore || self.config.rounds.explore;
        if explore && routed != Complexity::Trivial {
            self.move_to(&mut task, TaskStatus::Exploring).await?;
            task.exploration_context = self.explore(&task).await?;
        }

        self.move_to(&mut task, TaskStatus::Scoping).await?;
        Ok(task)
    }

    /// Accept, send back or reject a plan awaiting approval.
    #[instrument(skip(self))]
    pub async fn record_approval(
        &self,
        slug: &str,
        decision: ApprovalDecision,
    ) -> Result<TaskStatusView> {
        let mut task = self.load(slug).await?;
        Self::require(&task, TaskStatus::AwaitingApproval, "approval")?;

        match decision {
            ApprovalDecision::Approve => {
                task.pending_escalation = false;
                self.move_to(&mut task, TaskStatus::Implementing).await?;
            }
            ApprovalDecision::Revise => {
                if task.complexity == Some(Complexity::Trivial) {
                    task.complexity = Some(Complexity::Standard);
                }
                if task.current_round >= task.max_rounds {
                    task.max_rounds = task.current_round + 1;
                }
                task.pending_escalation = false;
                task.escalation_reason = None;
                task.last_consensus_score = None;
                task.debate_started_at = Some(chrono::Utc::now());
                self.move_to(&mut task, TaskStatus::Analyzing).await?;
            }
            ApprovalDecision::Reject => {
                self.move_to(&mut task, TaskStatus::Cancelled).await?;
            }
        }
        Ok(TaskStatusView::from(&task))
    }

    /// Report the outcome of implementing an approved plan.
    #[instrument(skip(self, notes))]
    pub async fn record_implementation_result(
        &self,
        slug: &str,
        success: bool,
        notes: Option<String>,
    ) -> Result<TaskStatusView> {
        let mut task = self.load(slug).await?;
        Self::require(&task, TaskStatus::Implementing, "implementation result")?;

        task.implementation_notes = notes.clone();
        if success {
            self.move_to(&mut task, TaskStatus::Verifying).await?;
        } else {
            task.failure_reason =
                Some(notes.unwrap_or_else(|| "implementation failed".to_string()));
            self.move_to(&mut task, TaskStatus::Failed).await?;
        }
        Ok(TaskStatusView::from(&task))
    }

    /// Report verification; a failed check sends the task back to implementing.
    #[instrument(skip(self))]
    pub async fn record_verification(&self, slug: &str, passed: bool) -> Result<TaskStatusView> {
        let mut task = self.load(slug).await?;
        Self::require(&task, TaskStatus::Verifying, "verification")?;

        let to = if passed {
            TaskStatus::Completed
        } else {
            TaskStatus::Implementing
        };
        self.move_to(&mut task, to).await?;
        Ok(TaskStatusView::from(&task))
    }

    /// Cancel a task and every unfinished run of its active round.
    ///
    /// Findings already written are kept.
    #[instrument(skip(self))]
    pub async fn cancel(&self, slug: &str) -> Result<TaskStatusView> {
        let retry = &self.config.storage_retry;
        let mut task = self.load(slug).await?;
        if task.status.is_terminal() {
            return Err(DebateError::Precondition {
                task_id: task.id.0.clone(),
                status: task.status,
                detail: "task already finished".into(),
            });
        }

        self.dispatcher.cancels().cancel(&task.id);

        let round = with_retry(retry, "find_round", || {
            self.store.find_round(&task.id, task.current_round)
        })
        .await?;
        if let Some(mut round) = round.filter(|r| r.status == RoundStatus::InProgress) {
            let runs =
                with_retry(retry, "list_agent_runs", || self.store.list_agent_runs(&round.id))
                    .await?;
            for run in runs.iter().filter(|r| !r.status.is_terminal()) {
                self.dispatcher
                    .settle_without_output(run, AgentRunStatus::Cancelled, "task cancelled")
                    .await?;
            }
            round.status = RoundStatus::Cancelled;
            round.completed_at = Some(chrono::Utc::now());
            with_retry(retry, "update_round", || self.store.update_round(&round)).await?;
        }

        // A coordinator driving the task may move it under us.
        for _ in 0..3 {
            match self.move_to(&mut task, TaskStatus::Cancelled).await {
                Ok(()) => break,
                Err(DebateError::Storage(StorageError::Conflict { .. })) => {
                    task = self.reload(&task).await?;
                    if task.status == TaskStatus::Cancelled {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(TaskStatusView::from(&task))
    }

    pub async fn status(&self, slug: &str) -> Result<TaskStatusView> {
        let task = self.load(slug).await?;
        Ok(TaskStatusView::from(&task))
    }

    pub async fn task(&self, slug: &str) -> Result<TaskRecord> {
        self.load(slug).await
    }

    /// All tasks, newest first.
    pub async fn list(&self) -> Result<Vec<TaskStatusView>> {
        let tasks =
            with_retry(&self.config.storage_retry, "list_tasks", || self.store.list_tasks())
                .await?;
        Ok(tasks.iter().map(TaskStatusView::from).collect())
    }

    /// The task's persisted event log, oldest first.
    pub async fn events(&self, slug: &str) -> Result<Vec<EventRecord>> {
        let task = self.load(slug).await?;
        Ok(with_retry(&self.config.storage_retry, "list_events", || {
            self.store.list_events(&task.id)
        })
        .await?)
    }

    /// Consensus results of a task's rounds, oldest first.
    pub async fn consensus_history(&self, slug: &str) -> Result<Vec<ConsensusRecord>> {
        let retry = &self.config.storage_retry;
        let task = self.load(slug).await?;
        let rounds =
            with_retry(retry, "list_rounds", || self.store.list_rounds(&task.id)).await?;
        let mut history = Vec::new();
        for round in rounds {
            if let Some(record) =
                with_retry(retry, "get_consensus", || self.store.get_consensus(&round.id)).await?
            {
                history.push(record);
            }
        }
        Ok(history)
    }
}
