//! Persisted entities of a debate: tasks, rounds, agent runs, findings,
//! consensus results, claims and leases.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::storage_traits::{
    AgentRunId, ConsensusId, ContentDigest, EventId, FindingId, RoundId, TaskId,
};

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Exploring,
    Scoping,
    Analyzing,
    Consensus,
    AwaitingApproval,
    Implementing,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Exploring => "exploring",
            TaskStatus::Scoping => "scoping",
            TaskStatus::Analyzing => "analyzing",
            TaskStatus::Consensus => "consensus",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Implementing => "implementing",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing tier assigned by triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Standard,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Trivial => "trivial",
            Complexity::Standard => "standard",
            Complexity::Complex => "complex",
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::InProgress => "in_progress",
            RoundStatus::Completed => "completed",
            RoundStatus::Failed => "failed",
            RoundStatus::Cancelled => "cancelled",
        }
    }
}

/// Status of a single agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl AgentRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRunStatus::Scheduled => "scheduled",
            AgentRunStatus::Running => "running",
            AgentRunStatus::Completed => "completed",
            AgentRunStatus::Failed => "failed",
            AgentRunStatus::Timeout => "timeout",
            AgentRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AgentRunStatus::Scheduled | AgentRunStatus::Running)
    }
}

impl std::fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent role within a debate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    PlannerPrimary,
    PlannerSecondary,
    Implementer,
    Reviewer,
    Explorer,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::PlannerPrimary,
        Role::PlannerSecondary,
        Role::Implementer,
        Role::Reviewer,
        Role::Explorer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::PlannerPrimary => "planner_primary",
            Role::PlannerSecondary => "planner_secondary",
            Role::Implementer => "implementer",
            Role::Reviewer => "reviewer",
            Role::Explorer => "explorer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown role: {s}"))
    }
}

/// Finding severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    Agree,
    Disagree,
}

/// An explicit agree/disagree statement about a topic raised in the debate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgreementRef {
    pub topic: String,
    pub stance: Stance,
}

/// Outcome of a consensus evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    ContinueDebate,
    ProceedToApproval,
    Escalate,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::ContinueDebate => "continue_debate",
            Decision::ProceedToApproval => "proceed_to_approval",
            Decision::Escalate => "escalate",
        }
    }
}

/// Why a debate was handed to a human before reaching the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// Round budget spent without reaching the threshold.
    RoundBudgetExhausted,
    /// Score improved by less than the configured delta.
    Stagnation,
    /// Score dropped compared to the previous round.
    Regression,
    /// Fewer than two participants produced comparable output.
    InsufficientData,
    /// No agent run of the round completed.
    AllRunsFailed,
    /// The whole-debate deadline elapsed.
    DebateDeadline,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationReason::RoundBudgetExhausted => "round_budget_exhausted",
            EscalationReason::Stagnation => "stagnation",
            EscalationReason::Regression => "regression",
            EscalationReason::InsufficientData => "insufficient_data",
            EscalationReason::AllRunsFailed => "all_runs_failed",
            EscalationReason::DebateDeadline => "debate_deadline",
        }
    }
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four signals blended into a consensus score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusFactor {
    Category,
    FilePath,
    Severity,
    Explicit,
}

impl ConsensusFactor {
    pub const ALL: [ConsensusFactor; 4] = [
        ConsensusFactor::Category,
        ConsensusFactor::FilePath,
        ConsensusFactor::Severity,
        ConsensusFactor::Explicit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusFactor::Category => "category",
            ConsensusFactor::FilePath => "file_path",
            ConsensusFactor::Severity => "severity",
            ConsensusFactor::Explicit => "explicit",
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Snapshot taken before a task is moved to `Failed` so it can be resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub status: TaskStatus,
    pub current_round: u32,
    pub reason: String,
    pub taken_at: DateTime<Utc>,
}

/// Classifier output kept on the task for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageSnapshot {
    pub complexity: Complexity,
    pub confidence: f64,
    pub score: f64,
    pub reasons: Vec<String>,
    pub requires_confirmation: bool,
    /// Whether routing ignored the verdict.
    pub shadow: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Routing tier actually used for the debate.
    pub complexity: Option<Complexity>,
    pub triage: Option<TriageSnapshot>,
    pub current_round: u32,
    pub max_rounds: u32,
    pub last_consensus_score: Option<f64>,
    pub pending_escalation: bool,
    pub escalation_reason: Option<EscalationReason>,
    pub exploration_context: Option<ContentDigest>,
    pub implementation_notes: Option<String>,
    pub checkpoint: Option<TaskCheckpoint>,
    pub failure_reason: Option<String>,
    /// Start of the current debate window; reset when a plan is sent back.
    pub debate_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(slug: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            slug: slug.into(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Created,
            complexity: None,
            triage: None,
            current_round: 0,
            max_rounds: 0,
            last_consensus_score: None,
            pending_escalation: false,
            escalation_reason: None,
            exploration_context: None,
            implementation_notes: None,
            checkpoint: None,
            failure_reason: None,
            debate_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Round
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub id: RoundId,
    pub task_id: TaskId,
    pub round_number: u32,
    pub status: RoundStatus,
    pub context: Option<ContentDigest>,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RoundRecord {
    pub fn new(task_id: TaskId, round_number: u32, deadline: DateTime<Utc>) -> Self {
        Self {
            id: RoundId::new(),
            task_id,
            round_number,
            status: RoundStatus::InProgress,
            context: None,
            deadline,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent runs and findings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRunRecord {
    pub id: AgentRunId,
    pub task_id: TaskId,
    pub round_id: RoundId,
    pub round_number: u32,
    pub role: Role,
    pub model: String,
    pub status: AgentRunStatus,
    pub idempotency_key: String,
    /// Dispatch epoch the key was derived from.
    pub epoch: u32,
    /// Executions started so far.
    pub attempt: u32,
    pub raw_output: Option<String>,
    pub recommendations: Vec<String>,
    pub explicit_agreements: Vec<AgreementRef>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentRunRecord {
    pub fn scheduled(
        round: &RoundRecord,
        role: Role,
        model: impl Into<String>,
        idempotency_key: impl Into<String>,
        epoch: u32,
    ) -> Self {
        Self {
            id: AgentRunId::new(),
            task_id: round.task_id.clone(),
            round_id: round.id.clone(),
            round_number: round.round_number,
            role,
            model: model.into(),
            status: AgentRunStatus::Scheduled,
            idempotency_key: idempotency_key.into(),
            epoch,
            attempt: 0,
            raw_output: None,
            recommendations: Vec::new(),
            explicit_agreements: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingRecord {
    pub id: FindingId,
    pub run_id: AgentRunId,
    pub category: String,
    pub file_path: Option<String>,
    pub severity: Option<Severity>,
    pub description: String,
    pub agreement_refs: Vec<AgreementRef>,
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

/// One factor's contribution to the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
    pub factor: ConsensusFactor,
    /// Agreement on this factor, 0..=100.
    pub raw: f64,
    pub weight: f64,
    /// `raw * weight`; the contributions sum to the score.
    pub weighted: f64,
}

/// Items the participants did not agree on, per factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disagreement {
    pub factor: ConsensusFactor,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub id: ConsensusId,
    pub task_id: TaskId,
    pub round_id: RoundId,
    pub round_number: u32,
    pub score: f64,
    pub breakdown: Vec<FactorScore>,
    pub participants: Vec<Role>,
    pub comparable: bool,
    pub decision: Decision,
    pub escalation_reason: Option<EscalationReason>,
    pub disagreements: Vec<Disagreement>,
    pub agreed_items: Vec<String>,
    pub fast_track: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Kind of entry in a task's event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.transition")]
    TaskTransition,
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.completed")]
    AgentCompleted,
    #[serde(rename = "agent.failed")]
    AgentFailed,
    #[serde(rename = "agent.timeout")]
    AgentTimeout,
    #[serde(rename = "agent.cancelled")]
    AgentCancelled,
    #[serde(rename = "consensus.scored")]
    ConsensusScored,
    #[serde(rename = "escalation.raised")]
    EscalationRaised,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskCreated => "task.created",
            EventKind::TaskTransition => "task.transition",
            EventKind::AgentStarted => "agent.started",
            EventKind::AgentCompleted => "agent.completed",
            EventKind::AgentFailed => "agent.failed",
            EventKind::AgentTimeout => "agent.timeout",
            EventKind::AgentCancelled => "agent.cancelled",
            EventKind::ConsensusScored => "consensus.scored",
            EventKind::EscalationRaised => "escalation.raised",
        }
    }

    /// Event for a run that reached `status`; `None` while it is still live.
    pub fn for_settled_run(status: AgentRunStatus) -> Option<Self> {
        match status {
            AgentRunStatus::Completed => Some(EventKind::AgentCompleted),
            AgentRunStatus::Failed => Some(EventKind::AgentFailed),
            AgentRunStatus::Timeout => Some(EventKind::AgentTimeout),
            AgentRunStatus::Cancelled => Some(EventKind::AgentCancelled),
            AgentRunStatus::Scheduled | AgentRunStatus::Running => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only entry of a task's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub task_id: TaskId,
    pub kind: EventKind,
    pub round_number: Option<u32>,
    pub role: Option<Role>,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(task_id: TaskId, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            task_id,
            kind,
            round_number: None,
            role: None,
            message: message.into(),
            details: serde_json::Value::Null,
            duration_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn in_round(mut self, round_number: u32) -> Self {
        self.round_number = Some(round_number);
        self
    }

    pub fn for_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

// ---------------------------------------------------------------------------
// Claims, markers, leases
// ---------------------------------------------------------------------------

/// Exclusive right to execute one `(task, round, role)` slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub lock_key: String,
    pub idempotency_key: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ClaimRecord {
    pub fn lock_key(task_id: &TaskId, round_number: u32, role: Role) -> String {
        format!("{}:{}:{}", task_id, round_number, role)
    }

    pub fn new(
        lock_key: String,
        idempotency_key: impl Into<String>,
        owner: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            lock_key,
            idempotency_key: idempotency_key.into(),
            owner: owner.into(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Written once when an agent run's result has been durably persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub idempotency_key: String,
    pub run_id: AgentRunId,
    pub status: AgentRunStatus,
    pub completed_at: DateTime<Utc>,
}

/// Coordinator ownership of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLease {
    pub task_id: TaskId,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl TaskLease {
    pub fn new(task_id: TaskId, owner: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            task_id,
            owner: owner.into(),
            expires_at: now + ttl,
        }
    }
}
