//! Structured observability hooks for the debate lifecycle.
//!
//! Every emitter logs one `tracing` event with a stable `event` field, so
//! the JSON output of `telemetry::init_tracing` can be filtered on it:
//!
//! | event                | level |
//! |----------------------|-------|
//! | `task.created`       | info  |
//! | `task.transition`    | info  |
//! | `triage.classified`  | info  |
//! | `round.started`      | info  |
//! | `round.finished`     | info  |
//! | `run.dispatched`     | debug |
//! | `run.settled`        | info  |
//! | `run.retry`          | warn  |
//! | `run.dead_lettered`  | warn  |
//! | `consensus.scored`   | info  |
//! | `escalation.raised`  | warn  |
//! | `task.checkpointed`  | error |
//!
//! Lifecycle, agent, consensus and escalation events are also appended to
//! the task's persisted event log through [`persist`], which is what
//! `debate events <slug>` reads back.

use serde_json::json;
use tracing::{debug, error, info, warn};

use debate_state::{
    AgentRunRecord, AgentRunStatus, Complexity, Decision, DebateStore, EscalationReason,
    EventKind, EventRecord, Role, TaskId, TaskStatus,
};

use crate::consensus::ConsensusOutcome;
use crate::triage::TriageVerdict;

/// RAII guard that enters a task-scoped span.
///
/// Holds an entered span, so it must not be kept across an `.await` in a
/// spawned task; async code uses `#[instrument]` instead.
pub struct TaskSpan {
    _span: tracing::span::EnteredSpan,
}

impl TaskSpan {
    pub fn enter(task_slug: &str) -> Self {
        let span = tracing::info_span!("debate.task", task = %task_slug);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_task_created(task_id: &str, slug: &str) {
    info!(event = "task.created", task_id = %task_id, slug = %slug);
}

pub fn emit_task_transition(task_id: &str, from: TaskStatus, to: TaskStatus) {
    info!(
        event = "task.transition",
        task_id = %task_id,
        from = from.as_str(),
        to = to.as_str(),
    );
}

/// Triage verdict; `routed` is the tier actually used.
pub fn emit_triage_classified(task_id: &str, verdict: &TriageVerdict, routed: Complexity, shadow: bool) {
    info!(
        event = "triage.classified",
        task_id = %task_id,
        complexity = verdict.complexity.as_str(),
        routed = routed.as_str(),
        score = verdict.score,
        confidence = verdict.confidence,
        requires_confirmation = verdict.requires_confirmation,
        shadow = shadow,
    );
}

pub fn emit_round_started(task_id: &str, round_number: u32, roles: usize) {
    info!(event = "round.started", task_id = %task_id, round = round_number, roles = roles);
}

pub fn emit_round_finished(task_id: &str, round_number: u32, completed: usize, required: usize) {
    info!(
        event = "round.finished",
        task_id = %task_id,
        round = round_number,
        completed = completed,
        required = required,
    );
}

pub fn emit_run_dispatched(task_id: &str, round_number: u32, role: Role, key: &str) {
    debug!(
        event = "run.dispatched",
        task_id = %task_id,
        round = round_number,
        role = role.as_str(),
        idempotency_key = %key,
    );
}

pub fn emit_run_settled(task_id: &str, round_number: u32, role: Role, status: AgentRunStatus, attempt: u32) {
    info!(
        event = "run.settled",
        task_id = %task_id,
        round = round_number,
        role = role.as_str(),
        status = status.as_str(),
        attempt = attempt,
    );
}

pub fn emit_run_retry(task_id: &str, role: Role, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(
        event = "run.retry",
        task_id = %task_id,
        role = role.as_str(),
        attempt = attempt,
        error = %error,
    );
}

pub fn emit_run_dead_lettered(task_id: &str, role: Role, reason: &str) {
    warn!(event = "run.dead_lettered", task_id = %task_id, role = role.as_str(), reason = %reason);
}

pub fn emit_consensus_scored(task_id: &str, round_number: u32, outcome: &ConsensusOutcome, decision: Decision) {
    let weakest = outcome
        .weakest_factor()
        .map(|f| f.factor.as_str())
        .unwrap_or("none");
    info!(
        event = "consensus.scored",
        task_id = %task_id,
        round = round_number,
        score = outcome.score,
        comparable = outcome.comparable,
        weakest_factor = weakest,
        decision = decision.as_str(),
    );
}

pub fn emit_escalation(task_id: &str, round_number: u32, reason: EscalationReason) {
    warn!(event = "escalation.raised", task_id = %task_id, round = round_number, reason = reason.as_str());
}

pub fn emit_task_checkpointed(task_id: &str, status: TaskStatus, error: &dyn std::fmt::Display) {
    error!(
        event = "task.checkpointed",
        task_id = %task_id,
        status = status.as_str(),
        error = %error,
    );
}

/// Append `event` to its task's event log. A failed write is logged and dropped.
pub async fn persist(store: &dyn DebateStore, event: EventRecord) {
    let kind = event.kind;
    let task_id = event.task_id.clone();
    if let Err(e) = store.log_event(event).await {
        warn!(event = "event_log.dropped", task_id = %task_id, kind = kind.as_str(), error = %e);
    }
}

pub fn transition_event(task_id: &TaskId, from: TaskStatus, to: TaskStatus) -> EventRecord {
    EventRecord::new(
        task_id.clone(),
        EventKind::TaskTransition,
        format!("{from} -> {to}"),
    )
    .with_details(json!({ "from": from.as_str(), "to": to.as_str() }))
}

/// `agent.started` for a run that just moved to `running`.
pub fn run_started_event(run: &AgentRunRecord, agent: &str) -> EventRecord {
    EventRecord::new(
        run.task_id.clone(),
        EventKind::AgentStarted,
        format!("{} started on {agent}", run.role),
    )
    .in_round(run.round_number)
    .for_role(run.role)
    .with_details(json!({ "attempt": run.attempt, "agent": agent, "model": run.model }))
}

/// Terminal-status event for a settled run; `None` while it is still live.
pub fn run_settled_event(run: &AgentRunRecord) -> Option<EventRecord> {
    let kind = EventKind::for_settled_run(run.status)?;
    let message = match &run.error {
        Some(error) => format!("{} {}: {error}", run.role, run.status),
        None => format!("{} {}", run.role, run.status),
    };
    let mut event = EventRecord::new(run.task_id.clone(), kind, message)
        .in_round(run.round_number)
        .for_role(run.role)
        .with_details(json!({ "attempt": run.attempt, "model": run.model }));
    if let (Some(started), Some(finished)) = (run.started_at, run.finished_at) {
        if let Ok(elapsed) = (finished - started).to_std() {
            event = event.with_duration_ms(elapsed.as_millis() as u64);
        }
    }
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_event_carries_duration_and_error() {
        let round = debate_state::RoundRecord::new(
            TaskId("t".into()),
            2,
            chrono::Utc::now(),
        );
        let mut run =
            AgentRunRecord::scheduled(&round, Role::PlannerSecondary, "model-b", "k", 0);
        assert!(run_settled_event(&run).is_none());

        let started = chrono::Utc::now();
        run.status = AgentRunStatus::Timeout;
        run.attempt = 1;
        run.error = Some("round deadline elapsed".into());
        run.started_at = Some(started);
        run.finished_at = Some(started + chrono::Duration::milliseconds(1_500));

        let event = run_settled_event(&run).unwrap();
        assert_eq!(event.kind, EventKind::AgentTimeout);
        assert_eq!(event.round_number, Some(2));
        assert_eq!(event.role, Some(Role::PlannerSecondary));
        assert_eq!(event.duration_ms, Some(1_500));
        assert!(event.message.contains("round deadline elapsed"));
    }

    #[test]
    fn task_span_enters_without_subscriber() {
        let _span = TaskSpan::enter("fix-typo");
        emit_task_transition("t", TaskStatus::Created, TaskStatus::Scoping);
    }
}
