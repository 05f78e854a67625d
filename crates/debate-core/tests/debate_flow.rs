//! End-to-end debates over in-memory backends with real workers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::{context_of, harness, reply, reply_with_agreements, test_config, ScriptedExecutor, Step};
use debate_core::{ApprovalDecision, DebateError, TaskRequest};
use debate_state::{
    AgentRunStatus, ClaimStore, Complexity, Decision, EscalationReason, EventKind, Role,
    RoundStatus, RoundStore, Severity, TaskLease, TaskStatus,
};

fn agreeing_reply() -> Step {
    Step::Reply(reply_with_agreements(
        &[("security", "auth/token.rs", Severity::High)],
        &["rotate signing keys on refresh"],
        &["refresh tokens must be single use"],
    ))
}

fn converging() -> ScriptedExecutor {
    ScriptedExecutor::new()
        .script(Role::PlannerPrimary, vec![agreeing_reply()])
        .script(Role::PlannerSecondary, vec![agreeing_reply()])
}

fn diverging() -> ScriptedExecutor {
    ScriptedExecutor::new()
        .script(
            Role::PlannerPrimary,
            vec![Step::Reply(reply(
                &[
                    ("security", "auth.go", Severity::High),
                    ("performance", "auth.go", Severity::Medium),
                ],
                &["cache token lookups"],
            ))],
        )
        .script(
            Role::PlannerSecondary,
            vec![Step::Reply(reply(
                &[
                    ("security", "session.go", Severity::High),
                    ("architecture", "auth.go", Severity::Low),
                ],
                &["split session handling"],
            ))],
        )
}

fn request() -> TaskRequest {
    TaskRequest {
        title: "Fix token refresh".into(),
        description: "Refresh tokens can be replayed after logout.".into(),
        ..TaskRequest::default()
    }
}

#[tokio::test(start_paused = true)]
async fn converging_debate_runs_to_completion() {
    let h = harness(test_config(), converging());
    let coordinator = h.engine.coordinator();

    let task = coordinator.start(request()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Scoping);
    assert_eq!(task.slug, "fix-token-refresh");
    // Shadow mode records the verdict but routes as standard.
    assert_eq!(task.complexity, Some(Complexity::Standard));
    assert!(task.triage.as_ref().unwrap().shadow);

    let view = coordinator.run_debate(&task.slug).await.unwrap();
    assert_eq!(view.status, TaskStatus::AwaitingApproval);
    assert_eq!(view.current_round, 1);
    assert!((view.last_consensus_score.unwrap() - 100.0).abs() < 1e-9);
    assert!(!view.pending_escalation);

    let history = coordinator.consensus_history(&task.slug).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].decision, Decision::ProceedToApproval);
    assert_eq!(history[0].agreed_items, vec!["rotate signing keys on refresh"]);

    let view = coordinator
        .record_approval(&task.slug, ApprovalDecision::Approve)
        .await
        .unwrap();
    assert_eq!(view.status, TaskStatus::Implementing);
    let view = coordinator
        .record_implementation_result(&task.slug, true, Some("patched refresh flow".into()))
        .await
        .unwrap();
    assert_eq!(view.status, TaskStatus::Verifying);
    let view = coordinator
        .record_verification(&task.slug, true)
        .await
        .unwrap();
    assert_eq!(view.status, TaskStatus::Completed);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn low_agreement_escalates_when_rounds_run_out() {
    let h = harness(test_config(), diverging());
    let coordinator = h.engine.coordinator();
    let task = coordinator.start(request()).await.unwrap();

    let view = coordinator.run_debate(&task.slug).await.unwrap();

    assert_eq!(view.status, TaskStatus::AwaitingApproval);
    assert_eq!(view.current_round, 2);
    assert!(view.pending_escalation);
    assert_eq!(
        view.escalation_reason,
        Some(EscalationReason::RoundBudgetExhausted)
    );

    let history = coordinator.consensus_history(&task.slug).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].decision, Decision::ContinueDebate);
    assert_eq!(history[1].decision, Decision::Escalate);
    assert!(history.iter().all(|r| (r.score - 38.333_333).abs() < 1e-3));
    // The synthesis handed to the human carries both sides' recommendations.
    assert_eq!(
        history[1].agreed_items,
        vec!["cache token lookups", "split session handling"]
    );

    // Round two sees the first round's output for cross-review.
    let second_round: Vec<_> = h
        .executor
        .calls()
        .into_iter()
        .filter(|c| c.round_number == 2)
        .collect();
    assert_eq!(second_round.len(), 2);
    for call in &second_round {
        let context = context_of(call);
        assert_eq!(context["previous_round"].as_array().unwrap().len(), 2);
    }
    let first_round = h
        .executor
        .calls()
        .into_iter()
        .find(|c| c.round_number == 1)
        .unwrap();
    assert!(context_of(&first_round).get("previous_round").is_none());

    // Sending the plan back buys one more round.
    let view = coordinator
        .record_approval(&task.slug, ApprovalDecision::Revise)
        .await
        .unwrap();
    assert_eq!(view.status, TaskStatus::Analyzing);
    assert_eq!(view.max_rounds, 3);
    assert!(!view.pending_escalation);

    let view = coordinator.run_debate(&task.slug).await.unwrap();
    assert_eq!(view.current_round, 3);
    assert_eq!(
        view.escalation_reason,
        Some(EscalationReason::RoundBudgetExhausted)
    );

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn trivial_task_takes_the_fast_track() {
    let mut config = test_config();
    config.triage.shadow_mode = false;
    let h = harness(config, converging());
    let coordinator = h.engine.coordinator();

    let task = coordinator
        .start(TaskRequest::new("Fix typo in README.md"))
        .await
        .unwrap();
    assert_eq!(task.complexity, Some(Complexity::Trivial));
    assert_eq!(task.max_rounds, 1);

    let view = coordinator.run_debate(&task.slug).await.unwrap();
    assert_eq!(view.status, TaskStatus::AwaitingApproval);
    assert_eq!(view.last_consensus_score, None);

    let history = coordinator.consensus_history(&task.slug).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].fast_track);
    assert_eq!(history[0].decision, Decision::ProceedToApproval);
    assert_eq!(h.executor.calls_for(Role::PlannerPrimary), 1);
    assert_eq!(h.executor.calls_for(Role::PlannerSecondary), 0);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn trivial_task_skips_exploration() {
    let mut config = test_config();
    config.triage.shadow_mode = false;
    let executor = converging().script(
        Role::Explorer,
        vec![Step::Reply(reply(&[("context", "README.md", Severity::Info)], &[]))],
    );
    let h = harness(config, executor);
    let coordinator = h.engine.coordinator();

    let task = coordinator
        .start(TaskRequest {
            explore: true,
            ..TaskRequest::new("Fix typo in README.md")
        })
        .await
        .unwrap();
    assert_eq!(task.complexity, Some(Complexity::Trivial));
    assert!(task.exploration_context.is_none());

    let view = coordinator.run_debate(&task.slug).await.unwrap();
    assert_eq!(view.status, TaskStatus::AwaitingApproval);
    let rounds: Vec<u32> = h
        .store
        .list_rounds(&task.id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.round_number)
        .collect();
    assert_eq!(rounds, vec![1]);
    assert_eq!(h.executor.calls_for(Role::Explorer), 0);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn round_deadline_stops_hung_runs() {
    let mut config = test_config();
    config.timeouts.agent_secs = 600;
    config.timeouts.round_secs = 10;
    let executor = ScriptedExecutor::new()
        .script(Role::PlannerPrimary, vec![Step::Hang])
        .script(Role::PlannerSecondary, vec![Step::Hang]);
    let h = harness(config, executor);
    let coordinator = h.engine.coordinator();
    let task = coordinator.start(request()).await.unwrap();
    let started = tokio::time::Instant::now();

    let view = coordinator.run_debate(&task.slug).await.unwrap();

    assert_eq!(view.status, TaskStatus::AwaitingApproval);
    assert!(view.pending_escalation);
    assert_eq!(view.escalation_reason, Some(EscalationReason::AllRunsFailed));
    let round = h.store.find_round(&task.id, 1).await.unwrap().unwrap();
    for run in h.store.list_agent_runs(&round.id).await.unwrap() {
        assert_eq!(run.status, AgentRunStatus::Timeout);
        assert_eq!(run.error.as_deref(), Some("round deadline elapsed"));
    }

    // The executor calls are dropped at the round deadline, long before
    // their own timeout, and no cancel flags are left behind.
    let cancels = h.engine.dispatcher().cancels();
    tokio::time::timeout(Duration::from_secs(1), async {
        while h.executor.abandoned() < 2 || cancels.tracked() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("hung executions are dropped");
    assert!(started.elapsed() < Duration::from_secs(600));
    assert_eq!(h.executor.calls().len(), 2);

    let kinds: Vec<EventKind> = coordinator
        .events(&task.slug)
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::AgentTimeout).count(), 2);
    assert!(kinds.contains(&EventKind::EscalationRaised));

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn debate_writes_an_event_log() {
    let h = harness(test_config(), converging());
    let coordinator = h.engine.coordinator();
    let task = coordinator.start(request()).await.unwrap();

    coordinator.run_debate(&task.slug).await.unwrap();

    let events = coordinator.events(&task.slug).await.unwrap();
    let count = |kind: EventKind| events.iter().filter(|e| e.kind == kind).count();
    assert_eq!(events[0].kind, EventKind::TaskCreated);
    assert_eq!(count(EventKind::AgentStarted), 2);
    assert_eq!(count(EventKind::AgentCompleted), 2);
    assert_eq!(count(EventKind::ConsensusScored), 1);
    let scored = events
        .iter()
        .find(|e| e.kind == EventKind::ConsensusScored)
        .unwrap();
    assert_eq!(scored.round_number, Some(1));
    assert_eq!(scored.details["decision"], "proceed_to_approval");
    let completed = events
        .iter()
        .find(|e| e.kind == EventKind::AgentCompleted)
        .unwrap();
    assert!(completed.role.is_some());
    assert!(completed.duration_ms.is_some());

    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::TaskTransition);
    assert_eq!(last.details["to"], "awaiting_approval");

    // Nothing is left to cancel once a human has to act.
    assert_eq!(h.engine.dispatcher().cancels().tracked(), 0);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn round_without_output_escalates() {
    let executor = ScriptedExecutor::new()
        .script(Role::PlannerPrimary, vec![Step::Permanent])
        .script(Role::PlannerSecondary, vec![Step::Permanent]);
    let h = harness(test_config(), executor);
    let coordinator = h.engine.coordinator();
    let task = coordinator.start(request()).await.unwrap();

    let view = coordinator.run_debate(&task.slug).await.unwrap();

    assert_eq!(view.status, TaskStatus::AwaitingApproval);
    assert_eq!(view.escalation_reason, Some(EscalationReason::AllRunsFailed));
    let round = h
        .store
        .find_round(&task.id, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(round.status, RoundStatus::Failed);
    let history = coordinator.consensus_history(&task.slug).await.unwrap();
    assert!(!history[0].comparable);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn one_failed_role_is_insufficient_data() {
    let executor = ScriptedExecutor::new()
        .script(Role::PlannerPrimary, vec![agreeing_reply()])
        .script(Role::PlannerSecondary, vec![Step::Permanent]);
    let h = harness(test_config(), executor);
    let coordinator = h.engine.coordinator();
    let task = coordinator.start(request()).await.unwrap();

    let view = coordinator.run_debate(&task.slug).await.unwrap();

    assert_eq!(
        view.escalation_reason,
        Some(EscalationReason::InsufficientData)
    );
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_running_agents() {
    let executor = ScriptedExecutor::new()
        .script(Role::PlannerPrimary, vec![Step::Hang])
        .script(Role::PlannerSecondary, vec![Step::Hang]);
    let h = harness(test_config(), executor);
    let engine = Arc::new(h.engine);
    let task = engine.coordinator().start(request()).await.unwrap();

    let debate = {
        let engine = Arc::clone(&engine);
        let slug = task.slug.clone();
        tokio::spawn(async move { engine.coordinator().run_debate(&slug).await })
    };
    while h.executor.calls().len() < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let view = engine.coordinator().cancel(&task.slug).await.unwrap();
    assert_eq!(view.status, TaskStatus::Cancelled);

    debate.await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(1), async {
        while h.executor.abandoned() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("hung executions are dropped");

    let stored = engine.coordinator().status(&task.slug).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Cancelled);
    let round = h.store.find_round(&task.id, 1).await.unwrap().unwrap();
    for run in h.store.list_agent_runs(&round.id).await.unwrap() {
        assert_eq!(run.status, AgentRunStatus::Cancelled);
    }
    let err = engine.coordinator().cancel(&task.slug).await.unwrap_err();
    assert!(matches!(err, DebateError::Precondition { .. }));
}

#[tokio::test(start_paused = true)]
async fn storage_outage_checkpoints_and_resume_finishes_the_round() {
    let h = harness(test_config(), converging());
    let coordinator = h.engine.coordinator();
    let task = coordinator.start(request()).await.unwrap();

    // Outlasts the storage retry budget while the round is being scored.
    h.store.fail_consensus_reads(2);
    let err = coordinator.run_debate(&task.slug).await.unwrap_err();
    assert!(err.is_infrastructure());

    let failed = coordinator.task(&task.slug).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    let checkpoint = failed.checkpoint.expect("checkpoint");
    assert_eq!(checkpoint.status, TaskStatus::Consensus);
    assert_eq!(checkpoint.current_round, 1);

    let view = coordinator.resume(&task.slug).await.unwrap();
    assert_eq!(view.status, TaskStatus::AwaitingApproval);
    assert_eq!(view.current_round, 1);

    // Finished agent work was reused, and the round was scored once.
    assert_eq!(h.executor.calls_for(Role::PlannerPrimary), 1);
    assert_eq!(h.executor.calls_for(Role::PlannerSecondary), 1);
    assert_eq!(coordinator.consensus_history(&task.slug).await.unwrap().len(), 1);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exploration_feeds_the_first_round() {
    let executor = converging().script(
        Role::Explorer,
        vec![Step::Reply(reply(
            &[("context", "auth/token.rs", Severity::Info)],
            &["token store lives in auth/token.rs"],
        ))],
    );
    let h = harness(test_config(), executor);
    let coordinator = h.engine.coordinator();

    let task = coordinator
        .start(TaskRequest {
            explore: true,
            ..request()
        })
        .await
        .unwrap();
    assert!(task.exploration_context.is_some());
    assert_eq!(task.status, TaskStatus::Scoping);

    coordinator.run_debate(&task.slug).await.unwrap();

    let planner = h
        .executor
        .calls()
        .into_iter()
        .find(|c| c.role == Role::PlannerPrimary)
        .unwrap();
    let context = context_of(&planner);
    assert_eq!(context["exploration"]["role"], "explorer");
    assert_eq!(
        context["exploration"]["recommendations"][0],
        "token store lives in auth/token.rs"
    );
    // Exploration is not a scored round.
    assert_eq!(coordinator.consensus_history(&task.slug).await.unwrap().len(), 1);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn debate_needs_the_task_lease() {
    let h = harness(test_config(), converging());
    let coordinator = h.engine.coordinator();
    let task = coordinator.start(request()).await.unwrap();

    let now = Utc::now();
    let taken = h
        .store
        .try_acquire_lease(
            TaskLease::new(task.id.clone(), "coordinator-other", now, chrono::Duration::hours(1)),
            now,
        )
        .await
        .unwrap();
    assert!(taken);

    let err = coordinator.run_debate(&task.slug).await.unwrap_err();
    assert!(matches!(err, DebateError::LeaseHeld { .. }));
    assert_eq!(
        coordinator.status(&task.slug).await.unwrap().status,
        TaskStatus::Scoping
    );

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_titles_get_distinct_slugs() {
    let h = harness(test_config(), converging());
    let coordinator = h.engine.coordinator();

    let first = coordinator.start(request()).await.unwrap();
    let second = coordinator.start(request()).await.unwrap();

    assert_eq!(first.slug, "fix-token-refresh");
    assert_eq!(second.slug, "fix-token-refresh-2");
    assert_eq!(coordinator.list().await.unwrap().len(), 2);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn approval_outside_awaiting_approval_is_rejected() {
    let h = harness(test_config(), converging());
    let coordinator = h.engine.coordinator();
    let task = coordinator.start(request()).await.unwrap();

    let err = coordinator
        .record_approval(&task.slug, ApprovalDecision::Approve)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DebateError::Precondition {
            status: TaskStatus::Scoping,
            ..
        }
    ));

    let err = coordinator.status("no-such-task").await.unwrap_err();
    assert!(matches!(err, DebateError::TaskNotFound(_)));

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_plan_is_cancelled() {
    let h = harness(test_config(), converging());
    let coordinator = h.engine.coordinator();
    let task = coordinator.start(request()).await.unwrap();
    coordinator.run_debate(&task.slug).await.unwrap();

    let view = coordinator
        .record_approval(&task.slug, ApprovalDecision::Reject)
        .await
        .unwrap();

    assert_eq!(view.status, TaskStatus::Cancelled);
    h.engine.shutdown().await;
}
