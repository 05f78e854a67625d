//! Dispatcher: idempotent enqueue and single-delivery processing.
//!
//! Workers are not started here; each test pulls deliveries itself and
//! hands them to `Dispatcher::process`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::{reply, test_config, ScriptedExecutor, Step};
use debate_core::{DebateError, Dispatcher, EngineConfig, ProcessOutcome};
use debate_state::{
    AgentRunStatus, ClaimRecord, ClaimStore, ContextStore, Delivery, JobQueue, MemoryDebateStore,
    MemoryJobQueue, Role, RoundRecord, RoundStore, Severity, TaskRecord, TaskStore,
    ANALYSIS_STREAM, DEAD_LETTER_STREAM, WORKER_GROUP,
};

const WORKER: &str = "worker-a";

struct Fixture {
    store: Arc<MemoryDebateStore>,
    queue: Arc<MemoryJobQueue>,
    executor: Arc<ScriptedExecutor>,
    dispatcher: Dispatcher,
    task: TaskRecord,
    round: RoundRecord,
}

async fn fixture_with(config: EngineConfig, executor: ScriptedExecutor) -> Fixture {
    let store = Arc::new(MemoryDebateStore::new());
    let queue = Arc::new(
        MemoryJobQueue::new().with_max_depth(ANALYSIS_STREAM, config.queue.max_depth),
    );
    let executor = Arc::new(executor);
    let dispatcher = Dispatcher::new(
        store.clone(),
        queue.clone(),
        executor.clone(),
        Arc::new(config),
    );

    let task = store
        .create_task(TaskRecord::new("fix-auth", "Fix auth", "Token refresh is broken"))
        .await
        .unwrap();
    let digest = store
        .put_context(br#"{"title":"Fix auth"}"#)
        .await
        .unwrap();
    let mut round = RoundRecord::new(task.id.clone(), 1, Utc::now() + chrono::Duration::minutes(10));
    round.context = Some(digest);
    let round = store.create_round(round).await.unwrap();

    Fixture {
        store,
        queue,
        executor,
        dispatcher,
        task,
        round,
    }
}

async fn fixture(executor: ScriptedExecutor) -> Fixture {
    fixture_with(test_config(), executor).await
}

fn answering(role: Role) -> ScriptedExecutor {
    ScriptedExecutor::new().script(
        role,
        vec![Step::Reply(reply(
            &[("security", "auth.go", Severity::High)],
            &["rotate keys"],
        ))],
    )
}

impl Fixture {
    async fn enqueue(&self, role: Role) -> String {
        self.dispatcher
            .enqueue(&self.task.id, 1, role, 0)
            .await
            .unwrap()
    }

    async fn deliveries(&self) -> Vec<Delivery> {
        self.queue
            .read_group(ANALYSIS_STREAM, WORKER_GROUP, WORKER, 10, Duration::ZERO)
            .await
            .unwrap()
    }

    async fn only_delivery(&self) -> Delivery {
        let mut batch = self.deliveries().await;
        assert_eq!(batch.len(), 1);
        batch.remove(0)
    }

    async fn run(&self, key: &str) -> debate_state::AgentRunRecord {
        self.store.find_agent_run(key).await.unwrap().unwrap()
    }

    async fn dead_letters(&self) -> Vec<debate_state::JobEnvelope> {
        self.queue.entries(DEAD_LETTER_STREAM).await.unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn duplicate_enqueue_collapses_onto_one_run() {
    let fx = fixture(answering(Role::PlannerPrimary)).await;

    let first = fx.enqueue(Role::PlannerPrimary).await;
    let second = fx.enqueue(Role::PlannerPrimary).await;

    assert_eq!(first, second);
    assert_eq!(fx.queue.len(ANALYSIS_STREAM).await.unwrap(), 1);
    assert_eq!(fx.store.list_agent_runs(&fx.round.id).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn enqueue_after_completion_appends_nothing() {
    let fx = fixture(answering(Role::PlannerPrimary)).await;
    let key = fx.enqueue(Role::PlannerPrimary).await;
    let delivery = fx.only_delivery().await;
    fx.dispatcher.process(&delivery, WORKER).await.unwrap();

    assert_eq!(fx.enqueue(Role::PlannerPrimary).await, key);
    assert_eq!(fx.queue.len(ANALYSIS_STREAM).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn completed_run_persists_findings_and_marker() {
    let fx = fixture(answering(Role::PlannerPrimary)).await;
    let key = fx.enqueue(Role::PlannerPrimary).await;

    let outcome = fx
        .dispatcher
        .process(&fx.only_delivery().await, WORKER)
        .await
        .unwrap();

    assert_eq!(outcome, ProcessOutcome::Settled(AgentRunStatus::Completed));
    let run = fx.run(&key).await;
    assert_eq!(run.attempt, 1);
    assert_eq!(run.recommendations, vec!["rotate keys"]);
    assert!(run.raw_output.is_some());
    let findings = fx.store.list_findings(&run.id).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].file_path.as_deref(), Some("auth.go"));
    assert!(fx.store.get_completion_marker(&key).await.unwrap().is_some());
    // The claim is released once the result is durable.
    let lock = ClaimRecord::lock_key(&fx.task.id, 1, Role::PlannerPrimary);
    assert!(fx.store.get_claim(&lock).await.unwrap().is_none());
    assert_eq!(fx.queue.len(ANALYSIS_STREAM).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_delivery_executes_once() {
    let fx = fixture(answering(Role::PlannerPrimary)).await;
    let key = fx.enqueue(Role::PlannerPrimary).await;
    // Simulate a redelivered copy of the same logical job.
    let copy = fx.queue.entries(ANALYSIS_STREAM).await.unwrap().remove(0);
    fx.queue.append(ANALYSIS_STREAM, copy).await.unwrap();

    let batch = fx.deliveries().await;
    assert_eq!(batch.len(), 2);
    let first = fx.dispatcher.process(&batch[0], WORKER).await.unwrap();
    let second = fx.dispatcher.process(&batch[1], WORKER).await.unwrap();

    assert_eq!(first, ProcessOutcome::Settled(AgentRunStatus::Completed));
    assert_eq!(second, ProcessOutcome::Duplicate);
    assert_eq!(fx.executor.calls_for(Role::PlannerPrimary), 1);
    let run = fx.run(&key).await;
    assert_eq!(fx.store.list_findings(&run.id).await.unwrap().len(), 1);
    assert_eq!(fx.queue.len(ANALYSIS_STREAM).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_with_the_same_key() {
    let executor = ScriptedExecutor::new().script(
        Role::PlannerPrimary,
        vec![
            Step::Transient,
            Step::Reply(reply(&[("security", "auth.go", Severity::High)], &[])),
        ],
    );
    let fx = fixture(executor).await;
    let key = fx.enqueue(Role::PlannerPrimary).await;

    let outcome = fx
        .dispatcher
        .process(&fx.only_delivery().await, WORKER)
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Retried { attempt: 1 });
    let waiting = fx.run(&key).await;
    assert_eq!(waiting.status, AgentRunStatus::Scheduled);
    assert_eq!(waiting.error.as_deref(), Some("rate limited"));

    let retry = fx.only_delivery().await;
    assert_eq!(retry.envelope.idempotency_key, key);
    let outcome = fx.dispatcher.process(&retry, WORKER).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Settled(AgentRunStatus::Completed));

    let run = fx.run(&key).await;
    assert_eq!(run.attempt, 2);
    assert!(run.error.is_none());
    assert!(fx.dead_letters().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn spent_rate_limit_is_retried_after_the_window() {
    let mut config = test_config();
    let agent = config.roles[&Role::PlannerPrimary].agent.clone();
    config.roles.get_mut(&Role::PlannerSecondary).unwrap().agent = agent.clone();
    config.rate_limits.agents.insert(agent, 1);
    config.rate_limits.wait_secs = 2;
    let executor = answering(Role::PlannerPrimary).script(
        Role::PlannerSecondary,
        vec![Step::Reply(reply(&[("security", "auth.go", Severity::High)], &[]))],
    );
    let fx = fixture_with(config, executor).await;
    fx.enqueue(Role::PlannerPrimary).await;
    let second = fx.enqueue(Role::PlannerSecondary).await;

    let batch = fx.deliveries().await;
    assert_eq!(batch.len(), 2);
    let first = fx.dispatcher.process(&batch[0], WORKER).await.unwrap();
    assert_eq!(first, ProcessOutcome::Settled(AgentRunStatus::Completed));

    // Both roles share one agent, and its budget is spent.
    let outcome = fx.dispatcher.process(&batch[1], WORKER).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Retried { attempt: 1 });
    assert_eq!(fx.executor.calls_for(Role::PlannerSecondary), 0);
    let waiting = fx.run(&second).await;
    assert_eq!(waiting.status, AgentRunStatus::Scheduled);
    assert!(waiting.error.unwrap().contains("rate limit busy"));

    tokio::time::advance(Duration::from_secs(60)).await;
    let outcome = fx
        .dispatcher
        .process(&fx.only_delivery().await, WORKER)
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Settled(AgentRunStatus::Completed));
    assert_eq!(fx.executor.calls_for(Role::PlannerSecondary), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_transient_retries_are_dead_lettered() {
    let executor = ScriptedExecutor::new().script(Role::PlannerPrimary, vec![Step::Transient]);
    let fx = fixture(executor).await;
    let key = fx.enqueue(Role::PlannerPrimary).await;

    let mut last = None;
    for _ in 0..3 {
        let delivery = fx.only_delivery().await;
        last = Some(fx.dispatcher.process(&delivery, WORKER).await.unwrap());
    }

    assert_eq!(last, Some(ProcessOutcome::Settled(AgentRunStatus::Failed)));
    let run = fx.run(&key).await;
    assert_eq!(run.attempt, 3);
    assert!(run.error.unwrap().starts_with("retries exhausted"));
    assert_eq!(fx.dead_letters().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_goes_to_dead_letter() {
    let executor = ScriptedExecutor::new().script(Role::PlannerPrimary, vec![Step::Permanent]);
    let fx = fixture(executor).await;
    let key = fx.enqueue(Role::PlannerPrimary).await;

    let outcome = fx
        .dispatcher
        .process(&fx.only_delivery().await, WORKER)
        .await
        .unwrap();

    assert_eq!(outcome, ProcessOutcome::Settled(AgentRunStatus::Failed));
    assert_eq!(fx.executor.calls_for(Role::PlannerPrimary), 1);
    let parked = fx.dead_letters().await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].idempotency_key, key);
    assert!(parked[0].failure.as_deref().unwrap().contains("model refused"));
}

#[tokio::test(start_paused = true)]
async fn invalid_output_keeps_raw_text_and_fails() {
    let executor = ScriptedExecutor::new().script(
        Role::PlannerPrimary,
        vec![Step::Reply("I think the auth module looks fine.".into())],
    );
    let fx = fixture(executor).await;
    let key = fx.enqueue(Role::PlannerPrimary).await;

    let outcome = fx
        .dispatcher
        .process(&fx.only_delivery().await, WORKER)
        .await
        .unwrap();

    assert_eq!(outcome, ProcessOutcome::Settled(AgentRunStatus::Failed));
    let run = fx.run(&key).await;
    assert_eq!(
        run.raw_output.as_deref(),
        Some("I think the auth module looks fine.")
    );
    assert!(run.error.unwrap().starts_with("validation failure"));
    assert!(fx.store.list_findings(&run.id).await.unwrap().is_empty());
    assert_eq!(fx.dead_letters().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_executor_times_out_and_is_dropped() {
    let executor = ScriptedExecutor::new().script(Role::PlannerPrimary, vec![Step::Hang]);
    let fx = fixture(executor).await;
    let key = fx.enqueue(Role::PlannerPrimary).await;

    let outcome = fx
        .dispatcher
        .process(&fx.only_delivery().await, WORKER)
        .await
        .unwrap();

    assert_eq!(outcome, ProcessOutcome::Settled(AgentRunStatus::Timeout));
    assert_eq!(fx.executor.abandoned(), 1);
    let run = fx.run(&key).await;
    assert_eq!(run.error.as_deref(), Some("no result within 5s"));
    // Timeouts are not retried.
    assert_eq!(fx.queue.len(ANALYSIS_STREAM).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn slot_claimed_elsewhere_stays_pending() {
    let fx = fixture(answering(Role::PlannerPrimary)).await;
    let key = fx.enqueue(Role::PlannerPrimary).await;
    let lock = ClaimRecord::lock_key(&fx.task.id, 1, Role::PlannerPrimary);
    let now = Utc::now();
    let held = fx
        .store
        .try_claim(
            ClaimRecord::new(lock, key.clone(), "worker-b", now, chrono::Duration::minutes(5)),
            now,
        )
        .await
        .unwrap();
    assert!(held);

    let outcome = fx
        .dispatcher
        .process(&fx.only_delivery().await, WORKER)
        .await
        .unwrap();

    assert_eq!(outcome, ProcessOutcome::InFlight);
    assert_eq!(fx.executor.calls().len(), 0);
    assert_eq!(fx.run(&key).await.status, AgentRunStatus::Scheduled);
    assert_eq!(fx.queue.len(ANALYSIS_STREAM).await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_task_settles_without_executing() {
    let fx = fixture(answering(Role::PlannerPrimary)).await;
    let key = fx.enqueue(Role::PlannerPrimary).await;
    fx.dispatcher.cancels().cancel(&fx.task.id);

    let outcome = fx
        .dispatcher
        .process(&fx.only_delivery().await, WORKER)
        .await
        .unwrap();

    assert_eq!(outcome, ProcessOutcome::Settled(AgentRunStatus::Cancelled));
    assert!(fx.executor.calls().is_empty());
    assert!(fx.store.get_completion_marker(&key).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn too_many_deliveries_fail_the_run() {
    let fx = fixture(answering(Role::PlannerPrimary)).await;
    let key = fx.enqueue(Role::PlannerPrimary).await;
    let mut delivery = fx.only_delivery().await;
    delivery.delivery_count = test_config().queue.max_deliveries + 1;

    let outcome = fx.dispatcher.process(&delivery, WORKER).await.unwrap();

    assert!(matches!(outcome, ProcessOutcome::Rejected(_)));
    assert_eq!(fx.run(&key).await.status, AgentRunStatus::Failed);
    assert!(fx.executor.calls().is_empty());
    assert_eq!(fx.dead_letters().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn tampered_envelope_is_rejected() {
    let fx = fixture(answering(Role::PlannerPrimary)).await;
    let key = fx.enqueue(Role::PlannerPrimary).await;
    let mut delivery = fx.only_delivery().await;
    delivery.envelope.round_number = 2;

    let outcome = fx.dispatcher.process(&delivery, WORKER).await.unwrap();

    assert!(matches!(outcome, ProcessOutcome::Rejected(_)));
    assert_eq!(fx.run(&key).await.status, AgentRunStatus::Scheduled);
    assert!(fx.executor.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn full_stream_is_backpressure() {
    let mut config = test_config();
    config.queue.max_depth = 1;
    let fx = fixture_with(config, ScriptedExecutor::new()).await;

    fx.enqueue(Role::PlannerPrimary).await;
    let err = fx
        .dispatcher
        .enqueue(&fx.task.id, 1, Role::PlannerSecondary, 0)
        .await
        .unwrap_err();

    assert!(matches!(err, DebateError::Backpressure(_)));
}

#[tokio::test(start_paused = true)]
async fn enqueue_for_unknown_round_is_invalid() {
    let fx = fixture(ScriptedExecutor::new()).await;
    let err = fx
        .dispatcher
        .enqueue(&fx.task.id, 7, Role::PlannerPrimary, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, DebateError::InvalidRound { round_number: 7, .. }));
}

#[tokio::test(start_paused = true)]
async fn transient_store_failures_are_retried() {
    let fx = fixture(answering(Role::PlannerPrimary)).await;
    // One failure per call is absorbed by the storage retry budget.
    fx.store.fail_next(1);
    let key = fx.enqueue(Role::PlannerPrimary).await;
    assert!(fx.store.find_agent_run(&key).await.unwrap().is_some());
}
