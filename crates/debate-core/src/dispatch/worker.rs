//! Job stream consumers.
//!
//! A delivery is processed as:
//!
//! 1. completion marker present: acknowledge, nothing else
//! 2. run already terminal: repair the marker, acknowledge
//! 3. task finished or cancelled: settle `cancelled`, acknowledge
//! 4. claim the `(task, round, role)` slot; if held elsewhere leave the
//!    entry pending for a later reclaim
//! 5. mark the run `running`, wait for the agent's rate limit budget and
//!    execute under a hard timeout, raced against the task's cancel flag and
//!    the run's round-deadline flag
//! 6. persist run and findings as one unit, then the completion marker,
//!    then release the claim and acknowledge
//!
//! Transient executor failures, including a rate limit that stays busy past
//! its wait, are re-appended with backoff until the attempt budget is spent.
//! Permanent and validation failures, spent budgets and entries delivered
//! too often go to the dead-letter stream.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use debate_state::{
    AgentRunRecord, AgentRunStatus, ClaimRecord, Delivery, FindingRecord, JobEnvelope,
    StorageError, ANALYSIS_STREAM, WORKER_GROUP,
};

use crate::dispatch::dispatcher::Dispatcher;
use crate::dispatch::executor::{AgentFailure, AgentRequest};
use crate::dispatch::idempotency::envelope_key_matches;
use crate::dispatch::signals::cancelled;
use crate::domain::agent_output::AgentOutput;
use crate::error::Result;
use crate::obs;
use crate::retry::with_retry;

/// What a worker did with one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The run reached this terminal status.
    Settled(AgentRunStatus),
    /// Put back on the stream for another attempt.
    Retried { attempt: u32 },
    /// The work was already done; the entry was acknowledged.
    Duplicate,
    /// Another worker holds the slot; the entry stays pending.
    InFlight,
    /// The entry was malformed or undeliverable and was dead-lettered.
    Rejected(String),
}

enum Execution {
    Output(String),
    Failed(AgentFailure),
    TimedOut(Duration),
    Cancelled,
    /// The round deadline settled the run first.
    Expired,
}

impl Dispatcher {
    fn chrono_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.claim_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(self.config.timeouts.agent_secs as i64))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        with_retry(&self.config.storage_retry, "ack", || {
            self.queue.ack(&delivery.stream, WORKER_GROUP, &delivery.message_id)
        })
        .await?;
        Ok(())
    }

    async fn release(&self, lock_key: &str, consumer: &str) {
        if let Err(e) = self.store.release_claim(lock_key, consumer).await {
            // The claim expires on its own.
            warn!(error = %e, lock_key, "claim release failed");
        }
    }

    async fn reject(&self, delivery: &Delivery, reason: String) -> Result<ProcessOutcome> {
        self.dead_letter(&delivery.envelope, &reason).await;
        self.ack(delivery).await?;
        Ok(ProcessOutcome::Rejected(reason))
    }

    /// Handle one delivery from the analysis stream.
    #[instrument(
        skip(self, delivery),
        fields(task_id = %delivery.envelope.task_id, role = %delivery.envelope.role, round = delivery.envelope.round_number)
    )]
    pub async fn process(&self, delivery: &Delivery, consumer: &str) -> Result<ProcessOutcome> {
        let retry = &self.config.storage_retry;
        let envelope = &delivery.envelope;
        let key = &envelope.idempotency_key;

        if !envelope_key_matches(envelope) {
            return self
                .reject(delivery, "idempotency key does not match envelope".into())
                .await;
        }

        let marker =
            with_retry(retry, "get_completion_marker", || self.store.get_completion_marker(key))
                .await?;
        if marker.is_some() {
            self.cancels.clear_run(key);
            self.ack(delivery).await?;
            return Ok(ProcessOutcome::Duplicate);
        }

        let Some(run) = with_retry(retry, "find_agent_run", || self.store.find_agent_run(key)).await?
        else {
            return self.reject(delivery, "no agent run for key".into()).await;
        };
        if run.status.is_terminal() {
            self.cancels.clear_run(key);
            self.mark_complete(&run).await?;
            self.ack(delivery).await?;
            return Ok(ProcessOutcome::Duplicate);
        }

        if delivery.delivery_count > self.config.queue.max_deliveries {
            let reason = format!("delivered {} times without completing", delivery.delivery_count);
            self.settle_without_output(&run, AgentRunStatus::Failed, &reason)
                .await?;
            return self.reject(delivery, reason).await;
        }

        let task =
            with_retry(retry, "get_task", || self.store.get_task(&envelope.task_id)).await?;
        if task.status.is_terminal() || self.cancels.is_cancelled(&task.id) {
            let settled = self
                .settle_without_output(&run, AgentRunStatus::Cancelled, "task no longer active")
                .await?;
            self.ack(delivery).await?;
            return Ok(ProcessOutcome::Settled(settled.status));
        }

        let lock_key = ClaimRecord::lock_key(&envelope.task_id, envelope.round_number, envelope.role);
        let now = Utc::now();
        let claim = ClaimRecord::new(lock_key.clone(), key.clone(), consumer, now, self.chrono_ttl());
        let claimed =
            with_retry(retry, "try_claim", || self.store.try_claim(claim.clone(), now)).await?;
        if !claimed {
            return Ok(ProcessOutcome::InFlight);
        }

        let outcome = self.execute_claimed(delivery, run, consumer).await;
        self.cancels.clear_run(key);
        self.release(&lock_key, consumer).await;
        outcome
    }

    async fn execute_claimed(
        &self,
        delivery: &Delivery,
        mut run: AgentRunRecord,
        consumer: &str,
    ) -> Result<ProcessOutcome> {
        let retry = &self.config.storage_retry;
        let envelope = &delivery.envelope;

        run.status = AgentRunStatus::Running;
        run.attempt += 1;
        run.started_at = Some(Utc::now());
        match with_retry(retry, "update_agent_run", || self.store.update_agent_run(&run)).await {
            Ok(()) => {}
            Err(StorageError::Conflict { .. }) => return Ok(ProcessOutcome::InFlight),
            // Settled between our read and the claim.
            Err(StorageError::InvalidState { .. }) => {
                self.ack(delivery).await?;
                return Ok(ProcessOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }

        let context = with_retry(retry, "get_context", || {
            self.store.get_context(&envelope.context_reference)
        })
        .await?;
        let settings = self.config.role(run.role);
        let request = AgentRequest {
            task_id: run.task_id.clone(),
            round_number: run.round_number,
            role: run.role,
            agent: settings.map(|s| s.agent.clone()).unwrap_or_default(),
            model: run.model.clone(),
            attempt: run.attempt,
            context,
        };

        obs::persist(self.store.as_ref(), obs::run_started_event(&run, &request.agent)).await;

        let limit = self.config.run_timeout(run.role);
        let mut task_token = self.cancels.token(&run.task_id);
        let mut run_token = self.cancels.run_token(&run.idempotency_key);
        let execution = tokio::select! {
            biased;
            _ = cancelled(&mut task_token) => Execution::Cancelled,
            _ = cancelled(&mut run_token) => Execution::Expired,
            execution = self.execute_limited(&request, limit) => execution,
        };

        let mut findings: Vec<FindingRecord> = Vec::new();
        let mut dead_letter: Option<String> = None;
        match execution {
            Execution::Output(raw) => {
                match AgentOutput::parse(&raw) {
                    Ok(output) => {
                        run.status = AgentRunStatus::Completed;
                        findings = output.finding_records(&run.id);
                        run.recommendations = output.recommendations;
                        run.explicit_agreements = output.explicit_agreements;
                        run.error = None;
                    }
                    Err(e) => {
                        let reason = format!("validation failure: {e}");
                        run.status = AgentRunStatus::Failed;
                        run.error = Some(reason.clone());
                        dead_letter = Some(reason);
                    }
                }
                run.raw_output = Some(raw);
            }
            Execution::Failed(AgentFailure::Transient(detail))
                if run.attempt < self.config.retry.max_attempts =>
            {
                return self.retry_later(delivery, run, detail).await;
            }
            Execution::Failed(failure) => {
                let reason = match &failure {
                    AgentFailure::Transient(_) => format!("retries exhausted: {failure}"),
                    AgentFailure::Permanent(_) | AgentFailure::InvalidOutput(_) => {
                        failure.to_string()
                    }
                };
                run.status = AgentRunStatus::Failed;
                run.error = Some(reason.clone());
                dead_letter = Some(reason);
            }
            Execution::TimedOut(limit) => {
                run.status = AgentRunStatus::Timeout;
                run.error = Some(format!("no result within {}s", limit.as_secs()));
            }
            Execution::Cancelled => {
                run.status = AgentRunStatus::Cancelled;
                run.error = Some("task cancelled".into());
            }
            Execution::Expired => {
                run.status = AgentRunStatus::Timeout;
                run.error = Some("round deadline elapsed".into());
            }
        }
        run.finished_at = Some(Utc::now());

        match with_retry(retry, "complete_agent_run", || {
            self.store.complete_agent_run(&run, findings.clone())
        })
        .await
        {
            Ok(()) => {}
            Err(StorageError::InvalidState { .. }) => {
                // The coordinator settled the run first (deadline or cancel).
                info!(consumer, "run settled elsewhere, discarding result");
                let stored = with_retry(retry, "find_agent_run", || {
                    self.store.find_agent_run(&run.idempotency_key)
                })
                .await?;
                if let Some(stored) = stored.filter(|r| r.status.is_terminal()) {
                    self.mark_complete(&stored).await?;
                    run = stored;
                }
                self.ack(delivery).await?;
                return Ok(ProcessOutcome::Settled(run.status));
            }
            Err(e) => return Err(e.into()),
        }

        self.mark_complete(&run).await?;
        if let Some(reason) = dead_letter {
            self.dead_letter(envelope, &reason).await;
        }
        self.ack(delivery).await?;
        self.publish(&run).await;
        Ok(ProcessOutcome::Settled(run.status))
    }

    /// One executor call behind the agent's rate limit and the run timeout.
    async fn execute_limited(&self, request: &AgentRequest, limit: Duration) -> Execution {
        let wait = self.config.rate_limits.wait();
        if !self.limiter.acquire(&request.agent, wait).await {
            return Execution::Failed(AgentFailure::Transient(format!(
                "rate limit busy for {}",
                request.agent
            )));
        }
        match tokio::time::timeout(limit, self.executor.execute(request)).await {
            Ok(Ok(raw)) => Execution::Output(raw),
            Ok(Err(failure)) => Execution::Failed(failure),
            Err(_) => Execution::TimedOut(limit),
        }
    }

    async fn retry_later(
        &self,
        delivery: &Delivery,
        mut run: AgentRunRecord,
        detail: String,
    ) -> Result<ProcessOutcome> {
        let retry = &self.config.storage_retry;
        obs::emit_run_retry(run.task_id.as_str(), run.role, run.attempt, &detail);

        run.status = AgentRunStatus::Scheduled;
        run.error = Some(detail);
        with_retry(retry, "update_agent_run", || self.store.update_agent_run(&run)).await?;

        tokio::time::sleep(self.config.retry.delay(run.attempt)).await;

        let again = JobEnvelope {
            job_id: Uuid::new_v4().to_string(),
            enqueued_at: Utc::now(),
            ..delivery.envelope.clone()
        };
        // Append before ack: a crash in between leaves a duplicate, never a gap.
        with_retry(retry, "append", || self.queue.append(ANALYSIS_STREAM, again.clone())).await?;
        self.ack(delivery).await?;
        Ok(ProcessOutcome::Retried {
            attempt: run.attempt,
        })
    }

    async fn next_batch(&self, consumer: &str) -> Result<Vec<Delivery>> {
        let batch = self.config.queue.batch_size;
        let stale = self
            .queue
            .reclaim_stale(ANALYSIS_STREAM, WORKER_GROUP, consumer, self.config.claim_ttl(), batch)
            .await?;
        if !stale.is_empty() {
            return Ok(stale);
        }
        Ok(self
            .queue
            .read_group(
                ANALYSIS_STREAM,
                WORKER_GROUP,
                consumer,
                batch,
                self.config.poll_interval(),
            )
            .await?)
    }

    /// Consume the analysis stream until `shutdown` flips to `true`.
    pub async fn run_worker(self: Arc<Self>, consumer: String, mut shutdown: watch::Receiver<bool>) {
        info!(consumer = %consumer, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                batch = self.next_batch(&consumer) => batch,
            };
            match batch {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        if let Err(e) = self.process(&delivery, &consumer).await {
                            // Left pending; reclaimed once the claim TTL passes.
                            warn!(error = %e, message_id = %delivery.message_id, "delivery failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "job stream read failed");
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
        }
        info!(consumer = %consumer, "worker stopped");
    }
}

/// A set of spawned workers sharing one shutdown flag.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(dispatcher: Arc<Dispatcher>, count: usize) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let prefix = Uuid::new_v4().simple().to_string();
        let handles = (0..count)
            .map(|i| {
                let consumer = format!("worker-{}-{i}", &prefix[..8]);
                tokio::spawn(Arc::clone(&dispatcher).run_worker(consumer, rx.clone()))
            })
            .collect();
        Self { shutdown, handles }
    }

    /// Stop reading, give in-flight work `grace` to finish, then abort it.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        for mut handle in self.handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}
