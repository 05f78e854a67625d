//! Idempotent hand-off of agent work to the job stream.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use debate_state::{
    AgentRunRecord, AgentRunStatus, CompletionMarker, DebateStore, JobEnvelope, JobQueue,
    Role, StorageError, TaskId, ANALYSIS_STREAM, DEAD_LETTER_STREAM,
};

use crate::config::EngineConfig;
use crate::dispatch::executor::AgentExecutor;
use crate::dispatch::idempotency::idempotency_key;
use crate::dispatch::rate_limit::RateLimiter;
use crate::dispatch::signals::{CancelRegistry, RoundSignals, RunSettled};
use crate::error::{DebateError, Result};
use crate::obs;
use crate::retry::with_retry;

fn missing_run(key: &str) -> StorageError {
    StorageError::NotFound {
        entity: "agent_run",
        id: key.to_string(),
    }
}

/// Owns the path from "run role R for task T round N" to a settled agent run.
///
/// The coordinator calls [`Dispatcher::enqueue`]; workers call
/// [`Dispatcher::process`] for each delivery. Both sides share the store,
/// the job stream and the in-process signals.
pub struct Dispatcher {
    pub(crate) store: Arc<dyn DebateStore>,
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) executor: Arc<dyn AgentExecutor>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) signals: RoundSignals,
    pub(crate) cancels: Arc<CancelRegistry>,
    pub(crate) limiter: RateLimiter,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn DebateStore>,
        queue: Arc<dyn JobQueue>,
        executor: Arc<dyn AgentExecutor>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(&config.rate_limits),
            store,
            queue,
            executor,
            config,
            signals: RoundSignals::new(),
            cancels: Arc::new(CancelRegistry::new()),
        }
    }

    pub fn signals(&self) -> &RoundSignals {
        &self.signals
    }

    pub fn cancels(&self) -> &Arc<CancelRegistry> {
        &self.cancels
    }

    /// Schedule one agent run and return its idempotency key.
    ///
    /// Re-enqueuing the same `(task, round, role, epoch)` collapses onto the
    /// existing run: nothing is appended once the run is terminal or its
    /// completion marker exists, or while an entry for the key is still in
    /// the stream.
    #[instrument(skip(self), fields(task_id = %task_id, role = %role))]
    pub async fn enqueue(
        &self,
        task_id: &TaskId,
        round_number: u32,
        role: Role,
        epoch: u32,
    ) -> Result<String> {
        let retry = &self.config.storage_retry;
        let key = idempotency_key(task_id, round_number, role, epoch);

        let marker = with_retry(retry, "get_completion_marker", || {
            self.store.get_completion_marker(&key)
        })
        .await?;
        if marker.is_some() {
            debug!(idempotency_key = %key, "run already complete, not enqueuing");
            return Ok(key);
        }

        let round = with_retry(retry, "find_round", || {
            self.store.find_round(task_id, round_number)
        })
        .await?
        .ok_or_else(|| DebateError::InvalidRound {
            task_id: task_id.0.clone(),
            round_number,
            detail: "round does not exist".into(),
        })?;
        let context = round.context.clone().ok_or_else(|| DebateError::InvalidRound {
            task_id: task_id.0.clone(),
            round_number,
            detail: "round has no context".into(),
        })?;
        let settings = self
            .config
            .role(role)
            .ok_or_else(|| DebateError::Config(format!("role {role} is not configured")))?;

        let scheduled = AgentRunRecord::scheduled(&round, role, &settings.model, &key, epoch);
        let run = match with_retry(retry, "insert_agent_run", || {
            self.store.insert_agent_run(scheduled.clone())
        })
        .await
        {
            Ok(run) => run,
            Err(StorageError::Conflict { .. }) => with_retry(retry, "find_agent_run", || {
                self.store.find_agent_run(&key)
            })
            .await?
            .ok_or_else(|| missing_run(&key))?,
            Err(e) => return Err(e.into()),
        };
        if run.status.is_terminal() {
            return Ok(key);
        }

        let pending = with_retry(retry, "queue_entries", || self.queue.entries(ANALYSIS_STREAM)).await?;
        if pending.iter().any(|e| e.idempotency_key == key) {
            debug!(idempotency_key = %key, "entry already queued");
            return Ok(key);
        }

        let envelope = JobEnvelope {
            job_id: Uuid::new_v4().to_string(),
            task_id: task_id.clone(),
            round_number,
            role,
            model: run.model.clone(),
            attempt: epoch,
            idempotency_key: key.clone(),
            context_reference: context,
            enqueued_at: Utc::now(),
            failure: None,
        };
        self.queue.append(ANALYSIS_STREAM, envelope).await?;
        obs::emit_run_dispatched(task_id.as_str(), round_number, role, &key);
        Ok(key)
    }

    /// Settle a run that produced no output (deadline, cancellation, give-up).
    ///
    /// Returns the run as stored afterwards; if another party settled it
    /// first, that outcome wins.
    pub async fn settle_without_output(
        &self,
        run: &AgentRunRecord,
        status: AgentRunStatus,
        reason: &str,
    ) -> Result<AgentRunRecord> {
        let retry = &self.config.storage_retry;
        let mut current = run.clone();
        loop {
            let mut settled = current.clone();
            settled.status = status;
            settled.error = Some(reason.to_string());
            settled.finished_at = Some(Utc::now());

            let written = match current.status {
                AgentRunStatus::Running => {
                    with_retry(retry, "complete_agent_run", || {
                        self.store.complete_agent_run(&settled, Vec::new())
                    })
                    .await
                }
                AgentRunStatus::Scheduled => {
                    with_retry(retry, "update_agent_run", || {
                        self.store.update_agent_run(&settled)
                    })
                    .await
                }
                _ => return Ok(current),
            };

            match written {
                Ok(()) => {
                    self.mark_complete(&settled).await?;
                    self.publish(&settled).await;
                    return Ok(settled);
                }
                // Someone else moved the run; look again.
                Err(StorageError::InvalidState { .. }) => {
                    current = with_retry(retry, "find_agent_run", || {
                        self.store.find_agent_run(&run.idempotency_key)
                    })
                    .await?
                    .ok_or_else(|| missing_run(&run.idempotency_key))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write the completion marker for a terminal run.
    pub(crate) async fn mark_complete(&self, run: &AgentRunRecord) -> Result<()> {
        let marker = CompletionMarker {
            idempotency_key: run.idempotency_key.clone(),
            run_id: run.id.clone(),
            status: run.status,
            completed_at: run.finished_at.unwrap_or_else(Utc::now),
        };
        with_retry(&self.config.storage_retry, "put_completion_marker", || {
            self.store.put_completion_marker(marker.clone())
        })
        .await?;
        Ok(())
    }

    /// Announce a durably settled run: log, event log, then round signal.
    pub(crate) async fn publish(&self, run: &AgentRunRecord) {
        obs::emit_run_settled(
            run.task_id.as_str(),
            run.round_number,
            run.role,
            run.status,
            run.attempt,
        );
        if let Some(event) = obs::run_settled_event(run) {
            obs::persist(self.store.as_ref(), event).await;
        }
        self.signals.publish(RunSettled {
            task_id: run.task_id.clone(),
            round_number: run.round_number,
            role: run.role,
            status: run.status,
        });
    }

    /// Park an envelope on the dead-letter stream.
    pub(crate) async fn dead_letter(&self, envelope: &JobEnvelope, reason: &str) {
        let mut parked = envelope.clone();
        parked.failure = Some(reason.to_string());
        parked.enqueued_at = Utc::now();
        obs::emit_run_dead_lettered(envelope.task_id.as_str(), envelope.role, reason);
        if let Err(e) = self.queue.append(DEAD_LETTER_STREAM, parked).await {
            warn!(error = %e, idempotency_key = %envelope.idempotency_key, "dead-letter append failed");
        }
    }
}
