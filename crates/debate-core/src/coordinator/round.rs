//! One round: context, dispatch, barrier, scoring.

use chrono::Utc;
use futures::future::try_join_all;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use debate_state::{
    AgentRunRecord, AgentRunStatus, ConsensusId, ConsensusRecord, ContentDigest, EventKind,
    EventRecord, Role, RoundRecord, RoundStatus, StorageError, TaskRecord,
};

use crate::consensus::Participant;
use crate::coordinator::context::{PeerReview, RoundContext};
use crate::coordinator::Coordinator;
use crate::dispatch::RunSettled;
use crate::error::{DebateError, Result};
use crate::escalation::{decide, decide_fast_track};
use crate::obs;
use crate::retry::with_retry;

/// Round number used for the exploration pass.
pub(crate) const EXPLORATION_ROUND: u32 = 0;

impl Coordinator {
    /// Roles dispatched for a debate round of `task`.
    pub(crate) fn round_roles(&self, task: &TaskRecord) -> Vec<Role> {
        let roles = &self.config.rounds.analysis_roles;
        if self.policy_for(task).fast_track {
            roles.first().copied().into_iter().collect()
        } else {
            roles.clone()
        }
    }

    async fn round_context(&self, task: &TaskRecord, round_number: u32) -> Result<Vec<u8>> {
        let retry = &self.config.storage_retry;
        let mut context = RoundContext::new(task, round_number);

        if let Some(digest) = &task.exploration_context {
            let raw = with_retry(retry, "get_context", || self.store.get_context(digest)).await?;
            context.exploration = Some(serde_json::from_slice(&raw)?);
        }

        if round_number > 1 {
            let previous = with_retry(retry, "find_round", || {
                self.store.find_round(&task.id, round_number - 1)
            })
            .await?;
            if let Some(previous) = previous {
                for run in self.completed_runs(&previous).await? {
                    let findings =
                        with_retry(retry, "list_findings", || self.store.list_findings(&run.id))
                            .await?;
                    context.previous_round.push(PeerReview::new(&run, findings));
                }
            }
        }
        Ok(serde_json::to_vec(&context)?)
    }

    async fn completed_runs(&self, round: &RoundRecord) -> Result<Vec<AgentRunRecord>> {
        let runs = with_retry(&self.config.storage_retry, "list_agent_runs", || {
            self.store.list_agent_runs(&round.id)
        })
        .await?;
        Ok(runs
            .into_iter()
            .filter(|r| r.status == AgentRunStatus::Completed)
            .collect())
    }

    /// Create round `round_number`, or return it if it already exists.
    pub(crate) async fn open_round(
        &self,
        task: &TaskRecord,
        round_number: u32,
    ) -> Result<RoundRecord> {
        let retry = &self.config.storage_retry;
        if let Some(existing) = with_retry(retry, "find_round", || {
            self.store.find_round(&task.id, round_number)
        })
        .await?
        {
            return Ok(existing);
        }

        let bytes = self.round_context(task, round_number).await?;
        let digest = with_retry(retry, "put_context", || self.store.put_context(&bytes)).await?;
        let window = chrono::Duration::from_std(self.config.round_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(self.config.timeouts.round_secs as i64));

        let mut round = RoundRecord::new(task.id.clone(), round_number, Utc::now() + window);
        round.context = Some(digest);
        match with_retry(retry, "create_round", || self.store.create_round(round.clone())).await {
            Ok(created) => Ok(created),
            Err(StorageError::Conflict { .. }) => with_retry(retry, "find_round", || {
                self.store.find_round(&task.id, round_number)
            })
            .await?
            .ok_or_else(|| DebateError::InvalidRound {
                task_id: task.id.0.clone(),
                round_number,
                detail: "round vanished after create conflict".into(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Dispatch `roles` for `round` and wait until every run is terminal or
    /// the round deadline passes. Runs still open at the deadline are
    /// settled as `timeout`.
    #[instrument(skip_all, fields(task_id = %task.id, round = round.round_number))]
    pub(crate) async fn dispatch_round(
        &self,
        task: &TaskRecord,
        round: &RoundRecord,
        roles: &[Role],
    ) -> Result<Vec<AgentRunRecord>> {
        // Subscribe before enqueueing so no settlement is missed.
        let mut signals = self.dispatcher.signals().subscribe();
        let keys = try_join_all(roles.iter().map(|role| {
            self.dispatcher
                .enqueue(&task.id, round.round_number, *role, 0)
        }))
        .await?;
        obs::emit_round_started(task.id.as_str(), round.round_number, roles.len());

        let remaining = (round.deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let expired = tokio::time::sleep(remaining);
        tokio::pin!(expired);

        loop {
            let runs = self.runs_for(&keys).await?;
            if runs.iter().all(|r| r.status.is_terminal()) {
                return Ok(runs);
            }

            let timed_out = loop {
                tokio::select! {
                    _ = &mut expired => break true,
                    signal = signals.recv() => match signal {
                        Ok(RunSettled { task_id, round_number, .. })
                            if task_id != task.id || round_number != round.round_number => continue,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(missed, "settlement signals lagged");
                            break false;
                        }
                        _ => break false,
                    },
                    // Fallback liveness check; signals are the primary wake-up.
                    _ = tokio::time::sleep(self.config.poll_interval()) => break false,
                }
            };
            if timed_out {
                return self.expire_round(&keys).await;
            }
        }
    }

    async fn runs_for(&self, keys: &[String]) -> Result<Vec<AgentRunRecord>> {
        let retry = &self.config.storage_retry;
        let mut runs = Vec::with_capacity(keys.len());
        for key in keys {
            let run = with_retry(retry, "find_agent_run", || self.store.find_agent_run(key))
                .await?
                .ok_or_else(|| StorageError::NotFound {
                    entity: "agent_run",
                    id: key.clone(),
                })?;
            runs.push(run);
        }
        Ok(runs)
    }

    async fn expire_round(&self, keys: &[String]) -> Result<Vec<AgentRunRecord>> {
        let mut settled = Vec::with_capacity(keys.len());
        for run in self.runs_for(keys).await? {
            if run.status.is_terminal() {
                settled.push(run);
                continue;
            }
            warn!(role = %run.role, status = %run.status, "round deadline elapsed");
            // Stop the executor call still holding the slot.
            let cancels = self.dispatcher.cancels();
            cancels.cancel_run(&run.idempotency_key);
            let run = self
                .dispatcher
                .settle_without_output(&run, AgentRunStatus::Timeout, "round deadline elapsed")
                .await?;
            if run.error.as_deref() != Some("round deadline elapsed") {
                // The worker settled it first and will not look at the flag.
                cancels.clear_run(&run.idempotency_key);
            }
            settled.push(run);
        }
        Ok(settled)
    }

    /// Score a finished round and persist its consensus result exactly once.
    ///
    /// If the round already has a result, that result is returned untouched.
    #[instrument(skip_all, fields(task_id = %task.id, round = round.round_number))]
    pub(crate) async fn conclude_round(
        &self,
        task: &TaskRecord,
        round: &RoundRecord,
        runs: &[AgentRunRecord],
    ) -> Result<ConsensusRecord> {
        let retry = &self.config.storage_retry;
        if let Some(existing) =
            with_retry(retry, "get_consensus", || self.store.get_consensus(&round.id)).await?
        {
            return Ok(existing);
        }

        let mut participants = Vec::new();
        for run in runs.iter().filter(|r| r.status == AgentRunStatus::Completed) {
            let findings =
                with_retry(retry, "list_findings", || self.store.list_findings(&run.id)).await?;
            participants.push(Participant::from_run(run, &findings));
        }
        let completed = participants.len();

        let policy = self.policy_for(task);
        let outcome = self.consensus.score(&participants);
        let verdict = if policy.fast_track {
            decide_fast_track(completed)
        } else {
            decide(
                &outcome,
                completed,
                round.round_number,
                task.last_consensus_score,
                &policy,
            )
        };

        let record = ConsensusRecord {
            id: ConsensusId::new(),
            task_id: task.id.clone(),
            round_id: round.id.clone(),
            round_number: round.round_number,
            score: outcome.score,
            breakdown: outcome.breakdown.clone(),
            participants: outcome.participants.clone(),
            comparable: outcome.comparable,
            decision: verdict.decision,
            escalation_reason: verdict.reason,
            disagreements: outcome.disagreements.clone(),
            agreed_items: outcome.agreed_items.clone(),
            fast_track: policy.fast_track,
            created_at: Utc::now(),
        };
        let record =
            match with_retry(retry, "insert_consensus", || self.store.insert_consensus(record.clone()))
                .await
            {
                Ok(inserted) => {
                    obs::emit_consensus_scored(
                        task.id.as_str(),
                        round.round_number,
                        &outcome,
                        inserted.decision,
                    );
                    self.log(
                        EventRecord::new(
                            task.id.clone(),
                            EventKind::ConsensusScored,
                            format!("score {:.1}, {}", inserted.score, inserted.decision.as_str()),
                        )
                        .in_round(round.round_number)
                        .with_details(json!({
                            "score": inserted.score,
                            "decision": inserted.decision.as_str(),
                            "comparable": inserted.comparable,
                            "participants": completed,
                        })),
                    )
                    .await;
                    inserted
                }
                Err(StorageError::Conflict { .. }) => {
                    with_retry(retry, "get_consensus", || self.store.get_consensus(&round.id))
                        .await?
                        .ok_or_else(|| DebateError::InvalidRound {
                            task_id: task.id.0.clone(),
                            round_number: round.round_number,
                            detail: "consensus vanished after insert conflict".into(),
                        })?
                }
                Err(e) => return Err(e.into()),
            };

        self.close_round(round, completed > 0).await?;
        obs::emit_round_finished(task.id.as_str(), round.round_number, completed, runs.len());
        Ok(record)
    }

    async fn close_round(&self, round: &RoundRecord, any_completed: bool) -> Result<()> {
        if round.status != RoundStatus::InProgress {
            return Ok(());
        }
        let mut closed = round.clone();
        closed.status = if any_completed {
            RoundStatus::Completed
        } else {
            RoundStatus::Failed
        };
        closed.completed_at = Some(Utc::now());
        with_retry(&self.config.storage_retry, "update_round", || {
            self.store.update_round(&closed)
        })
        .await?;
        Ok(())
    }

    /// Run the explorer once and store its output for later rounds.
    ///
    /// Exploration is advisory: if the explorer does not complete, the task
    /// continues without it.
    pub(crate) async fn explore(&self, task: &TaskRecord) -> Result<Option<ContentDigest>> {
        let retry = &self.config.storage_retry;
        let round = self.open_round(task, EXPLORATION_ROUND).await?;
        let runs = self.dispatch_round(task, &round, &[Role::Explorer]).await?;

        let explorer = runs.iter().find(|r| r.status == AgentRunStatus::Completed);
        self.close_round(&round, explorer.is_some()).await?;
        let Some(run) = explorer else {
            warn!(task_id = %task.id, "exploration produced no output");
            return Ok(None);
        };

        let findings =
            with_retry(retry, "list_findings", || self.store.list_findings(&run.id)).await?;
        let bytes = serde_json::to_vec(&PeerReview::new(run, findings))?;
        let digest = with_retry(retry, "put_context", || self.store.put_context(&bytes)).await?;
        Ok(Some(digest))
    }
}
