//! The round loop, its recovery paths and the task lease around them.

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};

use debate_state::{
    ConsensusRecord, Decision, EscalationReason, EventKind, EventRecord, RoundStatus,
    StorageError, TaskLease, TaskRecord, TaskStatus,
};

use crate::coordinator::{Coordinator, TaskStatusView};
use crate::domain::lifecycle::{fail_with_checkpoint, restore_checkpoint};
use crate::error::{DebateError, Result};
use crate::obs;
use crate::retry::with_retry;

impl Coordinator {
    /// Drive a scoped (or interrupted) task until a human has to act.
    ///
    /// Holds the task lease for the duration. Returns once the task is
    /// `awaiting_approval`, or earlier if it was cancelled underneath us.
    /// Store or queue failures that outlast their retries leave the task
    /// `failed` with a checkpoint that [`Coordinator::resume`] restores.
    #[instrument(skip(self))]
    pub async fn run_debate(&self, slug: &str) -> Result<TaskStatusView> {
        let retry = &self.config.storage_retry;
        let task = self.load(slug).await?;

        let ttl = chrono::Duration::from_std(
            self.config.debate_timeout() + self.config.round_timeout(),
        )
        .unwrap_or_else(|_| chrono::Duration::seconds(self.config.timeouts.debate_secs as i64));
        let now = Utc::now();
        let lease = TaskLease::new(task.id.clone(), &self.owner, now, ttl);
        let acquired = with_retry(retry, "try_acquire_lease", || {
            self.store.try_acquire_lease(lease.clone(), now)
        })
        .await?;
        if !acquired {
            return Err(DebateError::LeaseHeld {
                task_id: task.id.0.clone(),
            });
        }

        let task_id = task.id.clone();
        let result = self.drive(task).await;

        if let Err(e) = self.store.release_lease(&task_id, &self.owner).await {
            warn!(error = %e, task_id = %task_id, "lease release failed");
        }

        match result {
            Err(e) if e.is_infrastructure() => {
                if let Err(checkpoint_err) = self.checkpoint(slug, &e).await {
                    // The task keeps its last committed status; resume still works.
                    warn!(error = %checkpoint_err, "checkpoint write failed");
                }
                Err(e)
            }
            // Cancelled or otherwise moved by someone else mid-debate.
            Err(DebateError::Storage(StorageError::Conflict { entity: "task", .. })) => {
                let current = self.load(slug).await?;
                if current.status.is_terminal() {
                    Ok(TaskStatusView::from(&current))
                } else {
                    Err(DebateError::Precondition {
                        task_id: current.id.0.clone(),
                        status: current.status,
                        detail: "task changed while the debate was running".into(),
                    })
                }
            }
            other => other,
        }
    }

    async fn drive(&self, mut task: TaskRecord) -> Result<TaskStatusView> {
        match task.status {
            TaskStatus::Scoping => {
                task.debate_started_at = Some(Utc::now());
                self.move_to(&mut task, TaskStatus::Analyzing).await?;
            }
            TaskStatus::Analyzing | TaskStatus::Consensus => {}
            other => {
                return Err(DebateError::Precondition {
                    task_id: task.id.0.clone(),
                    status: other,
                    detail: "debate runs from scoping, analyzing or consensus".into(),
                })
            }
        }

        // Finish a round interrupted by a crash or storage outage first.
        if let Some(record) = self.recover_round(&mut task).await? {
            self.apply_decision(&mut task, &record).await?;
        }

        while task.status == TaskStatus::Analyzing {
            if self.dispatcher.cancels().is_cancelled(&task.id) {
                break;
            }
            if self.debate_expired(&task) {
                self.escalate(&mut task, EscalationReason::DebateDeadline)
                    .await?;
                break;
            }
            let record = self.advance_round(&mut task).await?;
            self.apply_decision(&mut task, &record).await?;
        }
        Ok(TaskStatusView::from(&task))
    }

    fn debate_expired(&self, task: &TaskRecord) -> bool {
        let Some(started) = task.debate_started_at else {
            return false;
        };
        (Utc::now() - started)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= self.config.debate_timeout())
    }

    /// Open the next round, wait for its runs and score it.
    ///
    /// Leaves the task in `consensus` with the round's result persisted.
    #[instrument(skip_all, fields(task_id = %task.id, round = task.current_round + 1))]
    pub async fn advance_round(&self, task: &mut TaskRecord) -> Result<ConsensusRecord> {
        if task.status != TaskStatus::Analyzing {
            return Err(DebateError::Precondition {
                task_id: task.id.0.clone(),
                status: task.status,
                detail: "rounds start only while analyzing".into(),
            });
        }
        let round_number = task.current_round + 1;
        let round = self.open_round(task, round_number).await?;
        task.current_round = round_number;
        task.updated_at = Utc::now();
        self.save(task, TaskStatus::Analyzing).await?;

        let roles = self.round_roles(task);
        let runs = self.dispatch_round(task, &round, &roles).await?;
        self.move_to(task, TaskStatus::Consensus).await?;
        self.conclude_round(task, &round, &runs).await
    }

    /// Pick up the current round if it never reached a decision.
    ///
    /// Required roles without a terminal run are enqueued again under the
    /// same idempotency key, so finished work is not repeated.
    async fn recover_round(&self, task: &mut TaskRecord) -> Result<Option<ConsensusRecord>> {
        if task.current_round == 0 {
            return Ok(None);
        }
        let retry = &self.config.storage_retry;
        let Some(round) = with_retry(retry, "find_round", || {
            self.store.find_round(&task.id, task.current_round)
        })
        .await?
        else {
            return Ok(None);
        };

        let decided = round.status != RoundStatus::InProgress;
        if decided && task.status == TaskStatus::Analyzing {
            return Ok(None);
        }
        info!(task_id = %task.id, round = round.round_number, "resuming interrupted round");

        let runs = if decided {
            with_retry(retry, "list_agent_runs", || self.store.list_agent_runs(&round.id)).await?
        } else {
            let roles = self.round_roles(task);
            self.dispatch_round(task, &round, &roles).await?
        };
        if task.status == TaskStatus::Analyzing {
            self.move_to(task, TaskStatus::Consensus).await?;
        }
        Ok(Some(self.conclude_round(task, &round, &runs).await?))
    }

    /// Record a round's decision on the task and move it on.
    async fn apply_decision(&self, task: &mut TaskRecord, record: &ConsensusRecord) -> Result<()> {
        task.last_consensus_score = if record.fast_track {
            None
        } else {
            Some(record.score)
        };
        match record.decision {
            Decision::ContinueDebate => self.move_to(task, TaskStatus::Analyzing).await,
            Decision::ProceedToApproval => {
                task.pending_escalation = false;
                task.escalation_reason = None;
                self.move_to(task, TaskStatus::AwaitingApproval).await
            }
            Decision::Escalate => {
                let reason = record
                    .escalation_reason
                    .unwrap_or(EscalationReason::InsufficientData);
                self.escalate(task, reason).await
            }
        }
    }

    async fn escalate(&self, task: &mut TaskRecord, reason: EscalationReason) -> Result<()> {
        task.pending_escalation = true;
        task.escalation_reason = Some(reason);
        self.move_to(task, TaskStatus::AwaitingApproval).await?;
        obs::emit_escalation(task.id.as_str(), task.current_round, reason);
        self.log(
            EventRecord::new(
                task.id.clone(),
                EventKind::EscalationRaised,
                format!("escalated: {reason}"),
            )
            .in_round(task.current_round)
            .with_details(json!({ "reason": reason.as_str() })),
        )
        .await;
        Ok(())
    }

    /// Mark the task `failed` with a checkpoint of where it stood.
    async fn checkpoint(&self, slug: &str, cause: &DebateError) -> Result<()> {
        let mut task = self.load(slug).await?;
        if task.status.is_terminal() {
            return Ok(());
        }
        let from = fail_with_checkpoint(&mut task, cause.to_string())?;
        self.save(&task, from).await?;
        obs::emit_task_checkpointed(task.id.as_str(), from, cause);
        self.dispatcher.cancels().clear(&task.id);
        self.log(obs::transition_event(&task.id, from, task.status)).await;
        Ok(())
    }

    /// Continue a task after a coordinator crash or a storage outage.
    ///
    /// A task failed by infrastructure exhaustion is restored from its
    /// checkpoint first. Tasks that are not in a debate phase are returned
    /// as they are.
    #[instrument(skip(self))]
    pub async fn resume(&self, slug: &str) -> Result<TaskStatusView> {
        let mut task = self.load(slug).await?;
        if task.status == TaskStatus::Failed {
            let from = restore_checkpoint(&mut task)?;
            self.save(&task, from).await?;
            obs::emit_task_transition(task.id.as_str(), from, task.status);
            self.log(obs::transition_event(&task.id, from, task.status)).await;
        }
        match task.status {
            TaskStatus::Scoping | TaskStatus::Analyzing | TaskStatus::Consensus => {
                self.run_debate(slug).await
            }
            _ => Ok(TaskStatusView::from(&task)),
        }
    }
}
