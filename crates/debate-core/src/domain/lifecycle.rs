//! Task lifecycle graph.
//!
//! ```text
//! created -> [exploring] -> scoping -> analyzing <-> consensus -> awaiting_approval
//!                                          ^                           |
//!                                          +------- revise ------------+
//! awaiting_approval -> implementing -> verifying -> completed
//!                          ^               |
//!                          +-- rework -----+
//! any non-terminal -> failed | cancelled
//! ```
//!
//! `analyzing -> awaiting_approval` is the forced decision taken when the
//! debate deadline elapses before a round can start.

use chrono::Utc;

use debate_state::{TaskCheckpoint, TaskRecord, TaskStatus};

use crate::error::{DebateError, Result};

/// Whether the graph has an edge `from -> to`.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    if from.is_terminal() {
        return false;
    }
    if matches!(to, Failed | Cancelled) {
        return true;
    }
    matches!(
        (from, to),
        (Created, Exploring)
            | (Created, Scoping)
            | (Exploring, Scoping)
            | (Scoping, Analyzing)
            | (Analyzing, Consensus)
            | (Analyzing, AwaitingApproval)
            | (Consensus, Analyzing)
            | (Consensus, AwaitingApproval)
            | (AwaitingApproval, Analyzing)
            | (AwaitingApproval, Implementing)
            | (Implementing, Verifying)
            | (Verifying, Implementing)
            | (Verifying, Completed)
    )
}

/// Move `task` to `to`, returning the status it left.
///
/// The returned status is what the store's compare-and-set must expect.
pub fn transition(task: &mut TaskRecord, to: TaskStatus) -> Result<TaskStatus> {
    let from = task.status;
    if !can_transition(from, to) {
        return Err(DebateError::InvalidTransition {
            task_id: task.id.0.clone(),
            from,
            to,
        });
    }
    task.status = to;
    task.updated_at = Utc::now();
    Ok(from)
}

/// Move `task` to `Failed`, recording where it was so it can be resumed.
pub fn fail_with_checkpoint(task: &mut TaskRecord, reason: impl Into<String>) -> Result<TaskStatus> {
    let reason = reason.into();
    let checkpoint = TaskCheckpoint {
        status: task.status,
        current_round: task.current_round,
        reason: reason.clone(),
        taken_at: Utc::now(),
    };
    let from = transition(task, TaskStatus::Failed)?;
    task.checkpoint = Some(checkpoint);
    task.failure_reason = Some(reason);
    Ok(from)
}

/// Restore a failed task to its checkpointed status.
pub fn restore_checkpoint(task: &mut TaskRecord) -> Result<TaskStatus> {
    if task.status != TaskStatus::Failed {
        return Err(DebateError::Precondition {
            task_id: task.id.0.clone(),
            status: task.status,
            detail: "only failed tasks can be restored from a checkpoint".into(),
        });
    }
    let Some(checkpoint) = task.checkpoint.take() else {
        return Err(DebateError::Precondition {
            task_id: task.id.0.clone(),
            status: task.status,
            detail: "task has no resumable checkpoint".into(),
        });
    };
    task.status = checkpoint.status;
    task.current_round = checkpoint.current_round;
    task.failure_reason = None;
    task.updated_at = Utc::now();
    Ok(TaskStatus::Failed)
}
