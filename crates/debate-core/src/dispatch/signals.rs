//! In-process signals between workers and the coordinator.
//!
//! Workers publish [`RunSettled`] after a run's terminal state is durable;
//! the coordinator's round barrier waits on it instead of polling the store.
//! [`CancelRegistry`] carries cancellation the other way: per task when a
//! task is cancelled, per run when a round deadline settles a run whose
//! executor call is still going.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::{broadcast, watch};

use debate_state::{AgentRunStatus, Role, TaskId};

const SIGNAL_CAPACITY: usize = 256;

/// An agent run reached a terminal status.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettled {
    pub task_id: TaskId,
    pub round_number: u32,
    pub role: Role,
    pub status: AgentRunStatus,
}

#[derive(Debug, Clone)]
pub struct RoundSignals {
    tx: broadcast::Sender<RunSettled>,
}

impl Default for RoundSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundSignals {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunSettled> {
        self.tx.subscribe()
    }

    pub fn publish(&self, settled: RunSettled) {
        // No barrier waiting is fine: the store is the source of truth.
        let _ = self.tx.send(settled);
    }
}

type Flags = Mutex<HashMap<String, watch::Sender<bool>>>;

fn subscribe(flags: &Flags, key: &str) -> watch::Receiver<bool> {
    let mut flags = flags.lock().unwrap_or_else(PoisonError::into_inner);
    flags
        .entry(key.to_string())
        .or_insert_with(|| watch::channel(false).0)
        .subscribe()
}

fn raise(flags: &Flags, key: &str) {
    let mut flags = flags.lock().unwrap_or_else(PoisonError::into_inner);
    flags
        .entry(key.to_string())
        .or_insert_with(|| watch::channel(false).0)
        .send_replace(true);
}

fn drop_flag(flags: &Flags, key: &str) {
    let mut flags = flags.lock().unwrap_or_else(PoisonError::into_inner);
    flags.remove(key);
}

/// Cancellation flags: one per task, and one per run keyed by idempotency
/// key for runs settled while their executor call is still in flight.
///
/// Dropping a flag leaves already raised receivers reading `true`.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tasks: Flags,
    runs: Flags,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A receiver that flips to `true` once `task_id` is cancelled.
    pub fn token(&self, task_id: &TaskId) -> watch::Receiver<bool> {
        subscribe(&self.tasks, task_id.as_str())
    }

    pub fn cancel(&self, task_id: &TaskId) {
        raise(&self.tasks, task_id.as_str());
    }

    pub fn is_cancelled(&self, task_id: &TaskId) -> bool {
        let flags = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        flags.get(task_id.as_str()).is_some_and(|tx| *tx.borrow())
    }

    /// Drop the flag once the task is settled.
    pub fn clear(&self, task_id: &TaskId) {
        drop_flag(&self.tasks, task_id.as_str());
    }

    /// A receiver that flips to `true` once the run under `key` is abandoned.
    pub fn run_token(&self, key: &str) -> watch::Receiver<bool> {
        subscribe(&self.runs, key)
    }

    pub fn cancel_run(&self, key: &str) {
        raise(&self.runs, key);
    }

    pub fn clear_run(&self, key: &str) {
        drop_flag(&self.runs, key);
    }

    /// Task and run flags currently held.
    pub fn tracked(&self) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len();
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner).len();
        tasks + runs
    }
}

/// Resolves when `token` reads `true`; never resolves if the flag is dropped.
pub async fn cancelled(token: &mut watch::Receiver<bool>) {
    if token.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
