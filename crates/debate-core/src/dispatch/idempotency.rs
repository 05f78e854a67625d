//! Deterministic idempotency keys.

use sha2::{Digest, Sha256};

use debate_state::{JobEnvelope, Role, TaskId};

/// Key of one logical unit of agent work.
///
/// SHA-256 of `task_id:round_number:role:epoch`, hex encoded. The same
/// inputs always produce the same key, so re-enqueuing collapses onto the
/// existing agent run.
pub fn idempotency_key(task_id: &TaskId, round_number: u32, role: Role, epoch: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{task_id}:{round_number}:{role}:{epoch}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether an envelope's key matches its own coordinates.
pub fn envelope_key_matches(envelope: &JobEnvelope) -> bool {
    idempotency_key(
        &envelope.task_id,
        envelope.round_number,
        envelope.role,
        envelope.attempt,
    ) == envelope.idempotency_key
}
