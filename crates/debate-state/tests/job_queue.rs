//! Contract tests for the in-memory consumer-group stream.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use debate_state::*;

fn envelope(role: Role) -> JobEnvelope {
    JobEnvelope {
        job_id: uuid::Uuid::new_v4().to_string(),
        task_id: TaskId::new(),
        round_number: 1,
        role,
        model: "model-a".into(),
        attempt: 1,
        idempotency_key: format!("key-{role}"),
        context_reference: ContentDigest::from_bytes(b"ctx"),
        enqueued_at: Utc::now(),
        failure: None,
    }
}

#[tokio::test]
async fn entries_are_delivered_once_per_group() {
    let queue = MemoryJobQueue::new();
    queue
        .append(ANALYSIS_STREAM, envelope(Role::PlannerPrimary))
        .await
        .unwrap();
    queue
        .append(ANALYSIS_STREAM, envelope(Role::PlannerSecondary))
        .await
        .unwrap();

    let a = queue
        .read_group(ANALYSIS_STREAM, WORKER_GROUP, "a", 1, Duration::ZERO)
        .await
        .unwrap();
    let b = queue
        .read_group(ANALYSIS_STREAM, WORKER_GROUP, "b", 10, Duration::ZERO)
        .await
        .unwrap();
    let c = queue
        .read_group(ANALYSIS_STREAM, WORKER_GROUP, "c", 10, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(a.len(), 1);
    assert_eq!(a[0].envelope.role, Role::PlannerPrimary);
    assert_eq!(b.len(), 1);
    assert_eq!(b[0].envelope.role, Role::PlannerSecondary);
    assert!(c.is_empty());
}

#[tokio::test]
async fn ack_removes_entry_and_rejects_unknown_ids() {
    let queue = MemoryJobQueue::new();
    queue
        .append(ANALYSIS_STREAM, envelope(Role::Reviewer))
        .await
        .unwrap();
    let delivered = queue
        .read_group(ANALYSIS_STREAM, WORKER_GROUP, "a", 1, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(queue.len(ANALYSIS_STREAM).await.unwrap(), 1);

    queue
        .ack(ANALYSIS_STREAM, WORKER_GROUP, &delivered[0].message_id)
        .await
        .unwrap();
    assert_eq!(queue.len(ANALYSIS_STREAM).await.unwrap(), 0);

    let err = queue
        .ack(ANALYSIS_STREAM, WORKER_GROUP, &delivered[0].message_id)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::UnknownMessage { .. }));
}

#[tokio::test(start_paused = true)]
async fn unacked_entries_are_reclaimed_after_idle() {
    let queue = MemoryJobQueue::new();
    queue
        .append(ANALYSIS_STREAM, envelope(Role::Implementer))
        .await
        .unwrap();
    let first = queue
        .read_group(ANALYSIS_STREAM, WORKER_GROUP, "crashed", 1, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(first[0].delivery_count, 1);

    let early = queue
        .reclaim_stale(ANALYSIS_STREAM, WORKER_GROUP, "rescuer", Duration::from_secs(30), 10)
        .await
        .unwrap();
    assert!(early.is_empty());

    tokio::time::advance(Duration::from_secs(31)).await;
    let reclaimed = queue
        .reclaim_stale(ANALYSIS_STREAM, WORKER_GROUP, "rescuer", Duration::from_secs(30), 10)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].message_id, first[0].message_id);
    assert_eq!(reclaimed[0].delivery_count, 2);
}

#[tokio::test]
async fn append_fails_when_stream_is_full() {
    let queue = MemoryJobQueue::new().with_max_depth(ANALYSIS_STREAM, 2);
    queue
        .append(ANALYSIS_STREAM, envelope(Role::PlannerPrimary))
        .await
        .unwrap();
    queue
        .append(ANALYSIS_STREAM, envelope(Role::PlannerSecondary))
        .await
        .unwrap();
    let err = queue
        .append(ANALYSIS_STREAM, envelope(Role::Reviewer))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::QueueFull { depth: 2, .. }));

    // Other streams are unaffected.
    queue
        .append(DEAD_LETTER_STREAM, envelope(Role::Reviewer))
        .await
        .unwrap();
}

#[tokio::test]
async fn blocking_read_wakes_on_append() {
    let queue = Arc::new(MemoryJobQueue::new());
    let reader = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            queue
                .read_group(ANALYSIS_STREAM, WORKER_GROUP, "a", 1, Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue
        .append(ANALYSIS_STREAM, envelope(Role::Explorer))
        .await
        .unwrap();

    let delivered = reader.await.unwrap().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].envelope.role, Role::Explorer);
}

#[tokio::test]
async fn entries_snapshot_lists_dead_letters() {
    let queue = MemoryJobQueue::new();
    let mut dead = envelope(Role::Reviewer);
    dead.failure = Some("invalid output".into());
    queue.append(DEAD_LETTER_STREAM, dead.clone()).await.unwrap();

    let entries = queue.entries(DEAD_LETTER_STREAM).await.unwrap();
    assert_eq!(entries, vec![dead]);
}
