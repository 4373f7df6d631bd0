//! Integration tests for the task queue.
//!
//! These tests verify TaskQueue operations against a real SQLite file,
//! including several independent connection pools sharing one database
//! the way separate worker processes do.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mediafetch_core::{
    CancelOutcome, Database, ErrorKind, ExtractError, FailureCause, ManualClock, NewTask,
    Platform, Quality, SharedClock, TaskError, TaskQueue, TaskState,
};
use tempfile::TempDir;

/// Helper to create a test database with migrations applied.
async fn setup_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("queue.db")).await.unwrap();
    (db, temp_dir)
}

fn new_task(i: usize) -> NewTask {
    NewTask {
        url: format!("https://www.youtube.com/watch?v={i}"),
        platform: Platform::YouTube,
        quality: Quality::Height(720),
        client_key: None,
    }
}

fn network_error() -> TaskError {
    TaskError::from_extract(&ExtractError::retryable(FailureCause::Network, "reset"))
}

// ==================== Concurrency ====================

#[tokio::test]
async fn test_concurrent_claims_across_pools_are_exclusive() {
    let (db, temp_dir) = setup_test_db().await;
    let clock: SharedClock = Arc::new(ManualClock::new(1_000));
    let first = TaskQueue::new(db, Arc::clone(&clock));
    // A second pool on the same file stands in for another worker process.
    let other_db = Database::new(&temp_dir.path().join("queue.db")).await.unwrap();
    let second = TaskQueue::new(other_db, Arc::clone(&clock));

    for i in 0..20 {
        first.enqueue(&new_task(i)).await.unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..8 {
        let queue = if worker % 2 == 0 {
            first.clone()
        } else {
            second.clone()
        };
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(task) = queue.claim_next().await.unwrap() {
                claimed.push(task.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 20, "every task claimed exactly once");
    assert_eq!(unique.len(), 20, "no task claimed twice");
    assert_eq!(first.count_by_state(TaskState::Progress).await.unwrap(), 20);
    assert!(second.claim_next().await.unwrap().is_none());
}

// ==================== Crash Recovery ====================

#[tokio::test]
async fn test_stale_progress_tasks_are_requeued_then_failed() {
    let (db, _temp_dir) = setup_test_db().await;
    let clock = Arc::new(ManualClock::new(1_000));
    let queue = TaskQueue::new(db, clock.clone());

    let task = queue.enqueue(&new_task(1)).await.unwrap();
    queue.claim_next().await.unwrap().unwrap();

    // Not stale yet.
    let recovered = queue
        .requeue_stale(Duration::from_secs(60), 2)
        .await
        .unwrap();
    assert!(recovered.is_empty());

    clock.advance(Duration::from_secs(61));
    let recovered = queue
        .requeue_stale(Duration::from_secs(60), 2)
        .await
        .unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].state(), TaskState::Retry);
    assert_eq!(recovered[0].error().unwrap().cause, FailureCause::Timeout);

    // Second attempt also dies; attempts are now exhausted.
    let claimed = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, task.id);
    assert_eq!(claimed.attempt_count, 2);
    clock.advance(Duration::from_secs(61));
    let recovered = queue
        .requeue_stale(Duration::from_secs(60), 2)
        .await
        .unwrap();
    assert_eq!(recovered[0].state(), TaskState::Failure);
    assert!(!queue.has_unfinished().await.unwrap());
}

// ==================== Cancellation ====================

#[tokio::test]
async fn test_cancel_during_progress_lands_in_failure_on_next_write() {
    let (db, _temp_dir) = setup_test_db().await;
    let clock: SharedClock = Arc::new(ManualClock::new(1_000));
    let queue = TaskQueue::new(db, clock);

    let task = queue.enqueue(&new_task(1)).await.unwrap();
    queue.claim_next().await.unwrap().unwrap();

    let outcome = queue.cancel(&task.id).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::CancelRequested(_)));
    assert_eq!(outcome.task().state(), TaskState::Progress);

    // The running attempt fails transiently; the flag turns that into a terminal cancel.
    let after = queue
        .mark_retry(&task.id, &network_error(), 2_000)
        .await
        .unwrap();
    assert_eq!(after.state(), TaskState::Failure);
    let error = after.error().unwrap();
    assert_eq!(error.error_kind, ErrorKind::Cancelled);
    assert!(error.message.contains("reset"));
}

#[tokio::test]
async fn test_retry_tasks_wait_for_run_after() {
    let (db, _temp_dir) = setup_test_db().await;
    let clock = Arc::new(ManualClock::new(1_000));
    let queue = TaskQueue::new(db, clock.clone());

    let task = queue.enqueue(&new_task(1)).await.unwrap();
    queue.claim_next().await.unwrap().unwrap();
    queue
        .mark_retry(&task.id, &network_error(), 5_000)
        .await
        .unwrap();

    assert!(queue.claim_next().await.unwrap().is_none());
    assert_eq!(queue.next_due_at().await.unwrap(), Some(5_000));

    clock.set(5_000);
    let claimed = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, task.id);
    assert_eq!(claimed.attempt_count, 2);
}
