//! Durable task queue and status store.
//!
//! Tasks live in the `tasks` table of the shared `SQLite` database. The table
//! is both the work queue (workers claim runnable rows) and the status store
//! (clients poll it). Every transition is a single conditional
//! `UPDATE … WHERE state IN (…) RETURNING *`, so two workers racing for the
//! same row cannot both win, and a terminal row is never rewritten.
//!
//! # Overview
//!
//! - [`TaskQueue`] - enqueue, claim, and transition tasks
//! - [`Task`] - one row of the status store
//! - [`TaskState`] - lifecycle states and the allowed edges between them
//! - [`QueueError`] - operation error types
//!
//! # Example
//!
//! ```ignore
//! let queue = TaskQueue::new(db, SystemClock::shared());
//! let task = queue.enqueue(&new_task).await?;
//!
//! if let Some(task) = queue.claim_next().await? {
//!     // ... run the extractor ...
//!     queue.complete(&task.id, &result).await?;
//! }
//! ```

mod error;
mod history;
mod item;

pub use error::{QueueDbErrorKind, QueueError};
pub use history::{HistoryEntry, HistoryQuery, HistoryStatus, HistorySummary, MAX_HISTORY_LIMIT};
pub use item::{ErrorKind, MediaLocator, NewTask, Task, TaskError, TaskResult, TaskState};

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{SharedClock, duration_ms};
use crate::db::Database;
use crate::extractor::FailureCause;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Attempts before `cancel` gives up chasing a row that keeps changing state.
const CANCEL_RACE_ATTEMPTS: usize = 3;

/// Outcome of an administrative cancellation.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The task was `PENDING` or `RETRY` and is now `FAILURE`.
    Cancelled(Task),
    /// The task is running; it will not be retried once the attempt returns.
    CancelRequested(Task),
    /// Nothing to do: the task had already finished.
    AlreadyTerminal(Task),
}

impl CancelOutcome {
    #[must_use]
    pub fn task(&self) -> &Task {
        match self {
            Self::Cancelled(task) | Self::CancelRequested(task) | Self::AlreadyTerminal(task) => {
                task
            }
        }
    }

    /// Short label used in CLI and log output.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled(_) => "cancelled",
            Self::CancelRequested(_) => "cancel_requested",
            Self::AlreadyTerminal(_) => "already_terminal",
        }
    }
}

/// Number of tasks in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: i64,
    pub progress: i64,
    pub retry: i64,
    pub success: i64,
    pub failure: i64,
}

impl TaskCounts {
    #[must_use]
    pub fn total(&self) -> i64 {
        self.pending + self.progress + self.retry + self.success + self.failure
    }

    fn slot(&mut self, state: TaskState) -> &mut i64 {
        match state {
            TaskState::Pending => &mut self.pending,
            TaskState::Progress => &mut self.progress,
            TaskState::Retry => &mut self.retry,
            TaskState::Success => &mut self.success,
            TaskState::Failure => &mut self.failure,
        }
    }
}

/// Queue manager for download tasks.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    db: Database,
    clock: SharedClock,
}

impl TaskQueue {
    #[must_use]
    pub fn new(db: Database, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    #[must_use]
    pub fn db(&self) -> &Database {
        &self.db
    }

    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Inserts a new `PENDING` task, immediately runnable.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the insert fails.
    #[instrument(skip(self, new_task), fields(url = %new_task.url, platform = %new_task.platform))]
    pub async fn enqueue(&self, new_task: &NewTask) -> Result<Task> {
        let id = Uuid::new_v4().to_string();
        let now = self.clock.now_ms();
        let task = sqlx::query_as::<_, Task>(
            r"INSERT INTO tasks (
                id, url, platform, requested_quality, client_key,
                state, attempt_count, cancel_requested, run_after,
                created_at, updated_at
              )
              VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?)
              RETURNING *",
        )
        .bind(&id)
        .bind(&new_task.url)
        .bind(new_task.platform.as_str())
        .bind(new_task.quality.to_string())
        .bind(new_task.client_key.as_deref())
        .bind(TaskState::Pending.as_str())
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;

        info!(task_id = %task.id, "task enqueued");
        Ok(task)
    }

    /// Gets a task by id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(r"SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(task)
    }

    /// Claims the earliest due runnable task, moving it to `PROGRESS`.
    ///
    /// Runnable means `PENDING` or `RETRY`, not cancelled, with `run_after`
    /// in the past. The claim increments `attempt_count`. Returns `None` when
    /// nothing is due or another worker won the race for the candidate row.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn claim_next(&self) -> Result<Option<Task>> {
        let now = self.clock.now_ms();
        // The outer state guard makes the claim a no-op if another worker
        // moved the row between the subquery and the update.
        let task = sqlx::query_as::<_, Task>(
            r"UPDATE tasks
              SET state = 'PROGRESS',
                  attempt_count = attempt_count + 1,
                  started_at = COALESCE(started_at, ?1),
                  updated_at = ?1
              WHERE id = (
                  SELECT id FROM tasks
                  WHERE state IN ('PENDING', 'RETRY')
                    AND cancel_requested = 0
                    AND run_after <= ?1
                  ORDER BY run_after ASC, created_at ASC
                  LIMIT 1
              )
                AND state IN ('PENDING', 'RETRY')
              RETURNING *",
        )
        .bind(now)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(ref task) = task {
            debug!(task_id = %task.id, attempt = task.attempt_count, "task claimed");
        }
        Ok(task)
    }

    /// Claims one specific task if it is runnable now.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn claim(&self, id: &str) -> Result<Option<Task>> {
        let now = self.clock.now_ms();
        let task = sqlx::query_as::<_, Task>(
            r"UPDATE tasks
              SET state = 'PROGRESS',
                  attempt_count = attempt_count + 1,
                  started_at = COALESCE(started_at, ?1),
                  updated_at = ?1
              WHERE id = ?2
                AND state IN ('PENDING', 'RETRY')
                AND cancel_requested = 0
                AND run_after <= ?1
              RETURNING *",
        )
        .bind(now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(task)
    }

    /// Records a transient failure and schedules the next attempt.
    ///
    /// If cancellation was requested while the attempt ran, the task goes
    /// to `FAILURE` with a `Cancelled` error instead, in the same statement.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] if the task is not in
    /// `PROGRESS`, or [`QueueError::TaskNotFound`].
    #[instrument(skip(self, error), fields(cause = %error.cause.as_str()))]
    pub async fn mark_retry(&self, id: &str, error: &TaskError, run_after: i64) -> Result<Task> {
        let now = self.clock.now_ms();
        let error_json = serde_json::to_string(error)?;
        let cancelled_json = serde_json::to_string(&TaskError::cancelled(format!(
            "cancelled while running; last error: {}",
            error.message
        )))?;

        let task = sqlx::query_as::<_, Task>(
            r"UPDATE tasks
              SET state = CASE WHEN cancel_requested = 1 THEN 'FAILURE' ELSE 'RETRY' END,
                  error = CASE WHEN cancel_requested = 1 THEN ?1 ELSE ?2 END,
                  completed_at = CASE WHEN cancel_requested = 1 THEN ?3 ELSE NULL END,
                  run_after = ?4,
                  updated_at = ?3
              WHERE id = ?5 AND state = 'PROGRESS'
              RETURNING *",
        )
        .bind(cancelled_json)
        .bind(error_json)
        .bind(now)
        .bind(run_after)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        match task {
            Some(task) => {
                info!(task_id = %task.id, state = %task.state(), run_after, "attempt failed");
                Ok(task)
            }
            None => Err(self.transition_error(id, TaskState::Retry).await),
        }
    }

    /// Moves a running task to `SUCCESS`, storing its result in the same write.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] if the task is not in
    /// `PROGRESS`, or [`QueueError::TaskNotFound`].
    #[instrument(skip(self, result))]
    pub async fn complete(&self, id: &str, result: &TaskResult) -> Result<Task> {
        let now = self.clock.now_ms();
        let result_json = serde_json::to_string(result)?;
        let task = sqlx::query_as::<_, Task>(
            r"UPDATE tasks
              SET state = 'SUCCESS', result = ?, error = NULL,
                  completed_at = ?, updated_at = ?
              WHERE id = ? AND state = 'PROGRESS'
              RETURNING *",
        )
        .bind(result_json)
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        match task {
            Some(task) => {
                info!(task_id = %task.id, attempts = task.attempt_count, "task succeeded");
                Ok(task)
            }
            None => Err(self.transition_error(id, TaskState::Success).await),
        }
    }

    /// Moves a running task to `FAILURE`, keeping `error` as the final error.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] if the task is not in
    /// `PROGRESS`, or [`QueueError::TaskNotFound`].
    #[instrument(skip(self, error), fields(kind = %error.error_kind))]
    pub async fn fail(&self, id: &str, error: &TaskError) -> Result<Task> {
        let now = self.clock.now_ms();
        let error_json = serde_json::to_string(error)?;
        let task = sqlx::query_as::<_, Task>(
            r"UPDATE tasks
              SET state = 'FAILURE', error = ?, completed_at = ?, updated_at = ?
              WHERE id = ? AND state = 'PROGRESS'
              RETURNING *",
        )
        .bind(error_json)
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        match task {
            Some(task) => {
                warn!(
                    task_id = %task.id,
                    attempts = task.attempt_count,
                    message = %error.message,
                    "task failed"
                );
                Ok(task)
            }
            None => Err(self.transition_error(id, TaskState::Failure).await),
        }
    }

    /// Administrative cancellation.
    ///
    /// `PENDING` and `RETRY` tasks fail immediately. A `PROGRESS` task only
    /// gets its cancel flag set: the running attempt is not interrupted, but
    /// it will not be retried.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::TaskNotFound`] for an unknown id.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &str) -> Result<CancelOutcome> {
        let error_json = serde_json::to_string(&TaskError::cancelled("cancelled by administrator"))?;

        for _ in 0..CANCEL_RACE_ATTEMPTS {
            let task = self
                .get(id)
                .await?
                .ok_or_else(|| QueueError::TaskNotFound(id.to_string()))?;
            let now = self.clock.now_ms();

            match task.state() {
                TaskState::Success | TaskState::Failure => {
                    return Ok(CancelOutcome::AlreadyTerminal(task));
                }
                TaskState::Pending | TaskState::Retry => {
                    let cancelled = sqlx::query_as::<_, Task>(
                        r"UPDATE tasks
                          SET state = 'FAILURE', error = ?, cancel_requested = 1,
                              completed_at = ?, updated_at = ?
                          WHERE id = ? AND state IN ('PENDING', 'RETRY')
                          RETURNING *",
                    )
                    .bind(&error_json)
                    .bind(now)
                    .bind(now)
                    .bind(id)
                    .fetch_optional(self.db.pool())
                    .await?;
                    if let Some(task) = cancelled {
                        info!(task_id = %task.id, "task cancelled");
                        return Ok(CancelOutcome::Cancelled(task));
                    }
                }
                TaskState::Progress => {
                    let flagged = sqlx::query_as::<_, Task>(
                        r"UPDATE tasks
                          SET cancel_requested = 1
                          WHERE id = ? AND state = 'PROGRESS'
                          RETURNING *",
                    )
                    .bind(id)
                    .fetch_optional(self.db.pool())
                    .await?;
                    if let Some(task) = flagged {
                        info!(task_id = %task.id, "cancel requested for running task");
                        return Ok(CancelOutcome::CancelRequested(task));
                    }
                }
            }
            debug!(task_id = id, "task changed state during cancel, re-reading");
        }

        let task = self
            .get(id)
            .await?
            .ok_or_else(|| QueueError::TaskNotFound(id.to_string()))?;
        if task.state().is_terminal() {
            Ok(CancelOutcome::AlreadyTerminal(task))
        } else {
            Err(QueueError::InvalidTransition {
                task_id: id.to_string(),
                from: task.state(),
                to: TaskState::Failure,
            })
        }
    }

    /// Recovers tasks stuck in `PROGRESS` after a worker died.
    ///
    /// A task whose last update is at least `older_than` ago goes back to
    /// `RETRY` (runnable now), or to `FAILURE` once it has used
    /// `max_attempts` or had cancellation requested.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn requeue_stale(&self, older_than: Duration, max_attempts: u32) -> Result<Vec<Task>> {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(duration_ms(older_than));
        let stale_json = serde_json::to_string(&TaskError {
            error_kind: ErrorKind::TransientExtractionError,
            cause: FailureCause::Timeout,
            message: "worker stopped before the attempt finished".to_string(),
        })?;
        let cancelled_json =
            serde_json::to_string(&TaskError::cancelled("cancelled while running"))?;

        let tasks = sqlx::query_as::<_, Task>(
            r"UPDATE tasks
              SET state = CASE
                      WHEN cancel_requested = 1 OR attempt_count >= ?1 THEN 'FAILURE'
                      ELSE 'RETRY'
                  END,
                  error = CASE WHEN cancel_requested = 1 THEN ?2 ELSE ?3 END,
                  completed_at = CASE
                      WHEN cancel_requested = 1 OR attempt_count >= ?1 THEN ?4
                      ELSE NULL
                  END,
                  run_after = ?4,
                  updated_at = ?4
              WHERE state = 'PROGRESS' AND updated_at <= ?5
              RETURNING *",
        )
        .bind(i64::from(max_attempts))
        .bind(cancelled_json)
        .bind(stale_json)
        .bind(now)
        .bind(cutoff)
        .fetch_all(self.db.pool())
        .await?;

        for task in &tasks {
            warn!(task_id = %task.id, state = %task.state(), "recovered stale task");
        }
        Ok(tasks)
    }

    /// Counts tasks in the given state.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_state(&self, state: TaskState) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(r"SELECT COUNT(*) FROM tasks WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }

    /// Task totals for every state in one query.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn task_counts(&self) -> Result<TaskCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as(r"SELECT state, COUNT(*) FROM tasks GROUP BY state")
                .fetch_all(self.db.pool())
                .await?;
        let mut counts = TaskCounts::default();
        for (state, count) in rows {
            match state.parse::<TaskState>() {
                Ok(state) => *counts.slot(state) += count,
                Err(_) => warn!(%state, count, "ignoring tasks in unknown state"),
            }
        }
        Ok(counts)
    }

    /// Returns whether any task is `PENDING`, `PROGRESS` or `RETRY`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    pub async fn has_unfinished(&self) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            r"SELECT 1 FROM tasks WHERE state IN ('PENDING', 'PROGRESS', 'RETRY') LIMIT 1",
        )
        .fetch_optional(self.db.pool())
        .await?;
        Ok(found.is_some())
    }

    /// Earliest `run_after` among runnable tasks, if any.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    pub async fn next_due_at(&self) -> Result<Option<i64>> {
        let due: Option<i64> = sqlx::query_scalar(
            r"SELECT MIN(run_after) FROM tasks
              WHERE state IN ('PENDING', 'RETRY') AND cancel_requested = 0",
        )
        .fetch_one(self.db.pool())
        .await?;
        Ok(due)
    }

    async fn transition_error(&self, id: &str, to: TaskState) -> QueueError {
        match self.get(id).await {
            Ok(Some(task)) => QueueError::InvalidTransition {
                task_id: id.to_string(),
                from: task.state(),
                to,
            },
            Ok(None) => QueueError::TaskNotFound(id.to_string()),
            Err(error) => error,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::extractor::{ExtractError, Quality};
    use crate::platform::Platform;

    async fn setup() -> (Arc<ManualClock>, TaskQueue) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let db = Database::new_in_memory().await.unwrap();
        (clock.clone(), TaskQueue::new(db, clock))
    }

    fn new_task(url: &str) -> NewTask {
        NewTask {
            url: url.to_string(),
            platform: Platform::YouTube,
            quality: Quality::Height(720),
            client_key: Some("127.0.0.1".to_string()),
        }
    }

    fn timeout_error() -> TaskError {
        TaskError::from_extract(&ExtractError::retryable(FailureCause::Timeout, "timed out"))
    }

    // ==================== Enqueue / Get ====================

    #[tokio::test]
    async fn test_enqueue_creates_pending_task() {
        let (_clock, queue) = setup().await;
        let task = queue.enqueue(&new_task("https://youtube.com/watch?v=abc")).await.unwrap();

        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.attempt_count, 0);
        assert_eq!(task.platform(), Some(Platform::YouTube));
        assert_eq!(task.quality(), Quality::Height(720));
        assert_eq!(task.created_at, 1_000_000);
        assert!(task.result().is_none());

        let fetched = queue.get(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
    }

    #[tokio::test]
    async fn test_get_unknown_returns_none() {
        let (_clock, queue) = setup().await;
        assert!(queue.get("nope").await.unwrap().is_none());
    }

    // ==================== Claim ====================

    #[tokio::test]
    async fn test_claim_next_moves_to_progress_and_counts_attempt() {
        let (_clock, queue) = setup().await;
        let task = queue.enqueue(&new_task("https://youtu.be/a")).await.unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.state(), TaskState::Progress);
        assert_eq!(claimed.attempt_count, 1);
        assert!(claimed.started_at.is_some());

        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_next_is_fifo() {
        let (clock, queue) = setup().await;
        let first = queue.enqueue(&new_task("https://youtu.be/1")).await.unwrap();
        clock.advance(Duration::from_millis(5));
        let second = queue.enqueue(&new_task("https://youtu.be/2")).await.unwrap();

        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, first.id);
        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_claim_same_task_twice_only_one_wins() {
        let (_clock, queue) = setup().await;
        let task = queue.enqueue(&new_task("https://youtu.be/a")).await.unwrap();

        assert!(queue.claim(&task.id).await.unwrap().is_some());
        assert!(queue.claim(&task.id).await.unwrap().is_none());
    }

    // ==================== Retry / Complete / Fail ====================

    #[tokio::test]
    async fn test_retry_waits_for_run_after() {
        let (clock, queue) = setup().await;
        let task = queue.enqueue(&new_task("https://youtu.be/a")).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        let retried = queue
            .mark_retry(&task.id, &timeout_error(), clock.now_ms() + 5_000)
            .await
            .unwrap();
        assert_eq!(retried.state(), TaskState::Retry);
        assert_eq!(retried.error().unwrap().cause, FailureCause::Timeout);

        assert!(queue.claim_next().await.unwrap().is_none());
        clock.advance(Duration::from_secs(5));
        let again = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(again.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_complete_stores_result_atomically() {
        let (_clock, queue) = setup().await;
        let task = queue.enqueue(&new_task("https://youtu.be/a")).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        let result = TaskResult {
            title: Some("clip".to_string()),
            author: None,
            duration_secs: Some(12.5),
            requested_quality: Quality::Height(720),
            delivered_quality: Quality::Height(720),
            quality_substituted: false,
            media: vec![],
        };
        let done = queue.complete(&task.id, &result).await.unwrap();
        assert_eq!(done.state(), TaskState::Success);
        assert_eq!(done.result().unwrap(), result);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_task_rejects_further_transitions() {
        let (clock, queue) = setup().await;
        let task = queue.enqueue(&new_task("https://youtu.be/a")).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();
        queue.fail(&task.id, &timeout_error()).await.unwrap();

        let err = queue
            .mark_retry(&task.id, &timeout_error(), clock.now_ms())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: TaskState::Failure,
                to: TaskState::Retry,
                ..
            }
        ));
        assert!(queue.claim(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_on_unknown_task_is_not_found() {
        let (_clock, queue) = setup().await;
        let err = queue.fail("missing", &timeout_error()).await.unwrap_err();
        assert!(matches!(err, QueueError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_complete_requires_progress() {
        let (_clock, queue) = setup().await;
        let task = queue.enqueue(&new_task("https://youtu.be/a")).await.unwrap();
        let result = TaskResult {
            title: None,
            author: None,
            duration_secs: None,
            requested_quality: Quality::Best,
            delivered_quality: Quality::Best,
            quality_substituted: false,
            media: vec![],
        };
        let err = queue.complete(&task.id, &result).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: TaskState::Pending,
                ..
            }
        ));
    }

    // ==================== Cancel ====================

    #[tokio::test]
    async fn test_cancel_pending_fails_task() {
        let (_clock, queue) = setup().await;
        let task = queue.enqueue(&new_task("https://youtu.be/a")).await.unwrap();

        let outcome = queue.cancel(&task.id).await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Cancelled(_)));
        assert_eq!(outcome.task().state(), TaskState::Failure);
        assert_eq!(outcome.task().error().unwrap().error_kind, ErrorKind::Cancelled);
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_running_task_blocks_retry() {
        let (clock, queue) = setup().await;
        let task = queue.enqueue(&new_task("https://youtu.be/a")).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        let outcome = queue.cancel(&task.id).await.unwrap();
        assert!(matches!(outcome, CancelOutcome::CancelRequested(_)));
        assert_eq!(outcome.task().state(), TaskState::Progress);

        let after = queue
            .mark_retry(&task.id, &timeout_error(), clock.now_ms())
            .await
            .unwrap();
        assert_eq!(after.state(), TaskState::Failure);
        assert_eq!(after.error().unwrap().error_kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_terminal_and_unknown() {
        let (_clock, queue) = setup().await;
        let task = queue.enqueue(&new_task("https://youtu.be/a")).await.unwrap();
        queue.cancel(&task.id).await.unwrap();

        let again = queue.cancel(&task.id).await.unwrap();
        assert!(matches!(again, CancelOutcome::AlreadyTerminal(_)));

        let err = queue.cancel("missing").await.unwrap_err();
        assert!(matches!(err, QueueError::TaskNotFound(_)));
    }

    // ==================== Stale recovery ====================

    #[tokio::test]
    async fn test_requeue_stale_respects_age_and_attempts() {
        let (clock, queue) = setup().await;
        let young = queue.enqueue(&new_task("https://youtu.be/young")).await.unwrap();
        let old = queue.enqueue(&new_task("https://youtu.be/old")).await.unwrap();
        queue.claim(&old.id).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(100));
        queue.claim(&young.id).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(10));

        let recovered = queue
            .requeue_stale(Duration::from_secs(60), 3)
            .await
            .unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, old.id);
        assert_eq!(recovered[0].state(), TaskState::Retry);

        let exhausted = queue
            .requeue_stale(Duration::from_secs(1), 1)
            .await
            .unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].id, young.id);
        assert_eq!(exhausted[0].state(), TaskState::Failure);
    }

    #[tokio::test]
    async fn test_counts_and_next_due() {
        let (clock, queue) = setup().await;
        assert!(!queue.has_unfinished().await.unwrap());
        assert_eq!(queue.next_due_at().await.unwrap(), None);

        queue.enqueue(&new_task("https://youtu.be/a")).await.unwrap();
        assert!(queue.has_unfinished().await.unwrap());
        assert_eq!(queue.count_by_state(TaskState::Pending).await.unwrap(), 1);
        assert_eq!(queue.next_due_at().await.unwrap(), Some(clock.now_ms()));
    }

    #[tokio::test]
    async fn test_task_counts_cover_every_state() {
        let (_clock, queue) = setup().await;
        assert_eq!(queue.task_counts().await.unwrap(), TaskCounts::default());

        let done = queue.enqueue(&new_task("https://youtu.be/a")).await.unwrap();
        let failed = queue.enqueue(&new_task("https://youtu.be/b")).await.unwrap();
        queue.enqueue(&new_task("https://youtu.be/c")).await.unwrap();
        queue.enqueue(&new_task("https://youtu.be/d")).await.unwrap();

        let result = TaskResult {
            title: None,
            author: None,
            duration_secs: None,
            requested_quality: Quality::Height(720),
            delivered_quality: Quality::Height(720),
            quality_substituted: false,
            media: vec![],
        };
        queue.claim(&done.id).await.unwrap().unwrap();
        queue.complete(&done.id, &result).await.unwrap();
        queue.claim(&failed.id).await.unwrap().unwrap();
        queue.fail(&failed.id, &timeout_error()).await.unwrap();

        let counts = queue.task_counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.success, 1);
        assert_eq!(counts.failure, 1);
        assert_eq!(counts.progress + counts.retry, 0);
        assert_eq!(counts.total(), 4);
        assert_eq!(
            counts.pending,
            queue.count_by_state(TaskState::Pending).await.unwrap()
        );
    }
}
