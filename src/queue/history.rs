//! Download history persistence and query helpers.
//!
//! Every task that reaches a terminal state gets one append-only row here.
//! The `tasks` table stays the source of truth; history is what survives
//! once tasks and their files have aged out.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::{debug, instrument};

use super::{MediaLocator, Result, Task, TaskQueue, TaskState};
use crate::platform::Platform;

const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Largest page `list_history` returns.
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Terminal outcome stored in a history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryStatus {
    Success,
    Failure,
}

impl HistoryStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HistoryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" | "FAILED" => Ok(Self::Failure),
            _ => Err(format!("invalid history status: {s}")),
        }
    }
}

/// Filters for [`TaskQueue::list_history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub platform: Option<Platform>,
    pub status: Option<HistoryStatus>,
    /// Page size; 0 means the default, values above [`MAX_HISTORY_LIMIT`] are clamped.
    pub limit: usize,
    pub offset: usize,
}

/// One persisted history row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub task_id: String,
    pub url: String,
    pub platform: String,
    #[sqlx(rename = "status")]
    #[serde(rename = "status")]
    pub status_str: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub duration_secs: Option<f64>,
    pub file_size: Option<i64>,
    pub file_path: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: i64,
    pub completed_at: i64,
}

impl HistoryEntry {
    #[must_use]
    pub fn status(&self) -> HistoryStatus {
        self.status_str.parse().unwrap_or(HistoryStatus::Failure)
    }
}

/// Aggregate download outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HistorySummary {
    pub total: i64,
    pub successful: i64,
    /// Rows completed at or after the `since` bound.
    pub recent: i64,
    /// Percentage of successful rows, rounded to two decimals; 0 when empty.
    pub success_rate: f64,
}

impl TaskQueue {
    /// Appends a history row for a task in a terminal state.
    ///
    /// Returns `None` without writing when the task is not terminal.
    ///
    /// # Errors
    ///
    /// Returns database errors when the insert fails.
    #[instrument(skip(self, task, media), fields(task_id = %task.id))]
    pub async fn record_history(
        &self,
        task: &Task,
        media: Option<&MediaLocator>,
    ) -> Result<Option<i64>> {
        let status = match task.state() {
            TaskState::Success => HistoryStatus::Success,
            TaskState::Failure => HistoryStatus::Failure,
            state => {
                debug!(%state, "not recording history for unfinished task");
                return Ok(None);
            }
        };
        let result = task.result();
        let error = task.error();

        let id: i64 = sqlx::query_scalar(
            r"INSERT INTO download_history (
                task_id, url, platform, status, title, author, duration_secs,
                file_size, file_path, error_kind, error_message, retry_count,
                created_at, completed_at
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(&task.id)
        .bind(&task.url)
        .bind(&task.platform_str)
        .bind(status.as_str())
        .bind(result.as_ref().and_then(|r| r.title.clone()))
        .bind(result.as_ref().and_then(|r| r.author.clone()))
        .bind(result.as_ref().and_then(|r| r.duration_secs))
        .bind(media.map(|m| i64::try_from(m.size_bytes).unwrap_or(i64::MAX)))
        .bind(media.map(|m| m.path.clone()))
        .bind(error.as_ref().map(|e| e.error_kind.as_str()))
        .bind(error.as_ref().map(|e| e.message.clone()))
        .bind((task.attempt_count - 1).max(0))
        .bind(task.created_at)
        .bind(task.completed_at.unwrap_or(task.updated_at))
        .fetch_one(self.db().pool())
        .await?;

        debug!(history_id = id, %status, "history recorded");
        Ok(Some(id))
    }

    /// Lists history rows newest first.
    ///
    /// # Errors
    ///
    /// Returns database errors when the query fails.
    #[instrument(skip(self, query))]
    pub async fn list_history(&self, query: &HistoryQuery) -> Result<Vec<HistoryEntry>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM download_history WHERE 1 = 1");
        if let Some(platform) = query.platform {
            builder.push(" AND platform = ").push_bind(platform.as_str());
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        builder
            .push(" ORDER BY completed_at DESC, id DESC LIMIT ")
            .push_bind(normalize_history_limit(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset).unwrap_or(i64::MAX));

        let entries = builder
            .build_query_as::<HistoryEntry>()
            .fetch_all(self.db().pool())
            .await?;
        Ok(entries)
    }
}

impl TaskQueue {
    /// Totals over the whole history, with `recent` counting rows completed since `since_ms`.
    ///
    /// # Errors
    ///
    /// Returns database errors when the query fails.
    #[instrument(skip(self))]
    pub async fn summarize_history(&self, since_ms: i64) -> Result<HistorySummary> {
        let (total, successful, recent): (i64, i64, i64) = sqlx::query_as(
            r"SELECT COUNT(*),
                     COALESCE(SUM(status = 'SUCCESS'), 0),
                     COALESCE(SUM(completed_at >= ?), 0)
              FROM download_history",
        )
        .bind(since_ms)
        .fetch_one(self.db().pool())
        .await?;
        Ok(HistorySummary {
            total,
            successful,
            recent,
            success_rate: success_rate(successful, total),
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn success_rate(successful: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (successful as f64 * 10_000.0 / total as f64).round() / 100.0
}

fn normalize_history_limit(limit: usize) -> i64 {
    let clamped = if limit == 0 {
        DEFAULT_HISTORY_LIMIT
    } else {
        limit.min(MAX_HISTORY_LIMIT)
    };
    i64::try_from(clamped).unwrap_or(i64::MAX)
}
