//! Task rows, the state machine, and result/error payloads.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::extractor::{ExtractError, FailureCause, Quality};
use crate::platform::Platform;

/// Lifecycle state of a task.
///
/// ```text
/// PENDING ──► PROGRESS ──► SUCCESS
///    │          │  ▲
///    │          ▼  │
///    │        RETRY ──► FAILURE
///    └──────────────────► FAILURE   (cancellation)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Enqueued, not yet picked up.
    Pending,
    /// An executor is running it.
    Progress,
    /// Waiting out a backoff before the next attempt.
    Retry,
    Success,
    Failure,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        Self::Pending,
        Self::Progress,
        Self::Retry,
        Self::Success,
        Self::Failure,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Progress => "PROGRESS",
            Self::Retry => "RETRY",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Whether the state machine permits `self → next`.
    ///
    /// `PENDING → FAILURE` and `RETRY → FAILURE` are administrative
    /// cancellation; nothing leaves a terminal state.
    #[must_use]
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Progress | Self::Failure)
                | (Self::Progress, Self::Success | Self::Failure | Self::Retry)
                | (Self::Retry, Self::Progress | Self::Failure)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("invalid task state: {s}"))
    }
}

/// User-visible failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    TransientExtractionError,
    PermanentExtractionError,
    StorageError,
    Cancelled,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientExtractionError => "TransientExtractionError",
            Self::PermanentExtractionError => "PermanentExtractionError",
            Self::StorageError => "StorageError",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured error stored on a task: `{error_kind, cause, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub error_kind: ErrorKind,
    pub cause: FailureCause,
    pub message: String,
}

impl TaskError {
    /// Builds the stored error for an extractor failure.
    #[must_use]
    pub fn from_extract(error: &ExtractError) -> Self {
        let reason = error.reason();
        let error_kind = match (reason.cause, error.is_retryable()) {
            (FailureCause::Storage, _) => ErrorKind::StorageError,
            (FailureCause::Cancelled, _) => ErrorKind::Cancelled,
            (_, true) => ErrorKind::TransientExtractionError,
            (_, false) => ErrorKind::PermanentExtractionError,
        };
        Self {
            error_kind,
            cause: reason.cause,
            message: reason.message.clone(),
        }
    }

    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            error_kind: ErrorKind::Cancelled,
            cause: FailureCause::Cancelled,
            message: message.into(),
        }
    }
}

/// Where one produced file lives and what it contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaLocator {
    pub format_id: String,
    pub quality: Quality,
    pub ext: String,
    pub path: String,
    pub size_bytes: u64,
    /// Epoch milliseconds after which the sweeper may delete the file.
    pub expires_at: i64,
}

/// Payload written atomically with the `SUCCESS` transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub title: Option<String>,
    pub author: Option<String>,
    pub duration_secs: Option<f64>,
    pub requested_quality: Quality,
    pub delivered_quality: Quality,
    /// True when the extractor could not match `requested_quality` exactly.
    pub quality_substituted: bool,
    pub media: Vec<MediaLocator>,
}

/// Input for a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub url: String,
    pub platform: Platform,
    pub quality: Quality,
    pub client_key: Option<String>,
}

/// A single row of the task table.
#[derive(Debug, Clone, FromRow)]
pub struct Task {
    pub id: String,
    pub url: String,
    /// Platform identifier (parsed via `platform()`).
    #[sqlx(rename = "platform")]
    pub platform_str: String,
    pub requested_quality: String,
    pub client_key: Option<String>,
    /// Current state (stored as text, parsed via `state()`).
    #[sqlx(rename = "state")]
    pub state_str: String,
    pub attempt_count: i64,
    pub cancel_requested: bool,
    /// Epoch ms before which the task must not be claimed.
    pub run_after: i64,
    #[sqlx(rename = "result")]
    pub result_json: Option<String>,
    #[sqlx(rename = "error")]
    pub error_json: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Task {
    /// Returns the parsed state.
    ///
    /// The column has a CHECK constraint, so the fallback is unreachable in practice.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state_str.parse().unwrap_or(TaskState::Pending)
    }

    #[must_use]
    pub fn platform(&self) -> Option<Platform> {
        self.platform_str.parse().ok()
    }

    /// Requested quality; unparseable legacy values fall back to the default.
    #[must_use]
    pub fn quality(&self) -> Quality {
        self.requested_quality.parse().unwrap_or_default()
    }

    /// Decoded result payload, if present and well-formed.
    #[must_use]
    pub fn result(&self) -> Option<TaskResult> {
        self.result_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Decoded error payload, if present and well-formed.
    #[must_use]
    pub fn error(&self) -> Option<TaskError> {
        self.error_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        u32::try_from(self.attempt_count).unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_str() {
        for state in TaskState::ALL {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert!("DONE".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_terminal_states_allow_no_transition() {
        for terminal in [TaskState::Success, TaskState::Failure] {
            assert!(terminal.is_terminal());
            for next in TaskState::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_state_machine_edges() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Progress));
        assert!(TaskState::Progress.can_transition_to(TaskState::Retry));
        assert!(TaskState::Retry.can_transition_to(TaskState::Progress));
        assert!(!TaskState::Pending.can_transition_to(TaskState::Success));
        assert!(!TaskState::Retry.can_transition_to(TaskState::Success));
        assert!(!TaskState::Progress.can_transition_to(TaskState::Pending));
    }

    #[test]
    fn test_state_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&TaskState::Progress).unwrap(),
            "\"PROGRESS\""
        );
    }

    #[test]
    fn test_task_error_kind_from_extract() {
        let transient = ExtractError::retryable(FailureCause::Timeout, "slow");
        assert_eq!(
            TaskError::from_extract(&transient).error_kind,
            ErrorKind::TransientExtractionError
        );

        let permanent = ExtractError::fatal(FailureCause::AuthRequired, "login");
        assert_eq!(
            TaskError::from_extract(&permanent).error_kind,
            ErrorKind::PermanentExtractionError
        );

        let storage = ExtractError::fatal(FailureCause::Storage, "disk full");
        assert_eq!(
            TaskError::from_extract(&storage).error_kind,
            ErrorKind::StorageError
        );
    }

    #[test]
    fn test_task_error_json_shape() {
        let err = TaskError::cancelled("cancelled by administrator");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error_kind"], "Cancelled");
        assert_eq!(json["cause"], "cancelled");
    }
}
