//! Error types for task queue operations.

use std::fmt;

use thiserror::Error;

use super::TaskState;

/// Coarse classification of a database failure.
///
/// Workers use it to tell lock contention (expected when several
/// processes share the file) apart from real faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDbErrorKind {
    /// Another connection held the write lock past the busy timeout.
    Contended,
    /// A constraint rejected the write.
    Constraint,
    /// The pool or the file could not be reached.
    Unavailable,
    Other,
}

impl QueueDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable
            }
            sqlx::Error::Database(db_error) => {
                let code = db_error.code().unwrap_or_default();
                // SQLite primary codes 5 and 6 are BUSY and LOCKED.
                if matches!(code.as_ref(), "5" | "6" | "SQLITE_BUSY" | "SQLITE_LOCKED")
                    || db_error.message().contains("database is locked")
                {
                    Self::Contended
                } else if db_error.is_unique_violation()
                    || db_error.is_check_violation()
                    || code.starts_with("SQLITE_CONSTRAINT")
                {
                    Self::Constraint
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contended => "contended",
            Self::Constraint => "constraint",
            Self::Unavailable => "unavailable",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for QueueDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during queue operations.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("database error ({kind}): {message}")]
    Database {
        kind: QueueDbErrorKind,
        message: String,
    },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The task is not in a state that permits the requested transition.
    #[error("task {task_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    /// A stored JSON payload could not be encoded or decoded.
    #[error("task payload serialization failed: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: QueueDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl QueueError {
    /// True when the failure was lock contention and the call can simply be repeated.
    #[must_use]
    pub fn is_contended(&self) -> bool {
        matches!(
            self,
            Self::Database {
                kind: QueueDbErrorKind::Contended,
                ..
            }
        )
    }
}
