//! Errors surfaced synchronously to request callers.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::extractor::{ExtractError, FailureCause, QualityParseError};
use crate::media::MediaError;
use crate::platform::UnsupportedPlatform;
use crate::queue::QueueError;
use crate::validate::ValidationError;

/// Everything a request can fail with before (or instead of) a task existing.
#[derive(Debug, Error)]
pub enum RequestError {
    /// `InvalidURL` or `SuspiciousInput`.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    UnsupportedPlatform(#[from] UnsupportedPlatform),

    #[error(transparent)]
    InvalidQuality(#[from] QualityParseError),

    #[error("rate limit exceeded, retry in {}s", retry_after_secs(.retry_after))]
    RateLimited { retry_after: Duration },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task store error: {0}")]
    Queue(QueueError),

    #[error("media store error: {0}")]
    Media(#[from] MediaError),

    /// A synchronous extractor call (format lookup) failed.
    #[error(transparent)]
    Extraction(#[from] ExtractError),
}

impl From<QueueError> for RequestError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::TaskNotFound(id) => Self::TaskNotFound(id),
            other => Self::Queue(other),
        }
    }
}

/// Whole seconds a client should wait, rounded up so it never retries early.
#[allow(clippy::trivially_copy_pass_by_ref)]
fn retry_after_secs(retry_after: &Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// User-visible error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error_kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl RequestError {
    /// Stable machine-readable kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(error) => error.kind(),
            Self::UnsupportedPlatform(_) => "UnsupportedPlatform",
            Self::InvalidQuality(_) => "InvalidQuality",
            Self::RateLimited { .. } => "RateLimited",
            Self::TaskNotFound(_) => "TaskNotFound",
            Self::Queue(_) => "InternalError",
            Self::Media(_) => "StorageError",
            Self::Extraction(error) => match error.cause() {
                FailureCause::Storage => "StorageError",
                _ if error.is_retryable() => "TransientExtractionError",
                _ => "PermanentExtractionError",
            },
        }
    }

    /// Whether the request can never succeed as sent (vs. a server-side fault).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Queue(_) | Self::Media(_) => false,
            Self::Extraction(error) => {
                !error.is_retryable() && error.cause() != FailureCause::Storage
            }
            _ => true,
        }
    }

    /// Renders `{error_kind, message}`; internal failures get a generic message.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let message = if self.is_client_error() {
            self.to_string()
        } else {
            "internal error while handling the request".to_string()
        };
        ErrorBody {
            error_kind: self.kind(),
            message,
            retry_after_secs: match self {
                Self::RateLimited { retry_after } => Some(retry_after_secs(retry_after)),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::QueueDbErrorKind;

    #[test]
    fn test_validation_kinds_pass_through() {
        let err = RequestError::from(ValidationError::invalid("ftp://x", "scheme"));
        assert_eq!(err.kind(), "InvalidURL");
        let err = RequestError::from(ValidationError::suspicious("http://x/../", "traversal"));
        assert_eq!(err.kind(), "SuspiciousInput");
    }

    #[test]
    fn test_rate_limited_body_rounds_retry_after_up() {
        let err = RequestError::RateLimited {
            retry_after: Duration::from_millis(29_001),
        };
        let body = err.to_body();
        assert_eq!(body.error_kind, "RateLimited");
        assert_eq!(body.retry_after_secs, Some(30));
        assert_eq!(body.message, "rate limit exceeded, retry in 30s");
    }

    #[test]
    fn test_task_not_found_from_queue_error() {
        let err = RequestError::from(QueueError::TaskNotFound("t".into()));
        assert!(matches!(err, RequestError::TaskNotFound(_)));
        assert_eq!(err.kind(), "TaskNotFound");
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let err = RequestError::from(QueueError::Database {
            kind: QueueDbErrorKind::Unavailable,
            message: "disk I/O error at /var/lib/db".into(),
        });
        let body = err.to_body();
        assert_eq!(body.error_kind, "InternalError");
        assert!(!body.message.contains("/var/lib"));
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("retry_after_secs").is_none());
    }

    #[test]
    fn test_extraction_errors_split_by_retryability() {
        let fatal = RequestError::from(ExtractError::fatal(FailureCause::ContentUnavailable, "removed"));
        assert_eq!(fatal.kind(), "PermanentExtractionError");
        assert!(fatal.is_client_error());
        assert!(fatal.to_body().message.contains("removed"));

        let transient = RequestError::from(ExtractError::retryable(FailureCause::Network, "reset"));
        assert_eq!(transient.kind(), "TransientExtractionError");
        assert!(!transient.is_client_error());
    }
}
