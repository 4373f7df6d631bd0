//! Two-case error type returned at the extractor boundary.
//!
//! Extractors classify every failure as either [`ExtractError::Retryable`]
//! or [`ExtractError::Fatal`]. The executor's retry policy consumes that
//! classification directly; it never inspects message text.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What went wrong, independent of whether it is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// Extraction exceeded its wall-clock budget.
    Timeout,
    /// Remote platform answered with throttling (HTTP 429 or equivalent).
    RemoteThrottled,
    /// Remote platform reported a temporary outage (5xx).
    TemporarilyUnavailable,
    /// Connection-level failure.
    Network,
    /// Error that could not be classified either way.
    Unclassified,
    /// Content removed, private, or never existed.
    ContentUnavailable,
    /// Content blocked in this region.
    GeoRestricted,
    /// No usable format for the requested quality.
    UnsupportedQuality,
    /// Login needed and no cookie bundle is installed (or it was rejected).
    AuthRequired,
    /// Writing the media file failed (disk full, permission denied).
    Storage,
    /// No extractor is registered for the platform.
    ExtractorMissing,
    /// Task was cancelled administratively.
    Cancelled,
}

impl FailureCause {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RemoteThrottled => "remote_throttled",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::Network => "network",
            Self::Unclassified => "unclassified",
            Self::ContentUnavailable => "content_unavailable",
            Self::GeoRestricted => "geo_restricted",
            Self::UnsupportedQuality => "unsupported_quality",
            Self::AuthRequired => "auth_required",
            Self::Storage => "storage",
            Self::ExtractorMissing => "extractor_missing",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cause plus human-readable detail for one failed extractor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reason {
    pub cause: FailureCause,
    pub message: String,
    /// Remote-supplied minimum wait (e.g. `Retry-After`).
    pub retry_after: Option<Duration>,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.cause, self.message)
    }
}

/// Result of a failed extractor call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// Expected to succeed if attempted again later.
    #[error("retryable extraction failure ({0})")]
    Retryable(Reason),

    /// Will not succeed regardless of retries.
    #[error("fatal extraction failure ({0})")]
    Fatal(Reason),
}

impl ExtractError {
    #[must_use]
    pub fn retryable(cause: FailureCause, message: impl Into<String>) -> Self {
        Self::Retryable(Reason {
            cause,
            message: message.into(),
            retry_after: None,
        })
    }

    #[must_use]
    pub fn fatal(cause: FailureCause, message: impl Into<String>) -> Self {
        Self::Fatal(Reason {
            cause,
            message: message.into(),
            retry_after: None,
        })
    }

    /// Attaches a remote retry hint. No-op for fatal errors.
    #[must_use]
    pub fn with_retry_after(mut self, hint: Option<Duration>) -> Self {
        if let Self::Retryable(reason) = &mut self {
            reason.retry_after = hint;
        }
        self
    }

    /// Maps a filesystem error while writing media to a fatal storage failure.
    #[must_use]
    pub fn storage(context: &str, error: &io::Error) -> Self {
        Self::fatal(FailureCause::Storage, format!("{context}: {error}"))
    }

    #[must_use]
    pub fn reason(&self) -> &Reason {
        match self {
            Self::Retryable(reason) | Self::Fatal(reason) => reason,
        }
    }

    #[must_use]
    pub fn cause(&self) -> FailureCause {
        self.reason().cause
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_hint_only_sticks_to_retryable() {
        let hint = Some(Duration::from_secs(30));
        let err = ExtractError::retryable(FailureCause::RemoteThrottled, "429").with_retry_after(hint);
        assert_eq!(err.reason().retry_after, hint);

        let err = ExtractError::fatal(FailureCause::GeoRestricted, "blocked").with_retry_after(hint);
        assert_eq!(err.reason().retry_after, None);
    }

    #[test]
    fn test_storage_error_is_fatal() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = ExtractError::storage("writing media", &io_err);
        assert!(!err.is_retryable());
        assert_eq!(err.cause(), FailureCause::Storage);
        assert!(err.to_string().contains("writing media"));
    }

    #[test]
    fn test_display_includes_cause_label() {
        let err = ExtractError::retryable(FailureCause::Timeout, "took too long");
        assert_eq!(
            err.to_string(),
            "retryable extraction failure (timeout: took too long)"
        );
    }
}
