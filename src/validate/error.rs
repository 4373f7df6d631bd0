//! Error types for URL validation.

use thiserror::Error;

/// Maximum URL length to accept.
pub const MAX_URL_LENGTH: usize = 2048;

/// Errors produced while validating a submitted URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// URL is malformed, lacks a host, or uses a non-web scheme.
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// The URL that failed validation (truncated for display).
        url: String,
        /// Why the URL is invalid.
        reason: String,
    },

    /// URL is well-formed but carries a pattern that is never legitimate media input.
    #[error("suspicious URL '{url}': {reason}")]
    SuspiciousInput {
        /// The offending URL (truncated for display).
        url: String,
        /// Which check rejected it.
        reason: String,
    },
}

impl ValidationError {
    /// Creates an `InvalidUrl` error.
    #[must_use]
    pub fn invalid(url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: preview(url),
            reason: reason.into(),
        }
    }

    /// Creates a `SuspiciousInput` error.
    #[must_use]
    pub fn suspicious(url: &str, reason: impl Into<String>) -> Self {
        Self::SuspiciousInput {
            url: preview(url),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable kind used in user-visible error bodies.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidUrl { .. } => "InvalidURL",
            Self::SuspiciousInput { .. } => "SuspiciousInput",
        }
    }
}

/// Truncates long or control-character-laden input for safe display.
fn preview(url: &str) -> String {
    const PREVIEW_CHARS: usize = 120;
    let cleaned: String = url
        .chars()
        .map(|c| if c.is_control() { '\u{fffd}' } else { c })
        .take(PREVIEW_CHARS)
        .collect();
    if url.chars().count() > PREVIEW_CHARS {
        format!("{cleaned}...")
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_and_masks_control_chars() {
        let long = format!("https://example.com/{}", "a".repeat(500));
        let err = ValidationError::suspicious(&long, "too long");
        let ValidationError::SuspiciousInput { url, .. } = err else {
            panic!("expected SuspiciousInput");
        };
        assert!(url.ends_with("..."));
        assert!(url.len() < 140);

        let err = ValidationError::invalid("https://a.com/\u{0}x", "bad");
        assert!(!err.to_string().contains('\u{0}'));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ValidationError::invalid("x", "y").kind(), "InvalidURL");
        assert_eq!(ValidationError::suspicious("x", "y").kind(), "SuspiciousInput");
    }
}
