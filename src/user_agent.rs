//! User-Agent string shared by every outbound HTTP request.

/// Project URL for User-Agent identification (RFC 9308 good citizenship).
const PROJECT_UA_URL: &str = "https://github.com/mediafetch/mediafetch";

/// Identifies the tool and version to remote media hosts.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("mediafetch/{version} (+{PROJECT_UA_URL})")
}
