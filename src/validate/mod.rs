//! URL validation and normalization for submitted media links.
//!
//! [`validate_url`] is a pure function: it either returns a normalized
//! absolute `http`/`https` [`Url`] or a [`ValidationError`]. Checks run in a
//! fixed order so the same input always produces the same error:
//!
//! 1. length and embedded control characters (`SuspiciousInput`)
//! 2. scheme normalization (schemeless input gets `https://`)
//! 3. parse, scheme allow-list and host presence (`InvalidURL`)
//! 4. path traversal, local/private hosts, injection markers (`SuspiciousInput`)

mod error;

pub use error::{MAX_URL_LENGTH, ValidationError};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument};
use url::{Host, Url};

/// Schemes rejected outright even before parsing the rest of the URL.
const DANGEROUS_SCHEMES: [&str; 5] = ["file", "javascript", "vbscript", "data", "blob"];

/// Patterns that never appear in legitimate media page URLs.
#[allow(clippy::expect_used)]
static SUSPICIOUS_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\.\./|\.\.\\", "path traversal sequence"),
        (r"%2e%2e(%2f|%5c|/|\\)", "encoded path traversal sequence"),
        (r"\$\{", "template injection marker"),
        (r"<script", "script injection marker"),
        (r"javascript:", "script URL embedded in input"),
    ]
    .into_iter()
    .map(|(pattern, reason)| {
        (
            Regex::new(pattern).expect("suspicious pattern regex is valid"), // Static pattern, safe to panic
            reason,
        )
    })
    .collect()
});

/// Validates and normalizes a raw user-supplied URL.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidUrl`] for malformed input, a missing or
/// malformed host, or a scheme other than `http`/`https`.
/// Returns [`ValidationError::SuspiciousInput`] for over-long input, control
/// characters, traversal sequences, local or private hosts, and injection markers.
///
/// # Examples
///
/// ```
/// use mediafetch_core::validate::validate_url;
///
/// let url = validate_url("  youtube.com/watch?v=abc ").unwrap();
/// assert_eq!(url.as_str(), "https://youtube.com/watch?v=abc");
/// assert!(validate_url("ftp://example.com/x").is_err());
/// ```
#[instrument(skip(raw), fields(input_len = raw.len()))]
pub fn validate_url(raw: &str) -> Result<Url, ValidationError> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::invalid(raw, "URL is empty"));
    }
    if trimmed.len() > MAX_URL_LENGTH {
        return Err(ValidationError::suspicious(
            trimmed,
            format!("exceeds maximum length of {MAX_URL_LENGTH} characters"),
        ));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(ValidationError::suspicious(
            trimmed,
            "contains control characters",
        ));
    }

    let candidate = normalize_scheme(trimmed)?;

    let parsed =
        Url::parse(&candidate).map_err(|e| ValidationError::invalid(trimmed, e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ValidationError::invalid(
                trimmed,
                format!("scheme '{scheme}' is not allowed; use http or https"),
            ));
        }
    }

    let Some(host) = parsed.host() else {
        return Err(ValidationError::invalid(trimmed, "URL has no host"));
    };
    check_host(trimmed, &host)?;

    let lowered = trimmed.to_ascii_lowercase();
    for (pattern, reason) in SUSPICIOUS_PATTERNS.iter() {
        if pattern.is_match(&lowered) {
            debug!(reason, "rejecting suspicious URL");
            return Err(ValidationError::suspicious(trimmed, *reason));
        }
    }

    Ok(parsed)
}

/// Adds `https://` to schemeless input and rejects dangerous schemes early.
fn normalize_scheme(input: &str) -> Result<String, ValidationError> {
    if let Some((scheme, _)) = input.split_once(':') {
        let scheme = scheme.to_ascii_lowercase();
        if DANGEROUS_SCHEMES.contains(&scheme.as_str()) {
            return Err(ValidationError::invalid(
                input,
                format!("scheme '{scheme}' is not allowed"),
            ));
        }
        if input.contains("://") {
            return Ok(input.to_string());
        }
        // `host:port/path` has a numeric "scheme"; anything else alphabetic is a real scheme.
        let looks_like_port = input[scheme.len() + 1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit());
        if !looks_like_port && scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+.-".contains(c))
        {
            return Err(ValidationError::invalid(
                input,
                format!("scheme '{scheme}' is not allowed; use http or https"),
            ));
        }
    }
    Ok(format!("https://{input}"))
}

fn check_host(raw: &str, host: &Host<&str>) -> Result<(), ValidationError> {
    match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.');
            if domain.is_empty() || domain.starts_with('.') || domain.contains("..") {
                return Err(ValidationError::invalid(raw, "malformed host"));
            }
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Err(ValidationError::suspicious(raw, "local host reference"));
            }
            if !domain.contains('.') {
                return Err(ValidationError::invalid(raw, "host is not a public domain"));
            }
            Ok(())
        }
        Host::Ipv4(addr) => check_ip(raw, IpAddr::V4(*addr)),
        Host::Ipv6(addr) => check_ip(raw, IpAddr::V6(*addr)),
    }
}

fn check_ip(raw: &str, addr: IpAddr) -> Result<(), ValidationError> {
    let private = match addr {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    };
    if private {
        Err(ValidationError::suspicious(
            raw,
            "private, loopback or link-local address",
        ))
    } else {
        Ok(())
    }
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.is_broadcast()
}

fn is_private_v6(addr: Ipv6Addr) -> bool {
    let first = addr.segments()[0];
    addr.is_loopback()
        || addr.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
        || (first & 0xffc0) == 0xfe80 // link-local fe80::/10
        || addr.to_ipv4_mapped().is_some_and(is_private_v4)
}
