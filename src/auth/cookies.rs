//! Netscape cookie-jar grammar and reqwest jar loader.
//!
//! Every non-comment, non-blank line must carry exactly seven TAB-separated
//! fields: `domain`, `include_subdomains`, `path`, `secure`, `expires`,
//! `name`, `value`. Bundles are validated strictly: a single malformed line
//! rejects the whole file, since a half-usable session tends to fail
//! extraction in confusing ways.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use reqwest::cookie::Jar;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Browsers export HttpOnly cookies with this prefix on the domain field.
const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

/// A single parsed cookie.
///
/// The value is redacted in `Debug` output so bundles can be logged safely.
#[derive(Clone, PartialEq, Eq)]
pub struct CookieLine {
    pub domain: String,
    pub include_subdomains: bool,
    pub path: String,
    pub secure: bool,
    /// Unix timestamp for expiry (0 = session cookie).
    pub expires: u64,
    pub name: String,
    value: String,
}

impl CookieLine {
    /// Returns the cookie value. Sensitive: never log it.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for CookieLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieLine")
            .field("domain", &self.domain)
            .field("include_subdomains", &self.include_subdomains)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("expires", &self.expires)
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Grammar violations in cookie-jar text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CookieError {
    /// A line does not follow the seven-field grammar.
    #[error("line {line_number}: {reason} (got: {content})")]
    InvalidLine {
        /// 1-based line number.
        line_number: usize,
        /// The offending line with its value redacted.
        content: String,
        reason: String,
    },

    /// File has no cookie lines at all.
    #[error("cookie file contains no cookies")]
    Empty,
}

/// Parses and validates cookie-jar text.
///
/// `#` comments and blank lines are skipped, except that `#HttpOnly_`
/// lines are real cookies with the prefix stripped. CRLF endings are accepted.
///
/// # Errors
///
/// Returns [`CookieError::InvalidLine`] for the first malformed line and
/// [`CookieError::Empty`] when no cookie lines exist.
#[instrument(level = "debug", skip(text), fields(bytes = text.len()))]
pub fn parse_cookie_jar(text: &str) -> Result<Vec<CookieLine>, CookieError> {
    let mut cookies = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let line = match line.strip_prefix(HTTP_ONLY_PREFIX) {
            Some(rest) => rest,
            None if line.starts_with('#') => continue,
            None => line,
        };
        let cookie = parse_cookie_line(line, idx + 1)?;
        debug!(line = idx + 1, domain = %cookie.domain, name = %cookie.name, "parsed cookie");
        cookies.push(cookie);
    }

    if cookies.is_empty() {
        return Err(CookieError::Empty);
    }
    Ok(cookies)
}

fn parse_cookie_line(line: &str, line_number: usize) -> Result<CookieLine, CookieError> {
    let invalid = |reason: String| CookieError::InvalidLine {
        line_number,
        content: redact_line_for_error(line),
        reason,
    };

    let fields: Vec<&str> = line.split('\t').collect();
    let &[domain, include_subdomains, path, secure, expires, name, value] = fields.as_slice() else {
        return Err(invalid(format!(
            "expected 7 TAB-separated fields, found {}",
            fields.len()
        )));
    };

    if domain.is_empty() {
        return Err(invalid("domain field is empty".to_string()));
    }
    if name.is_empty() {
        return Err(invalid("cookie name field is empty".to_string()));
    }
    let include_subdomains =
        parse_bool_field(include_subdomains, "include_subdomains").map_err(&invalid)?;
    let secure = parse_bool_field(secure, "secure").map_err(&invalid)?;
    let expires = expires.parse::<u64>().map_err(|_| {
        invalid(format!(
            "expires field must be a non-negative integer, got '{expires}'"
        ))
    })?;

    Ok(CookieLine {
        domain: domain.to_string(),
        include_subdomains,
        path: path.to_string(),
        secure,
        expires,
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool_field(value: &str, field_name: &str) -> Result<bool, String> {
    match value {
        "TRUE" => Ok(true),
        "FALSE" => Ok(false),
        _ => Err(format!(
            "{field_name} field must be TRUE or FALSE, got '{value}'"
        )),
    }
}

/// Redacts the value (7th field) so error messages never carry secrets.
fn redact_line_for_error(line: &str) -> String {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() >= 7 {
        let mut redacted = fields[..6].join("\t");
        redacted.push_str("\t[REDACTED]");
        redacted
    } else {
        line.to_string()
    }
}

/// Loads cookies into a `reqwest` jar for the media fetcher.
#[instrument(level = "debug", skip(cookies), fields(count = cookies.len()))]
pub fn load_cookies_into_jar(cookies: &[CookieLine]) -> Arc<Jar> {
    let jar = Arc::new(Jar::default());

    for cookie in cookies {
        let origin = build_origin_url(cookie);
        match origin.parse::<url::Url>() {
            Ok(url) => jar.add_cookie_str(&build_set_cookie_string(cookie), &url),
            Err(_) => warn!(
                domain = %cookie.domain,
                name = %cookie.name,
                "skipping cookie with unparseable domain"
            ),
        }
    }

    jar
}

fn build_set_cookie_string(cookie: &CookieLine) -> String {
    let mut parts = vec![
        format!("{}={}", cookie.name, cookie.value()),
        format!("Domain={}", cookie.domain),
        format!("Path={}", cookie.path),
    ];
    if cookie.secure {
        parts.push("Secure".to_string());
    }
    // 0 means session cookie: no Expires attribute.
    if cookie.expires > 0 {
        if let Some(at) = UNIX_EPOCH.checked_add(Duration::from_secs(cookie.expires)) {
            parts.push(format!("Expires={}", httpdate::fmt_http_date(at)));
        }
    }
    parts.join("; ")
}

fn build_origin_url(cookie: &CookieLine) -> String {
    let scheme = if cookie.secure { "https" } else { "http" };
    let domain = cookie.domain.strip_prefix('.').unwrap_or(&cookie.domain);
    format!("{scheme}://{domain}{}", cookie.path)
}
