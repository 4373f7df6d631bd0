//! Streaming HTTP fetcher that materializes a chosen format on disk.
//!
//! Bytes go to `{task_id}.{ext}.part` first and are renamed into place
//! only after the stream completes, so the media root never holds a
//! truncated file under its final name.

use std::path::Path;
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use super::{ExtractContext, ExtractError, FailureCause, MaterializedMedia, MediaFormat};
use crate::user_agent;

/// Default HTTP connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound honored for a remote `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Suffix for in-progress downloads.
pub const PART_SUFFIX: &str = "part";

/// Streams media URLs to the media root.
#[derive(Debug, Clone)]
pub struct MediaFetcher {
    client: Client,
}

impl MediaFetcher {
    /// Creates a fetcher sharing one connection pool for unauthenticated requests.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` builder error if TLS initialization fails.
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: base_builder().build()?,
        })
    }

    /// Downloads `format.url` to the task's output path.
    ///
    /// When the context carries a cookie bundle, a client with that bundle's
    /// jar is used for this one request.
    ///
    /// # Errors
    ///
    /// Classifies failures: timeouts, 429, 5xx and connection errors are
    /// retryable; 401/403 are `AuthRequired`; 404/410 and other 4xx are
    /// `ContentUnavailable`; filesystem errors are `Storage`.
    #[instrument(skip(self, format, ctx), fields(task_id = %ctx.task_id, format_id = %format.format_id))]
    pub async fn fetch(
        &self,
        format: &MediaFormat,
        ctx: &ExtractContext,
    ) -> Result<MaterializedMedia, ExtractError> {
        let client = match &ctx.cookies {
            Some(bundle) => base_builder()
                .cookie_provider(bundle.jar())
                .build()
                .map_err(|e| ExtractError::fatal(FailureCause::Unclassified, e.to_string()))?,
            None => self.client.clone(),
        };

        let response = client
            .get(&format.url)
            .headers(header_map(format))
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(classify_status(status).with_retry_after(retry_after));
        }

        let final_path = ctx.output_path(&format.ext);
        let part_path = final_path.with_extension(format!("{}.{PART_SUFFIX}", format.ext));

        let written = match stream_to_file(response, &part_path).await {
            Ok(written) => written,
            Err(error) => {
                if let Err(cleanup) = tokio::fs::remove_file(&part_path).await {
                    debug!(error = %cleanup, path = %part_path.display(), "no partial file to clean up");
                }
                return Err(error);
            }
        };

        tokio::fs::rename(&part_path, &final_path)
            .await
            .map_err(|e| ExtractError::storage("moving finished download into place", &e))?;

        info!(bytes = written, path = %final_path.display(), "media materialized");
        Ok(MaterializedMedia {
            path: final_path,
            size_bytes: written,
        })
    }
}

fn base_builder() -> reqwest::ClientBuilder {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .gzip(true)
        .user_agent(user_agent::default_user_agent())
}

fn header_map(format: &MediaFormat) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &format.http_headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping unusable format header"),
        }
    }
    headers
}

async fn stream_to_file(response: reqwest::Response, path: &Path) -> Result<u64, ExtractError> {
    let file = File::create(path)
        .await
        .map_err(|e| ExtractError::storage("creating media file", &e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| classify_transport_error(&e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| ExtractError::storage("writing media file", &e))?;
        written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| ExtractError::storage("flushing media file", &e))?;
    Ok(written)
}

fn classify_transport_error(error: &reqwest::Error) -> ExtractError {
    if error.is_timeout() {
        ExtractError::retryable(FailureCause::Timeout, error.to_string())
    } else {
        ExtractError::retryable(FailureCause::Network, error.to_string())
    }
}

/// Maps a non-success media response to a retryable or fatal error.
#[must_use]
pub fn classify_status(status: StatusCode) -> ExtractError {
    let message = format!("media host returned HTTP {status}");
    match status.as_u16() {
        429 => ExtractError::retryable(FailureCause::RemoteThrottled, message),
        408 => ExtractError::retryable(FailureCause::Timeout, message),
        500..=599 => ExtractError::retryable(FailureCause::TemporarilyUnavailable, message),
        401 | 403 | 407 => ExtractError::fatal(FailureCause::AuthRequired, message),
        451 => ExtractError::fatal(FailureCause::GeoRestricted, message),
        _ => ExtractError::fatal(FailureCause::ContentUnavailable, message),
    }
}

/// Parses a `Retry-After` value as delta-seconds or an HTTP-date.
///
/// Values beyond one hour are capped; dates in the past yield zero.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(at) => Some(
            at.duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
                .min(MAX_RETRY_AFTER),
        ),
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn format_for(server: &MockServer, route: &str) -> MediaFormat {
        MediaFormat {
            format_id: "22".to_string(),
            ext: "mp4".to_string(),
            height: Some(720),
            has_video: true,
            has_audio: true,
            filesize: None,
            url: format!("{}{route}", server.uri()),
            http_headers: BTreeMap::from([("X-Test".to_string(), "yes".to_string())]),
        }
    }

    fn ctx(dir: &Path) -> ExtractContext {
        ExtractContext {
            task_id: "task-1".to_string(),
            output_dir: PathBuf::from(dir),
            cookies: None,
        }
    }

    // ==================== Success ====================

    #[tokio::test]
    async fn test_fetch_streams_body_to_task_named_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v.mp4"))
            .and(header("X-Test", "yes"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7_u8; 4096]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = MediaFetcher::new().unwrap();
        let media = fetcher
            .fetch(&format_for(&server, "/v.mp4"), &ctx(dir.path()))
            .await
            .unwrap();

        assert_eq!(media.path, dir.path().join("task-1.mp4"));
        assert_eq!(media.size_bytes, 4096);
        assert_eq!(std::fs::read(&media.path).unwrap().len(), 4096);
        assert!(!dir.path().join("task-1.mp4.part").exists());
    }

    // ==================== Classification ====================

    #[tokio::test]
    async fn test_fetch_429_is_retryable_with_hint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "42"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = MediaFetcher::new()
            .unwrap()
            .fetch(&format_for(&server, "/v.mp4"), &ctx(dir.path()))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.cause(), FailureCause::RemoteThrottled);
        assert_eq!(err.reason().retry_after, Some(Duration::from_secs(42)));
        assert!(!dir.path().join("task-1.mp4").exists());
    }

    #[tokio::test]
    async fn test_fetch_404_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = MediaFetcher::new()
            .unwrap()
            .fetch(&format_for(&server, "/gone"), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.cause(), FailureCause::ContentUnavailable);
    }

    #[test]
    fn test_classify_status_table() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN).cause(),
            FailureCause::AuthRequired
        );
        assert_eq!(
            classify_status(StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS).cause(),
            FailureCause::GeoRestricted
        );
    }

    #[test]
    fn test_parse_retry_after_forms() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("999999"), Some(MAX_RETRY_AFTER));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }
}
