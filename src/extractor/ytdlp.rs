//! `yt-dlp` backed extractor.
//!
//! Format discovery runs `yt-dlp -J` and maps its JSON onto [`FormatList`];
//! materialization streams the chosen format with [`MediaFetcher`]. Errors
//! are classified from `yt-dlp`'s stderr at this boundary.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{
    ExtractContext, ExtractError, Extractor, FailureCause, FormatList, MaterializedMedia,
    MediaFetcher, MediaFormat,
};
use crate::platform::Platform;

/// Longest stderr excerpt carried into an error message.
const STDERR_EXCERPT_CHARS: usize = 500;

/// Ordered stderr markers. First match wins, so specific markers precede generic ones.
const STDERR_RULES: &[(&str, FailureCause, bool)] = &[
    ("http error 429", FailureCause::RemoteThrottled, true),
    ("too many requests", FailureCause::RemoteThrottled, true),
    ("rate-limit", FailureCause::RemoteThrottled, true),
    ("not available in your country", FailureCause::GeoRestricted, false),
    ("geo restrict", FailureCause::GeoRestricted, false),
    ("sign in to confirm", FailureCause::AuthRequired, false),
    ("login required", FailureCause::AuthRequired, false),
    ("requires authentication", FailureCause::AuthRequired, false),
    ("use --cookies", FailureCause::AuthRequired, false),
    ("private video", FailureCause::ContentUnavailable, false),
    ("video unavailable", FailureCause::ContentUnavailable, false),
    ("has been removed", FailureCause::ContentUnavailable, false),
    ("does not exist", FailureCause::ContentUnavailable, false),
    ("http error 404", FailureCause::ContentUnavailable, false),
    ("unsupported url", FailureCause::ContentUnavailable, false),
    ("requested format is not available", FailureCause::UnsupportedQuality, false),
    ("timed out", FailureCause::Timeout, true),
    ("http error 5", FailureCause::TemporarilyUnavailable, true),
    ("temporarily unavailable", FailureCause::TemporarilyUnavailable, true),
    ("connection reset", FailureCause::Network, true),
    ("unable to connect", FailureCause::Network, true),
    ("name or service not known", FailureCause::Network, true),
    ("network is unreachable", FailureCause::Network, true),
];

/// Classifies `yt-dlp` stderr into a retryable or fatal error.
///
/// Unrecognized output is `Retryable(Unclassified)`; the retry policy
/// limits those to a single retry.
#[must_use]
pub fn classify_ytdlp_stderr(stderr: &str) -> ExtractError {
    let lowered = stderr.to_ascii_lowercase();
    let excerpt = excerpt(stderr);
    for (marker, cause, retryable) in STDERR_RULES {
        if lowered.contains(marker) {
            return if *retryable {
                ExtractError::retryable(*cause, excerpt)
            } else {
                ExtractError::fatal(*cause, excerpt)
            };
        }
    }
    ExtractError::retryable(FailureCause::Unclassified, excerpt)
}

fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let last_error = trimmed
        .lines()
        .rev()
        .find(|line| line.starts_with("ERROR"))
        .unwrap_or(trimmed);
    last_error.chars().take(STDERR_EXCERPT_CHARS).collect()
}

/// Extractor for one platform that shells out to `yt-dlp`.
#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    platform: Platform,
    program: String,
    fetcher: MediaFetcher,
}

impl YtDlpExtractor {
    #[must_use]
    pub fn new(platform: Platform, program: impl Into<String>, fetcher: MediaFetcher) -> Self {
        Self {
            platform,
            program: program.into(),
            fetcher,
        }
    }

    async fn run_dump_json(&self, url: &Url, ctx: &ExtractContext) -> Result<Vec<u8>, ExtractError> {
        let mut command = Command::new(&self.program);
        command
            .args(["-J", "--no-warnings", "--no-playlist", "--skip-download"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Held until the process exits; removes the file on drop.
        let _cookie_file = match &ctx.cookies {
            Some(bundle) => {
                let file = TempCookieFile::write(&ctx.output_dir, &ctx.task_id, bundle.raw_content())
                    .await?;
                command.arg("--cookies").arg(&file.path);
                Some(file)
            }
            None => None,
        };
        command.arg(url.as_str());

        let output = command.output().await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ExtractError::fatal(
                    FailureCause::ExtractorMissing,
                    format!("extractor program '{}' not found", self.program),
                )
            } else {
                ExtractError::retryable(FailureCause::Unclassified, e.to_string())
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let error = classify_ytdlp_stderr(&stderr);
            warn!(status = %output.status, cause = %error.cause(), "yt-dlp failed");
            return Err(error);
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    fn platform(&self) -> Platform {
        self.platform
    }

    #[instrument(skip(self, url, ctx), fields(platform = %self.platform, task_id = %ctx.task_id))]
    async fn fetch_formats(
        &self,
        url: &Url,
        ctx: &ExtractContext,
    ) -> Result<FormatList, ExtractError> {
        let stdout = self.run_dump_json(url, ctx).await?;
        let info: RawInfo = serde_json::from_slice(&stdout).map_err(|e| {
            ExtractError::retryable(
                FailureCause::Unclassified,
                format!("yt-dlp returned invalid JSON: {e}"),
            )
        })?;
        let list = info.into_format_list();
        debug!(formats = list.formats.len(), "formats listed");
        Ok(list)
    }

    async fn fetch_and_materialize(
        &self,
        _url: &Url,
        format: &MediaFormat,
        ctx: &ExtractContext,
    ) -> Result<MaterializedMedia, ExtractError> {
        self.fetcher.fetch(format, ctx).await
    }
}

/// Cookie bundle written out for one `yt-dlp` invocation.
///
/// `yt-dlp` rewrites its cookie file on exit, so it gets a private copy
/// instead of the shared bundle file.
struct TempCookieFile {
    path: PathBuf,
}

impl TempCookieFile {
    async fn write(dir: &Path, task_id: &str, content: &str) -> Result<Self, ExtractError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ExtractError::storage("creating media root", &e))?;
        let path = dir.join(format!(".{task_id}.cookies.txt"));
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ExtractError::storage("writing cookie file", &e))?;
        Ok(Self { path })
    }
}

impl Drop for TempCookieFile {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            debug!(error = %error, path = %self.path.display(), "temporary cookie file already gone");
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<RawFormat>,
    #[serde(flatten)]
    single: RawFormat,
}

#[derive(Debug, Default, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    height: Option<u32>,
    vcodec: Option<String>,
    acodec: Option<String>,
    url: Option<String>,
    protocol: Option<String>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    #[serde(default)]
    http_headers: BTreeMap<String, String>,
}

impl RawInfo {
    fn into_format_list(self) -> FormatList {
        let raw = if self.formats.is_empty() {
            vec![self.single]
        } else {
            self.formats
        };
        FormatList {
            title: self.title,
            author: self.uploader.or(self.channel),
            duration_secs: self.duration,
            formats: raw.into_iter().filter_map(RawFormat::into_media_format).collect(),
        }
    }
}

impl RawFormat {
    /// Drops formats that cannot be streamed over plain HTTP(S) or carry no media.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn into_media_format(self) -> Option<MediaFormat> {
        let url = self.url?;
        if !self.protocol.as_deref().unwrap_or("https").starts_with("http") {
            return None;
        }
        let has_video = match self.vcodec.as_deref() {
            Some("none") => false,
            Some(_) => true,
            None => self.height.is_some(),
        };
        let has_audio = !matches!(self.acodec.as_deref(), Some("none"));
        if !has_video && !has_audio {
            return None;
        }
        Some(MediaFormat {
            format_id: self.format_id.unwrap_or_else(|| "default".to_string()),
            ext: self.ext.unwrap_or_else(|| "mp4".to_string()),
            height: if has_video { self.height } else { None },
            has_video,
            has_audio,
            filesize: self
                .filesize
                .or(self.filesize_approx)
                .filter(|size| *size >= 0.0)
                .map(|size| size as u64),
            url,
            http_headers: self.http_headers,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== Stderr classification ====================

    #[test]
    fn test_classify_throttling_is_retryable() {
        let err = classify_ytdlp_stderr("ERROR: [youtube] abc: HTTP Error 429: Too Many Requests");
        assert!(err.is_retryable());
        assert_eq!(err.cause(), FailureCause::RemoteThrottled);
    }

    #[test]
    fn test_classify_permanent_markers() {
        let cases = [
            ("ERROR: [youtube] abc: Video unavailable", FailureCause::ContentUnavailable),
            ("ERROR: [youtube] abc: Private video", FailureCause::ContentUnavailable),
            (
                "ERROR: The uploader has not made this video available in your country",
                FailureCause::GeoRestricted,
            ),
            (
                "ERROR: [instagram] x: login required. Use --cookies",
                FailureCause::AuthRequired,
            ),
        ];
        for (stderr, cause) in cases {
            let err = classify_ytdlp_stderr(stderr);
            assert!(!err.is_retryable(), "{stderr}");
            assert_eq!(err.cause(), cause, "{stderr}");
        }
    }

    #[test]
    fn test_classify_unknown_is_unclassified_retryable() {
        let err = classify_ytdlp_stderr("something odd happened");
        assert!(err.is_retryable());
        assert_eq!(err.cause(), FailureCause::Unclassified);
    }

    #[test]
    fn test_excerpt_prefers_last_error_line() {
        let err = classify_ytdlp_stderr("[info] step\nERROR: read timed out\n[debug] trailing");
        assert_eq!(err.reason().message, "ERROR: read timed out");
    }

    // ==================== JSON mapping ====================

    #[test]
    fn test_dump_json_maps_formats() {
        let json = r#"{
            "title": "Clip",
            "uploader": "Someone",
            "duration": 12.5,
            "formats": [
                {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "acodec": "none", "url": "https://x/sb", "protocol": "mhtml"},
                {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a", "url": "https://x/a", "protocol": "https", "filesize": 1000},
                {"format_id": "22", "ext": "mp4", "height": 720, "vcodec": "avc1", "acodec": "mp4a", "url": "https://x/v", "protocol": "https"},
                {"format_id": "hls", "ext": "mp4", "height": 1080, "vcodec": "avc1", "url": "https://x/m3u8", "protocol": "m3u8_native"}
            ]
        }"#;
        let info: RawInfo = serde_json::from_str(json).unwrap();
        let list = info.into_format_list();

        assert_eq!(list.title.as_deref(), Some("Clip"));
        assert_eq!(list.author.as_deref(), Some("Someone"));
        let ids: Vec<_> = list.formats.iter().map(|f| f.format_id.as_str()).collect();
        assert_eq!(ids, ["140", "22"]);
        assert!(list.formats[0].is_audio_only());
        assert_eq!(list.formats[1].height, Some(720));
    }

    #[test]
    fn test_dump_json_single_format_page() {
        let json = r#"{"title": "One", "url": "https://x/file.mp4", "ext": "mp4", "height": 480}"#;
        let info: RawInfo = serde_json::from_str(json).unwrap();
        let list = info.into_format_list();
        assert_eq!(list.formats.len(), 1);
        assert_eq!(list.formats[0].height, Some(480));
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = YtDlpExtractor::new(
            Platform::YouTube,
            "definitely-not-a-real-ytdlp-binary",
            MediaFetcher::new().unwrap(),
        );
        let ctx = ExtractContext {
            task_id: "t".to_string(),
            output_dir: dir.path().to_path_buf(),
            cookies: None,
        };
        let err = extractor
            .fetch_formats(&Url::parse("https://youtu.be/abc").unwrap(), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.cause(), FailureCause::ExtractorMissing);
    }
}
