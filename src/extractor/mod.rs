//! Per-platform extraction capability and dispatch.
//!
//! # Architecture
//!
//! - [`Extractor`] - Async trait each platform variant implements
//! - [`ExtractorRegistry`] - Maps a [`Platform`] tag to its extractor
//! - [`ExtractError`] - `Retryable` / `Fatal` result consumed by the retry policy
//! - [`select_format`] - Closest-quality selection with substitution tracking
//! - [`YtDlpExtractor`] - Default backend shelling out to `yt-dlp -J`
//! - [`MediaFetcher`] - Streams a chosen format to the media root

mod error;
mod fetcher;
mod quality;
mod registry;
mod ytdlp;

pub use error::{ExtractError, FailureCause, Reason};
pub use fetcher::{MediaFetcher, PART_SUFFIX, classify_status, parse_retry_after};
pub use quality::{DEFAULT_QUALITY, Quality, QualityParseError, Selection, select_format};
pub use registry::{ExtractorRegistry, build_default_registry};
pub use ytdlp::{YtDlpExtractor, classify_ytdlp_stderr};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::CookieBundle;
use crate::media::media_file_name;
use crate::platform::Platform;

/// One downloadable rendition of a media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub format_id: String,
    /// File extension without the dot.
    pub ext: String,
    /// Frame height for video formats.
    pub height: Option<u32>,
    pub has_video: bool,
    pub has_audio: bool,
    pub filesize: Option<u64>,
    /// Direct media URL.
    pub url: String,
    /// Headers the remote host expects on the media request.
    #[serde(default)]
    pub http_headers: BTreeMap<String, String>,
}

impl MediaFormat {
    #[must_use]
    pub fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }
}

/// Metadata plus every format an extractor found for a URL.
///
/// This is what the cache layer memoizes under [`crate::cache::CacheClass::Formats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatList {
    pub title: Option<String>,
    pub author: Option<String>,
    pub duration_secs: Option<f64>,
    pub formats: Vec<MediaFormat>,
}

/// A media file written to the media root by an extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedMedia {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Per-invocation inputs handed to an extractor.
///
/// The cookie bundle is an immutable snapshot taken when the attempt
/// starts; a replacement installed mid-attempt is not observed.
#[derive(Debug, Clone)]
pub struct ExtractContext {
    pub task_id: String,
    pub output_dir: PathBuf,
    pub cookies: Option<Arc<CookieBundle>>,
}

impl ExtractContext {
    /// Deterministic destination for this task's artifact.
    #[must_use]
    pub fn output_path(&self, ext: &str) -> PathBuf {
        self.output_dir.join(media_file_name(&self.task_id, ext))
    }
}

/// Capability implemented once per platform.
///
/// Implementations classify every failure at this boundary: the executor
/// only sees [`ExtractError::Retryable`] or [`ExtractError::Fatal`].
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Platform this extractor serves.
    fn platform(&self) -> Platform;

    /// Whether a cookie bundle must be installed before extraction.
    fn requires_auth(&self) -> bool {
        self.platform().requires_auth()
    }

    /// Lists metadata and available formats for `url`.
    async fn fetch_formats(&self, url: &Url, ctx: &ExtractContext)
    -> Result<FormatList, ExtractError>;

    /// Downloads `format` to [`ExtractContext::output_path`].
    async fn fetch_and_materialize(
        &self,
        url: &Url,
        format: &MediaFormat,
        ctx: &ExtractContext,
    ) -> Result<MaterializedMedia, ExtractError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_is_named_after_task() {
        let ctx = ExtractContext {
            task_id: "abc".to_string(),
            output_dir: PathBuf::from("/srv/media"),
            cookies: None,
        };
        assert_eq!(ctx.output_path("mp4"), PathBuf::from("/srv/media/abc.mp4"));
    }

    #[test]
    fn test_audio_only_detection() {
        let format = MediaFormat {
            format_id: "140".to_string(),
            ext: "m4a".to_string(),
            height: None,
            has_video: false,
            has_audio: true,
            filesize: None,
            url: "https://cdn.example.com/a".to_string(),
            http_headers: BTreeMap::new(),
        };
        assert!(format.is_audio_only());
    }
}
