//! Request-facing service.
//!
//! Everything an HTTP layer (or the CLI) needs: submit a URL, poll a task,
//! wait synchronously for a file, cancel, list history, look up the formats
//! a URL offers without downloading, and read task totals. Validation,
//! platform detection and rate limiting all happen here, before a task is
//! created, and are reported as [`RequestError`].

mod error;
pub mod rate_limiter;

pub use error::{ErrorBody, RequestError};
pub use rate_limiter::{
    MemoryWindowStore, RateDecision, RateLimiter, SqliteWindowStore, WindowHit, WindowStore,
};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::auth::CookieStore;
use crate::cache::{Cache, CacheClass};
use crate::clock::duration_ms;
use crate::extractor::{
    ExtractContext, ExtractError, ExtractorRegistry, FailureCause, FormatList, MediaFormat, Quality,
};
use crate::platform::{Platform, detect_platform};
use crate::queue::{
    CancelOutcome, HistoryEntry, HistoryQuery, HistorySummary, NewTask, Task, TaskCounts,
    TaskError, TaskQueue, TaskResult, TaskState,
};
use crate::validate::validate_url;

/// One submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub url: String,
    /// Quality string such as `720p`, `audio` or `best`; `None` means the default.
    pub quality: Option<String>,
    /// Rate-limit identity, usually the caller's address.
    pub client_key: String,
}

/// Reply to an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitResponse {
    pub task_id: String,
    pub status: &'static str,
    pub platform: Platform,
}

/// Reply to a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub task_id: String,
    pub status: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub attempt_count: i64,
}

impl From<&Task> for StatusResponse {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.state(),
            result: task.result(),
            error: task.error(),
            attempt_count: task.attempt_count,
        }
    }
}

/// Outcome of [`DownloadService::submit_and_wait`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The task succeeded within the wait and its file is on disk.
    File { path: PathBuf, status: StatusResponse },
    /// Still running when the wait ran out; poll `status` instead.
    Pending(StatusResponse),
    /// Finished without a servable file.
    Failed(StatusResponse),
}

/// Reply to a cancellation.
#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub task_id: String,
    pub outcome: &'static str,
    pub status: TaskState,
}

/// One downloadable format as shown to callers.
///
/// Direct media URLs and request headers stay internal: they are signed and
/// short-lived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatOption {
    pub format_id: String,
    pub ext: String,
    /// `720p`-style label for video, `audio` for audio-only streams.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub has_video: bool,
    pub has_audio: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
}

impl From<&MediaFormat> for FormatOption {
    fn from(format: &MediaFormat) -> Self {
        let quality = match format.height {
            Some(height) => Some(Quality::Height(height)),
            None if format.is_audio_only() => Some(Quality::Audio),
            None => None,
        };
        Self {
            format_id: format.format_id.clone(),
            ext: format.ext.clone(),
            quality,
            height: format.height,
            has_video: format.has_video,
            has_audio: format.has_audio,
            filesize: format.filesize,
        }
    }
}

/// Reply to a format lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatsResponse {
    pub url: String,
    pub platform: Platform,
    pub title: Option<String>,
    pub author: Option<String>,
    pub duration_secs: Option<f64>,
    pub formats: Vec<FormatOption>,
    /// True when served from the format cache.
    pub cached: bool,
}

impl FormatsResponse {
    fn new(url: String, platform: Platform, list: &FormatList, cached: bool) -> Self {
        Self {
            url,
            platform,
            title: list.title.clone(),
            author: list.author.clone(),
            duration_secs: list.duration_secs,
            formats: list.formats.iter().map(FormatOption::from).collect(),
            cached,
        }
    }
}

/// Task and download totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsResponse {
    pub tasks: TaskCounts,
    pub downloads: HistorySummary,
    /// Width of the `downloads.recent` window.
    pub recent_window_secs: u64,
}

/// Window counted as recent in [`StatsResponse`].
pub const STATS_RECENT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Extractor access for format lookups made outside any task.
#[derive(Debug, Clone)]
struct FormatSource {
    registry: Arc<ExtractorRegistry>,
    cookies: Arc<CookieStore>,
    scratch_dir: PathBuf,
}

/// Service timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct ServiceTimings {
    pub poll_interval: Duration,
    pub sync_wait_timeout: Duration,
}

/// The request-facing service.
#[derive(Debug, Clone)]
pub struct DownloadService {
    queue: TaskQueue,
    cache: Cache,
    submit_limiter: RateLimiter,
    sync_limiter: RateLimiter,
    timings: ServiceTimings,
    format_source: Option<FormatSource>,
}

impl DownloadService {
    #[must_use]
    pub fn new(
        queue: TaskQueue,
        cache: Cache,
        submit_limiter: RateLimiter,
        sync_limiter: RateLimiter,
        timings: ServiceTimings,
    ) -> Self {
        Self {
            queue,
            cache,
            submit_limiter,
            sync_limiter,
            timings,
            format_source: None,
        }
    }

    /// Enables [`formats`](Self::formats) through these extractors.
    ///
    /// `scratch_dir` is handed to extractors as their output directory;
    /// format lookups never write to it.
    #[must_use]
    pub fn with_extractors(
        mut self,
        registry: Arc<ExtractorRegistry>,
        cookies: Arc<CookieStore>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        self.format_source = Some(FormatSource {
            registry,
            cookies,
            scratch_dir: scratch_dir.into(),
        });
        self
    }

    #[must_use]
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Validates, detects, rate-limits and enqueues.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::RateLimited`], a validation or detection
    /// error, or an internal queue error. No task exists after an error.
    #[instrument(skip(self, request), fields(client = %request.client_key))]
    pub async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResponse, RequestError> {
        limit(&self.submit_limiter, &request.client_key).await?;
        self.accept(request).await
    }

    /// Current state of a task.
    ///
    /// Terminal statuses are served from the result cache when present.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::TaskNotFound`] for unknown ids.
    #[instrument(skip(self))]
    pub async fn status(&self, task_id: &str) -> Result<StatusResponse, RequestError> {
        if let Some(cached) = self.cache.get::<StatusResponse>(CacheClass::Result, task_id) {
            return Ok(cached);
        }
        let task = self
            .queue
            .get(task_id)
            .await?
            .ok_or_else(|| RequestError::TaskNotFound(task_id.to_string()))?;
        let status = StatusResponse::from(&task);
        if status.status.is_terminal() {
            self.cache.set(CacheClass::Result, task_id, &status);
        }
        Ok(status)
    }

    /// Submits, then polls until the task finishes or the wait times out.
    ///
    /// Uses the stricter sync-download rate limit. A worker pool must be
    /// running against the same queue for the task to progress.
    ///
    /// # Errors
    ///
    /// Same as [`submit`](Self::submit); a timeout is not an error.
    #[instrument(skip(self, request), fields(client = %request.client_key))]
    pub async fn submit_and_wait(&self, request: &SubmitRequest) -> Result<SyncOutcome, RequestError> {
        limit(&self.sync_limiter, &request.client_key).await?;
        let accepted = self.accept(request).await?;
        self.wait_for(&accepted.task_id, self.timings.sync_wait_timeout)
            .await
    }

    /// Polls an existing task for up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::TaskNotFound`] for unknown ids.
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Result<SyncOutcome, RequestError> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.status(task_id).await?;
            match status.status {
                TaskState::Success => return Ok(servable(status).await),
                TaskState::Failure => return Ok(SyncOutcome::Failed(status)),
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(task_id, "sync wait timed out, falling back to polling");
                return Ok(SyncOutcome::Pending(status));
            }
            tokio::time::sleep(self.timings.poll_interval.min(deadline - now)).await;
        }
    }

    /// Administrative cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::TaskNotFound`] for unknown ids.
    #[instrument(skip(self))]
    pub async fn cancel(&self, task_id: &str) -> Result<CancelResponse, RequestError> {
        let outcome = self.queue.cancel(task_id).await?;
        if let CancelOutcome::Cancelled(task) = &outcome {
            self.cache.invalidate(CacheClass::Result, task_id);
            if let Err(e) = self.queue.record_history(task, None).await {
                warn!(task_id, error = %e, "failed to record history for cancelled task");
            }
        }
        let task = outcome.task();
        Ok(CancelResponse {
            task_id: task.id.clone(),
            outcome: outcome.as_str(),
            status: task.state(),
        })
    }

    /// Finished downloads, newest first.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the history table cannot be read.
    pub async fn history(&self, query: &HistoryQuery) -> Result<Vec<HistoryEntry>, RequestError> {
        Ok(self.queue.list_history(query).await?)
    }

    /// Lists the formats a URL offers without downloading anything.
    ///
    /// Rate-limited and validated like [`submit`](Self::submit). Listings
    /// are served from the format cache while fresh.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::RateLimited`], a validation or detection
    /// error, or [`RequestError::Extraction`] when the extractor fails.
    #[instrument(skip(self, client_key), fields(client = %client_key))]
    pub async fn formats(&self, url: &str, client_key: &str) -> Result<FormatsResponse, RequestError> {
        limit(&self.submit_limiter, client_key).await?;
        let url = validate_url(url)?;
        let platform = detect_platform(&url)?;

        if let Some(cached) = self.cache.get::<FormatList>(CacheClass::Formats, url.as_str()) {
            debug!(%platform, "format list served from cache");
            return Ok(FormatsResponse::new(url.to_string(), platform, &cached, true));
        }

        let missing = || {
            ExtractError::fatal(
                FailureCause::ExtractorMissing,
                format!("no extractor registered for {platform}"),
            )
        };
        let source = self.format_source.as_ref().ok_or_else(missing)?;
        let extractor = source.registry.get(platform).ok_or_else(missing)?;
        let cookies = source.cookies.get(platform);
        if extractor.requires_auth() && cookies.is_none() {
            return Err(ExtractError::fatal(
                FailureCause::AuthRequired,
                format!("{platform} requires authentication but no cookie bundle is installed"),
            )
            .into());
        }

        let ctx = ExtractContext {
            task_id: "format-lookup".to_string(),
            output_dir: source.scratch_dir.clone(),
            cookies,
        };
        let list = extractor.fetch_formats(&url, &ctx).await?;
        self.cache.set(CacheClass::Formats, url.as_str(), &list);
        info!(%platform, formats = list.formats.len(), "format list fetched");
        Ok(FormatsResponse::new(url.to_string(), platform, &list, false))
    }

    /// Task totals per state and download outcomes.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the task or history tables cannot be read.
    pub async fn stats(&self) -> Result<StatsResponse, RequestError> {
        let tasks = self.queue.task_counts().await?;
        let since = self
            .queue
            .clock()
            .now_ms()
            .saturating_sub(duration_ms(STATS_RECENT_WINDOW));
        let downloads = self.queue.summarize_history(since).await?;
        Ok(StatsResponse {
            tasks,
            downloads,
            recent_window_secs: STATS_RECENT_WINDOW.as_secs(),
        })
    }

    async fn accept(&self, request: &SubmitRequest) -> Result<SubmitResponse, RequestError> {
        let url = validate_url(&request.url)?;
        let platform = detect_platform(&url)?;
        let quality = match request.quality.as_deref() {
            Some(raw) if !raw.trim().is_empty() => raw.parse::<Quality>()?,
            _ => Quality::default(),
        };

        let task = self
            .queue
            .enqueue(&NewTask {
                url: url.to_string(),
                platform,
                quality,
                client_key: Some(request.client_key.clone()),
            })
            .await?;
        info!(task_id = %task.id, %platform, %quality, "submission accepted");

        Ok(SubmitResponse {
            task_id: task.id,
            status: "queued",
            platform,
        })
    }
}

async fn limit(limiter: &RateLimiter, client_key: &str) -> Result<(), RequestError> {
    match limiter.check(client_key).await {
        RateDecision::Allowed { .. } => Ok(()),
        RateDecision::Limited { retry_after } => Err(RequestError::RateLimited { retry_after }),
    }
}

/// A succeeded task is only servable while its first file still exists.
async fn servable(status: StatusResponse) -> SyncOutcome {
    let path = status
        .result
        .as_ref()
        .and_then(|r| r.media.first())
        .map(|m| PathBuf::from(&m.path));
    match path {
        Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => {
            SyncOutcome::File { path, status }
        }
        _ => SyncOutcome::Failed(status),
    }
}
