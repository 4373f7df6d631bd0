//! Executor and worker pool.
//!
//! The [`Executor`] runs one claimed task attempt end to end: take the
//! execution lock, resolve the extractor and cookie bundle, fetch formats
//! (through the cache), select a format, materialize the file under a hard
//! timeout, then write the outcome back to the queue as a single
//! transition. The [`WorkerPool`] runs `concurrency` executors against the
//! shared queue.
//!
//! # Concurrency Model
//!
//! - Each worker loop processes one task at a time to completion
//! - Claims are atomic in the database, so any number of pools may share it
//! - A semaphore bounds in-flight attempts for [`WorkerPool::run_until_idle`]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::locks::ExecutionLocks;
use super::retry::{RetryDecision, RetryPolicy};
use crate::auth::CookieStore;
use crate::cache::{Cache, CacheClass};
use crate::clock::duration_ms;
use crate::extractor::{
    ExtractContext, ExtractError, Extractor, ExtractorRegistry, FailureCause, FormatList,
    select_format,
};
use crate::media::MediaStore;
use crate::queue::{MediaLocator, QueueError, Task, TaskError, TaskQueue, TaskResult, TaskState};

/// Error type for worker pool operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Queue operation failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// What one attempt did to its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Scheduled for another attempt after `delay`.
    Retrying { delay: Duration },
    Failed,
    /// Another executor holds the task, or it changed state underneath us.
    Skipped,
}

/// Counters from a pool run.
#[derive(Debug, Default)]
pub struct PoolStats {
    succeeded: AtomicUsize,
    retried: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
}

impl PoolStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Attempts that ran (everything except skips).
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.succeeded() + self.retried() + self.failed()
    }

    fn record(&self, outcome: AttemptOutcome) {
        let counter = match outcome {
            AttemptOutcome::Succeeded => &self.succeeded,
            AttemptOutcome::Retrying { .. } => &self.retried,
            AttemptOutcome::Failed => &self.failed,
            AttemptOutcome::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Runs claimed tasks.
#[derive(Debug, Clone)]
pub struct Executor {
    queue: TaskQueue,
    media: MediaStore,
    registry: Arc<ExtractorRegistry>,
    cookies: Arc<CookieStore>,
    cache: Cache,
    retry_policy: RetryPolicy,
    extraction_timeout: Duration,
    locks: ExecutionLocks,
}

impl Executor {
    #[must_use]
    pub fn new(
        queue: TaskQueue,
        media: MediaStore,
        registry: Arc<ExtractorRegistry>,
        cookies: Arc<CookieStore>,
        cache: Cache,
        retry_policy: RetryPolicy,
        extraction_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            media,
            registry,
            cookies,
            cache,
            retry_policy,
            extraction_timeout,
            locks: ExecutionLocks::new(),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    #[must_use]
    pub fn locks(&self) -> &ExecutionLocks {
        &self.locks
    }

    /// Claims and runs the next due task. `None` when nothing is due.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] when the claim itself fails.
    pub async fn run_next(&self) -> Result<Option<AttemptOutcome>, QueueError> {
        let Some(task) = self.queue.claim_next().await? else {
            return Ok(None);
        };
        Ok(Some(self.run_claimed(task).await))
    }

    /// Runs one attempt of a task already moved to `PROGRESS`.
    ///
    /// Queue failures while writing the outcome are logged; the task is
    /// then left in `PROGRESS` for stale recovery.
    #[instrument(skip(self, task), fields(task_id = %task.id, attempt = task.attempt_count))]
    pub async fn run_claimed(&self, task: Task) -> AttemptOutcome {
        let Some(_guard) = self.locks.try_acquire(&task.id) else {
            warn!("task already executing in this process, skipping duplicate");
            return AttemptOutcome::Skipped;
        };

        let attempt = match tokio::time::timeout(self.extraction_timeout, self.attempt(&task)).await
        {
            Ok(result) => result,
            Err(_) => Err(ExtractError::retryable(
                FailureCause::Timeout,
                format!(
                    "extraction exceeded {}s timeout",
                    self.extraction_timeout.as_secs_f64()
                ),
            )),
        };

        let written = match attempt {
            Ok((result, locator)) => self.finish_success(&task, &result, locator.as_ref()).await,
            Err(error) => self.finish_failure(&task, &error).await,
        };
        match written {
            Ok(outcome) => outcome,
            Err(QueueError::InvalidTransition { from, .. }) => {
                warn!(%from, "task changed state during attempt, outcome discarded");
                AttemptOutcome::Skipped
            }
            Err(error) => {
                error!(error = %error, "could not record attempt outcome");
                AttemptOutcome::Skipped
            }
        }
    }

    async fn attempt(
        &self,
        task: &Task,
    ) -> Result<(TaskResult, Option<MediaLocator>), ExtractError> {
        let platform = task.platform().ok_or_else(|| {
            ExtractError::fatal(
                FailureCause::ExtractorMissing,
                format!("unknown platform '{}'", task.platform_str),
            )
        })?;
        let extractor = self.registry.get(platform).ok_or_else(|| {
            ExtractError::fatal(
                FailureCause::ExtractorMissing,
                format!("no extractor registered for {platform}"),
            )
        })?;
        let url = Url::parse(&task.url).map_err(|e| {
            ExtractError::fatal(FailureCause::ContentUnavailable, format!("stored URL unparseable: {e}"))
        })?;

        if let Err(e) = self.cookies.refresh(platform).await {
            warn!(%platform, error = %e, "cookie bundle reload failed, keeping current one");
        }
        // One snapshot for the whole attempt; later installs are not observed.
        let cookies = self.cookies.get(platform);
        if extractor.requires_auth() && cookies.is_none() {
            return Err(ExtractError::fatal(
                FailureCause::AuthRequired,
                format!("{platform} requires authentication but no cookie bundle is installed"),
            ));
        }

        self.media
            .ensure_root()
            .await
            .map_err(|e| ExtractError::fatal(FailureCause::Storage, e.to_string()))?;
        let ctx = ExtractContext {
            task_id: task.id.clone(),
            output_dir: self.media.root().to_path_buf(),
            cookies,
        };

        let formats = self.formats(extractor.as_ref(), &url, &ctx).await?;
        let requested = task.quality();
        let selection = select_format(&formats, requested)?;
        if selection.substituted {
            info!(%requested, delivered = %selection.delivered, "requested quality unavailable, substituting");
        }

        let materialized = extractor
            .fetch_and_materialize(&url, selection.format, &ctx)
            .await?;
        let record = self
            .media
            .register(&task.id, &materialized.path, materialized.size_bytes)
            .await
            .map_err(|e| ExtractError::fatal(FailureCause::Storage, e.to_string()))?;

        let locator = MediaLocator {
            format_id: selection.format.format_id.clone(),
            quality: selection.delivered,
            ext: selection.format.ext.clone(),
            path: record.path.clone(),
            size_bytes: materialized.size_bytes,
            expires_at: record.expires_at(),
        };
        let result = TaskResult {
            title: formats.title.clone(),
            author: formats.author.clone(),
            duration_secs: formats.duration_secs,
            requested_quality: requested,
            delivered_quality: selection.delivered,
            quality_substituted: selection.substituted,
            media: vec![locator.clone()],
        };
        Ok((result, Some(locator)))
    }

    /// Fresh format listing for this attempt.
    ///
    /// Format URLs are signed and short-lived, so the cached list is never
    /// used to download. The new listing replaces it for format lookups.
    async fn formats(
        &self,
        extractor: &dyn Extractor,
        url: &Url,
        ctx: &ExtractContext,
    ) -> Result<FormatList, ExtractError> {
        let formats = extractor.fetch_formats(url, ctx).await?;
        self.cache.set(CacheClass::Formats, url.as_str(), &formats);
        Ok(formats)
    }

    async fn finish_success(
        &self,
        task: &Task,
        result: &TaskResult,
        locator: Option<&MediaLocator>,
    ) -> Result<AttemptOutcome, QueueError> {
        let done = self.queue.complete(&task.id, result).await?;
        self.record_history(&done, locator).await;
        Ok(AttemptOutcome::Succeeded)
    }

    async fn finish_failure(
        &self,
        task: &Task,
        error: &ExtractError,
    ) -> Result<AttemptOutcome, QueueError> {
        let task_error = TaskError::from_extract(error);
        match self.retry_policy.should_retry(error, task.attempts()) {
            RetryDecision::Retry { delay, next_attempt } => {
                let run_after = self.queue.clock().now_ms().saturating_add(duration_ms(delay));
                let updated = self.queue.mark_retry(&task.id, &task_error, run_after).await?;
                if updated.state() == TaskState::Failure {
                    self.record_history(&updated, None).await;
                    return Ok(AttemptOutcome::Failed);
                }
                info!(
                    next_attempt,
                    delay_ms = duration_ms(delay),
                    cause = error.cause().as_str(),
                    "attempt failed, will retry"
                );
                Ok(AttemptOutcome::Retrying { delay })
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(%reason, "not retrying");
                let failed = self.queue.fail(&task.id, &task_error).await?;
                self.record_history(&failed, None).await;
                Ok(AttemptOutcome::Failed)
            }
        }
    }

    async fn record_history(&self, task: &Task, locator: Option<&MediaLocator>) {
        if let Err(e) = self.queue.record_history(task, locator).await {
            warn!(task_id = %task.id, error = %e, "failed to record history");
        }
    }
}

/// Pool of executors pulling from the shared queue.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    executor: Arc<Executor>,
    concurrency: usize,
    poll_interval: Duration,
    stale_after: Duration,
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        executor: Executor,
        concurrency: usize,
        poll_interval: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            executor: Arc::new(executor),
            concurrency: concurrency.max(1),
            poll_interval,
            stale_after,
        }
    }

    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    async fn recover_stale(&self) {
        let max_attempts = self.executor.retry_policy.max_attempts();
        match self
            .executor
            .queue
            .requeue_stale(self.stale_after, max_attempts)
            .await
        {
            Ok(recovered) => {
                for task in recovered.iter().filter(|t| t.state().is_terminal()) {
                    self.executor.record_history(task, None).await;
                }
            }
            Err(e) => warn!(error = %e, "stale task recovery failed"),
        }
    }

    /// Runs `concurrency` worker loops until `shutdown` is cancelled.
    ///
    /// Each loop finishes its current attempt before exiting.
    #[instrument(skip(self, shutdown), fields(concurrency = self.concurrency))]
    pub async fn run(&self, shutdown: CancellationToken) -> PoolStats {
        self.recover_stale().await;
        info!("worker pool started");

        let stats = Arc::new(PoolStats::new());
        let mut handles = Vec::with_capacity(self.concurrency);
        for worker in 0..self.concurrency {
            let executor = Arc::clone(&self.executor);
            let stats = Arc::clone(&stats);
            let shutdown = shutdown.clone();
            let poll_interval = self.poll_interval;
            handles.push(tokio::spawn(async move {
                worker_loop(worker, &executor, &stats, poll_interval, &shutdown).await;
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task panicked");
            }
        }

        info!(
            succeeded = stats.succeeded(),
            retried = stats.retried(),
            failed = stats.failed(),
            "worker pool stopped"
        );
        Arc::try_unwrap(stats).unwrap_or_default()
    }

    /// Runs every task that is due now, then returns.
    ///
    /// Tasks scheduled for a later retry are left for a later call.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] if claiming fails, or
    /// [`EngineError::SemaphoreClosed`] if the semaphore is closed.
    #[instrument(skip(self), fields(concurrency = self.concurrency))]
    pub async fn run_until_idle(&self) -> Result<PoolStats, EngineError> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let stats = Arc::new(PoolStats::new());
        let mut handles = Vec::new();

        loop {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| EngineError::SemaphoreClosed)?;
            let Some(task) = self.executor.queue.claim_next().await? else {
                break;
            };
            let executor = Arc::clone(&self.executor);
            let stats = Arc::clone(&stats);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = executor.run_claimed(task).await;
                stats.record(outcome);
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "attempt task panicked");
            }
        }

        debug!(attempts = stats.attempts(), "no due tasks left");
        Ok(Arc::try_unwrap(stats).unwrap_or_default())
    }
}

async fn worker_loop(
    worker: usize,
    executor: &Executor,
    stats: &PoolStats,
    poll_interval: Duration,
    shutdown: &CancellationToken,
) {
    debug!(worker, "worker started");
    while !shutdown.is_cancelled() {
        match executor.run_next().await {
            Ok(Some(outcome)) => {
                stats.record(outcome);
                continue;
            }
            Ok(None) => {}
            Err(e) if e.is_contended() => debug!(worker, "claim contended, backing off"),
            Err(e) => warn!(worker, error = %e, "claim failed"),
        }
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
    debug!(worker, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_stats_record_each_outcome() {
        let stats = PoolStats::new();
        stats.record(AttemptOutcome::Succeeded);
        stats.record(AttemptOutcome::Retrying {
            delay: Duration::from_secs(1),
        });
        stats.record(AttemptOutcome::Retrying {
            delay: Duration::from_secs(2),
        });
        stats.record(AttemptOutcome::Failed);
        stats.record(AttemptOutcome::Skipped);

        assert_eq!(stats.succeeded(), 1);
        assert_eq!(stats.retried(), 2);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.skipped(), 1);
        assert_eq!(stats.attempts(), 4);
    }

    #[test]
    fn test_engine_error_display() {
        assert_eq!(
            EngineError::SemaphoreClosed.to_string(),
            "semaphore closed unexpectedly"
        );
    }
}
