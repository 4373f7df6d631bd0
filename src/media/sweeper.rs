//! Periodic TTL sweep of the media root.
//!
//! Each pass deletes files whose record has expired, then removes orphaned
//! files under the root that have no record at all. A single failed delete
//! is logged and counted; it never aborts the rest of the pass.

use std::io;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{MediaError, MediaRecord, MediaStore, task_id_from_file_name};
use crate::cache::Cache;
use crate::clock::duration_ms;
use crate::queue::TaskQueue;

/// Counters from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired files deleted.
    pub deleted: usize,
    /// Expired records whose file was already gone.
    pub missing: usize,
    /// Deletions that failed; their records are kept for the next pass.
    pub failed: usize,
    /// Unrecorded files deleted.
    pub orphans_deleted: usize,
    pub bytes_freed: u64,
}

/// Stale-task recovery run alongside each sweep.
#[derive(Debug, Clone, Copy)]
struct StaleRecovery {
    older_than: Duration,
    max_attempts: u32,
}

/// File lifecycle manager.
#[derive(Debug, Clone)]
pub struct FileSweeper {
    media: MediaStore,
    queue: TaskQueue,
    cache: Option<Cache>,
    stale: Option<StaleRecovery>,
}

impl FileSweeper {
    #[must_use]
    pub fn new(media: MediaStore, queue: TaskQueue) -> Self {
        Self {
            media,
            queue,
            cache: None,
            stale: None,
        }
    }

    /// Also purges expired cache entries on every scheduled pass.
    #[must_use]
    pub fn with_cache(mut self, cache: Cache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Also recovers tasks stuck in `PROGRESS` on every scheduled pass.
    #[must_use]
    pub fn with_stale_recovery(mut self, older_than: Duration, max_attempts: u32) -> Self {
        self.stale = Some(StaleRecovery {
            older_than,
            max_attempts,
        });
        self
    }

    /// Runs one full pass: expired records first, then orphans.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError`] only when the record table cannot be read.
    /// Per-file failures are counted in the report.
    #[instrument(skip(self), fields(root = %self.media.root().display()))]
    pub async fn sweep_once(&self) -> Result<SweepReport, MediaError> {
        let mut report = SweepReport::default();
        let now = self.media.clock().now_ms();

        for record in self.media.list_expired(now).await? {
            self.delete_expired(&record, &mut report).await;
        }

        self.sweep_orphans(now, &mut report).await?;

        if report == SweepReport::default() {
            debug!("sweep found nothing to delete");
        } else {
            info!(
                deleted = report.deleted,
                missing = report.missing,
                failed = report.failed,
                orphans_deleted = report.orphans_deleted,
                bytes_freed = report.bytes_freed,
                "sweep complete"
            );
        }
        Ok(report)
    }

    async fn delete_expired(&self, record: &MediaRecord, report: &mut SweepReport) {
        let path = Path::new(&record.path);
        let size = tokio::fs::metadata(path).await.map(|m| m.len()).ok();

        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                report.deleted += 1;
                report.bytes_freed += size.unwrap_or(0);
                debug!(task_id = %record.task_id, path = %record.path, "deleted expired file");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.missing += 1;
                warn!(task_id = %record.task_id, path = %record.path, "expired file already gone");
            }
            Err(e) => {
                report.failed += 1;
                warn!(path = %record.path, error = %e, "could not delete expired file");
                return;
            }
        }

        if let Err(e) = self.media.remove_record(record.id).await {
            warn!(record_id = record.id, error = %e, "could not remove media record");
        }
    }

    /// Deletes unrecorded files older than the TTL whose task is not in flight.
    ///
    /// Hidden files (cookie temp files, bundle swaps) are never touched.
    async fn sweep_orphans(&self, now: i64, report: &mut SweepReport) -> Result<(), MediaError> {
        let root = self.media.root();
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(MediaError::io(root, e)),
        };
        let known = self.media.known_paths().await?;
        let ttl_ms = duration_ms(self.media.ttl());

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "stopping orphan scan after read error");
                    break;
                }
            };
            let path = entry.path();
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with('.') || known.contains(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Some(modified_ms) = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(duration_ms)
            else {
                continue;
            };
            if modified_ms.saturating_add(ttl_ms) > now {
                continue;
            }
            if let Some(task_id) = task_id_from_file_name(name)
                && let Some(task) = self.queue.get(task_id).await?
                && !task.state().is_terminal()
            {
                debug!(task_id, "keeping file of in-flight task");
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    report.orphans_deleted += 1;
                    report.bytes_freed += meta.len();
                    debug!(path = %path.display(), "deleted orphan file");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(path = %path.display(), error = %e, "could not delete orphan file");
                }
            }
        }
        Ok(())
    }

    /// One scheduled maintenance tick: stale recovery, sweep, cache purge.
    pub async fn tick(&self) {
        if let Some(stale) = self.stale {
            if let Err(e) = self
                .queue
                .requeue_stale(stale.older_than, stale.max_attempts)
                .await
            {
                warn!(error = %e, "stale task recovery failed");
            }
        }
        if let Err(e) = self.sweep_once().await {
            error!(error = %e, "sweep failed");
        }
        if let Some(cache) = &self.cache {
            let purged = cache.purge_expired();
            if purged > 0 {
                debug!(purged, "purged expired cache entries");
            }
        }
    }

    /// Ticks every `interval` until `shutdown` is cancelled.
    #[instrument(skip(self, shutdown), fields(interval_secs = interval.as_secs()))]
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("file sweeper started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        info!("file sweeper stopped");
    }
}
