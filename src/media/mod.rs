//! Media root layout and `MediaFile` records.
//!
//! Produced files live directly under the media root, named
//! `<task_id>.<ext>`. Each file gets a row in `media_files` carrying its
//! creation time and TTL; only the [`sweeper`] deletes files.

pub mod sweeper;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::clock::{SharedClock, duration_ms};
use crate::db::Database;

pub use sweeper::{FileSweeper, SweepReport};

/// Deterministic file name for a task's artifact.
#[must_use]
pub fn media_file_name(task_id: &str, ext: &str) -> String {
    let ext = ext.trim_start_matches('.');
    if ext.is_empty() {
        task_id.to_string()
    } else {
        format!("{task_id}.{ext}")
    }
}

/// Task id a media-root file name belongs to (everything before the first dot).
#[must_use]
pub fn task_id_from_file_name(name: &str) -> Option<&str> {
    let stem = name.split('.').next()?;
    (!stem.is_empty()).then_some(stem)
}

/// Errors from media bookkeeping.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("media I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
}

impl MediaError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// One row of `media_files`.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct MediaRecord {
    pub id: i64,
    pub task_id: String,
    pub path: String,
    pub size_bytes: i64,
    pub created_at: i64,
    pub ttl_ms: i64,
}

impl MediaRecord {
    /// Epoch ms at which the file becomes eligible for deletion.
    #[must_use]
    pub fn expires_at(&self) -> i64 {
        self.created_at.saturating_add(self.ttl_ms)
    }
}

/// Registry of produced files under one media root.
#[derive(Debug, Clone)]
pub struct MediaStore {
    db: Database,
    root: PathBuf,
    clock: SharedClock,
    ttl: Duration,
}

impl MediaStore {
    #[must_use]
    pub fn new(db: Database, root: impl Into<PathBuf>, clock: SharedClock, ttl: Duration) -> Self {
        Self {
            db,
            root: root.into(),
            clock,
            ttl,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Final path for a task's artifact.
    #[must_use]
    pub fn path_for(&self, task_id: &str, ext: &str) -> PathBuf {
        self.root.join(media_file_name(task_id, ext))
    }

    /// Creates the media root if needed.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::Io`] when the directory cannot be created.
    pub async fn ensure_root(&self) -> Result<(), MediaError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| MediaError::io(&self.root, e))
    }

    /// Records a produced file, starting its TTL now.
    ///
    /// Registering the same path again (a later attempt of the same task)
    /// restarts its TTL.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::Database`] if the upsert fails.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn register(
        &self,
        task_id: &str,
        path: &Path,
        size_bytes: u64,
    ) -> Result<MediaRecord, MediaError> {
        let now = self.clock.now_ms();
        let record = sqlx::query_as::<_, MediaRecord>(
            r"INSERT INTO media_files (task_id, path, size_bytes, created_at, ttl_ms)
              VALUES (?, ?, ?, ?, ?)
              ON CONFLICT (path) DO UPDATE SET
                  task_id = excluded.task_id,
                  size_bytes = excluded.size_bytes,
                  created_at = excluded.created_at,
                  ttl_ms = excluded.ttl_ms
              RETURNING *",
        )
        .bind(task_id)
        .bind(path.to_string_lossy().into_owned())
        .bind(i64::try_from(size_bytes).unwrap_or(i64::MAX))
        .bind(now)
        .bind(duration_ms(self.ttl))
        .fetch_one(self.db.pool())
        .await?;

        debug!(record_id = record.id, expires_at = record.expires_at(), "media registered");
        Ok(record)
    }

    /// Records belonging to one task.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::Database`] if the query fails.
    pub async fn get_for_task(&self, task_id: &str) -> Result<Vec<MediaRecord>, MediaError> {
        let records = sqlx::query_as::<_, MediaRecord>(
            r"SELECT * FROM media_files WHERE task_id = ? ORDER BY id",
        )
        .bind(task_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(records)
    }

    /// Records eligible for deletion at `now`.
    ///
    /// A record qualifies once `created_at + ttl` has passed and its owning
    /// task has been terminal for at least the TTL.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::Database`] if the query fails.
    pub async fn list_expired(&self, now: i64) -> Result<Vec<MediaRecord>, MediaError> {
        let records = sqlx::query_as::<_, MediaRecord>(
            r"SELECT m.* FROM media_files m
              JOIN tasks t ON t.id = m.task_id
              WHERE m.created_at + m.ttl_ms <= ?1
                AND t.state IN ('SUCCESS', 'FAILURE')
                AND COALESCE(t.completed_at, t.updated_at) + m.ttl_ms <= ?1
              ORDER BY m.created_at ASC",
        )
        .bind(now)
        .fetch_all(self.db.pool())
        .await?;
        Ok(records)
    }

    /// Every recorded path, for orphan detection.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::Database`] if the query fails.
    pub async fn known_paths(&self) -> Result<HashSet<PathBuf>, MediaError> {
        let paths: Vec<String> = sqlx::query_scalar(r"SELECT path FROM media_files")
            .fetch_all(self.db.pool())
            .await?;
        Ok(paths.into_iter().map(PathBuf::from).collect())
    }

    /// Deletes a record (not the file).
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::Database`] if the delete fails.
    pub async fn remove_record(&self, id: i64) -> Result<bool, MediaError> {
        let result = sqlx::query(r"DELETE FROM media_files WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
