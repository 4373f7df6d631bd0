//! Fixed-window request rate limiting per client key.
//!
//! Each scope (submit, sync download) has its own ceiling and counts hits in
//! a window that opens on the first request from a client and lasts
//! `window`. Counting happens inside the backing store in one atomic step,
//! so concurrent requests cannot undercount.
//!
//! # Example
//!
//! ```ignore
//! let limiter = RateLimiter::new("submit", 10, Duration::from_secs(60), store, clock);
//! match limiter.check("203.0.113.7").await {
//!     RateDecision::Allowed { remaining } => { /* enqueue */ }
//!     RateDecision::Limited { retry_after } => { /* reject */ }
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::clock::{SharedClock, duration_ms};
use crate::db::Database;

/// Result of counting one hit against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowHit {
    /// Counted; `count` is the number of hits in the window including this one.
    Counted { window_start: i64, count: u32 },
    /// Ceiling already reached; nothing was counted.
    Rejected { window_start: i64 },
}

/// Shared counter storage.
#[async_trait]
pub trait WindowStore: Send + Sync + fmt::Debug {
    /// Atomically counts a hit for `key` unless its current window is full.
    ///
    /// A window whose `window_start + window_ms <= now` is replaced by a new
    /// one starting at `now`.
    async fn hit(
        &self,
        key: &str,
        now: i64,
        window_ms: i64,
        ceiling: u32,
    ) -> Result<WindowHit, sqlx::Error>;

    /// Drops windows older than the previous one.
    async fn purge(&self, now: i64, window_ms: i64) -> Result<u64, sqlx::Error>;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: i64,
    count: u32,
}

/// In-process store; shared by every request handler in one process.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    windows: DashMap<String, Window>,
}

impl MemoryWindowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn hit(
        &self,
        key: &str,
        now: i64,
        window_ms: i64,
        ceiling: u32,
    ) -> Result<WindowHit, sqlx::Error> {
        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut window = self.windows.entry(key.to_string()).or_insert(Window {
            start: now,
            count: 0,
        });
        if window.start.saturating_add(window_ms) <= now {
            *window = Window {
                start: now,
                count: 0,
            };
        }
        if window.count >= ceiling {
            return Ok(WindowHit::Rejected {
                window_start: window.start,
            });
        }
        window.count += 1;
        Ok(WindowHit::Counted {
            window_start: window.start,
            count: window.count,
        })
    }

    async fn purge(&self, now: i64, window_ms: i64) -> Result<u64, sqlx::Error> {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| w.start.saturating_add(window_ms.saturating_mul(2)) > now);
        Ok(u64::try_from(before.saturating_sub(self.windows.len())).unwrap_or(0))
    }
}

/// Store on the shared database, for limits enforced across processes.
#[derive(Debug, Clone)]
pub struct SqliteWindowStore {
    db: Database,
}

impl SqliteWindowStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl WindowStore for SqliteWindowStore {
    async fn hit(
        &self,
        key: &str,
        now: i64,
        window_ms: i64,
        ceiling: u32,
    ) -> Result<WindowHit, sqlx::Error> {
        // SET expressions and the WHERE guard all read the pre-update row, so
        // reset-or-increment happens in one statement. No returned row means
        // the guard failed: the window is live and full.
        let counted: Option<(i64, i64)> = sqlx::query_as(
            r"INSERT INTO rate_limit_windows (client_key, window_start, count)
              VALUES (?1, ?2, 1)
              ON CONFLICT (client_key) DO UPDATE SET
                  window_start = CASE WHEN window_start + ?3 <= ?2 THEN ?2 ELSE window_start END,
                  count = CASE WHEN window_start + ?3 <= ?2 THEN 1 ELSE count + 1 END
              WHERE window_start + ?3 <= ?2 OR count < ?4
              RETURNING window_start, count",
        )
        .bind(key)
        .bind(now)
        .bind(window_ms)
        .bind(i64::from(ceiling))
        .fetch_optional(self.db.pool())
        .await?;

        if let Some((window_start, count)) = counted {
            return Ok(WindowHit::Counted {
                window_start,
                count: u32::try_from(count).unwrap_or(u32::MAX),
            });
        }

        let window_start: i64 = sqlx::query_scalar(
            r"SELECT window_start FROM rate_limit_windows WHERE client_key = ?",
        )
        .bind(key)
        .fetch_optional(self.db.pool())
        .await?
        .unwrap_or(now);
        Ok(WindowHit::Rejected { window_start })
    }

    async fn purge(&self, now: i64, window_ms: i64) -> Result<u64, sqlx::Error> {
        let result =
            sqlx::query(r"DELETE FROM rate_limit_windows WHERE window_start + 2 * ? <= ?")
                .bind(window_ms)
                .bind(now)
                .execute(self.db.pool())
                .await?;
        Ok(result.rows_affected())
    }
}

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

/// Per-scope limiter over a shared [`WindowStore`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
    scope: &'static str,
    ceiling: u32,
    window: Duration,
    store: Arc<dyn WindowStore>,
    clock: SharedClock,
}

impl RateLimiter {
    #[must_use]
    pub fn new(
        scope: &'static str,
        ceiling: u32,
        window: Duration,
        store: Arc<dyn WindowStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            scope,
            ceiling,
            window,
            store,
            clock,
        }
    }

    #[must_use]
    pub fn scope(&self) -> &'static str {
        self.scope
    }

    #[must_use]
    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Counts one request from `client_key`.
    ///
    /// A store failure is logged and the request is let through: losing the
    /// counter store must not take request handling down with it.
    pub async fn check(&self, client_key: &str) -> RateDecision {
        let now = self.clock.now_ms();
        let window_ms = duration_ms(self.window);
        let key = format!("{}:{client_key}", self.scope);

        match self.store.hit(&key, now, window_ms, self.ceiling).await {
            Ok(WindowHit::Counted { count, .. }) => RateDecision::Allowed {
                remaining: self.ceiling.saturating_sub(count),
            },
            Ok(WindowHit::Rejected { window_start }) => {
                let wait_ms = window_start.saturating_add(window_ms).saturating_sub(now).max(0);
                let retry_after = Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0));
                debug!(
                    scope = self.scope,
                    client = client_key,
                    retry_after_ms = wait_ms,
                    "rate limited"
                );
                RateDecision::Limited { retry_after }
            }
            Err(error) => {
                warn!(scope = self.scope, error = %error, "rate limit store unavailable, allowing request");
                RateDecision::Allowed {
                    remaining: self.ceiling,
                }
            }
        }
    }

    /// Boolean form of [`check`](Self::check).
    pub async fn allow(&self, client_key: &str) -> bool {
        matches!(self.check(client_key).await, RateDecision::Allowed { .. })
    }

    /// Drops windows that can no longer affect a decision.
    pub async fn purge(&self) {
        let now = self.clock.now_ms();
        match self.store.purge(now, duration_ms(self.window)).await {
            Ok(0) => {}
            Ok(purged) => debug!(scope = self.scope, purged, "purged rate limit windows"),
            Err(error) => warn!(scope = self.scope, error = %error, "rate limit purge failed"),
        }
    }
}
