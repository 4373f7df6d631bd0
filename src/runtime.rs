//! Wires every component from one [`EngineConfig`].
//!
//! The request side ([`DownloadService`]) and the execution side
//! ([`WorkerPool`], [`FileSweeper`]) share nothing but the database, the
//! cookie directory and the media root, so each process builds its own
//! [`Engine`] from the same config and they cooperate through those.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::auth::CookieStore;
use crate::cache::Cache;
use crate::clock::SharedClock;
use crate::config::{ConfigError, EngineConfig};
use crate::db::{Database, DbError};
use crate::download::{Executor, PoolStats, RetryPolicy, WorkerPool};
use crate::extractor::{ExtractorRegistry, MediaFetcher, build_default_registry};
use crate::gateway::{DownloadService, RateLimiter, ServiceTimings, SqliteWindowStore, WindowStore};
use crate::media::{FileSweeper, MediaError, MediaStore};
use crate::queue::TaskQueue;

/// Scope prefix for async submission counters.
pub const SUBMIT_SCOPE: &str = "submit";

/// Scope prefix for synchronous download counters.
pub const SYNC_SCOPE: &str = "sync";

/// Errors raised while assembling an [`Engine`].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Every long-lived component, built once per process.
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    db: Database,
    queue: TaskQueue,
    media: MediaStore,
    cookies: Arc<CookieStore>,
    cache: Cache,
    service: DownloadService,
    pool: WorkerPool,
    sweeper: FileSweeper,
}

impl Engine {
    /// Builds the production engine with the `yt-dlp` backed registry.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] if the config is invalid, the database cannot
    /// be opened, or the HTTP client or media root cannot be set up.
    pub async fn build(config: EngineConfig, clock: SharedClock) -> Result<Self, BuildError> {
        let fetcher = MediaFetcher::new()?;
        let registry = build_default_registry(&config.ytdlp_program, &fetcher);
        Self::with_registry(config, clock, registry).await
    }

    /// Builds an engine around a caller-supplied extractor registry.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::build`].
    #[instrument(skip_all, fields(db = %config.database_path.display()))]
    pub async fn with_registry(
        config: EngineConfig,
        clock: SharedClock,
        registry: ExtractorRegistry,
    ) -> Result<Self, BuildError> {
        config.validate()?;

        let db = Database::new(&config.database_path).await?;
        let queue = TaskQueue::new(db.clone(), Arc::clone(&clock));
        let media = MediaStore::new(
            db.clone(),
            config.media_root.clone(),
            Arc::clone(&clock),
            config.file_ttl(),
        );
        media.ensure_root().await?;

        let cookies = Arc::new(CookieStore::new(config.cookie_dir.clone(), Arc::clone(&clock)));
        let loaded = cookies.load_from_dir().await;

        let cache = Cache::in_memory(Arc::clone(&clock), &config.effective_cache_ttl());
        let registry = Arc::new(registry);

        let window_store: Arc<dyn WindowStore> = Arc::new(SqliteWindowStore::new(db.clone()));
        let submit_limiter = RateLimiter::new(
            SUBMIT_SCOPE,
            config.rate_limit.submit_ceiling,
            config.rate_limit_window(),
            Arc::clone(&window_store),
            Arc::clone(&clock),
        );
        let sync_limiter = RateLimiter::new(
            SYNC_SCOPE,
            config.rate_limit.sync_ceiling,
            config.rate_limit_window(),
            window_store,
            Arc::clone(&clock),
        );
        let service = DownloadService::new(
            queue.clone(),
            cache.clone(),
            submit_limiter,
            sync_limiter,
            ServiceTimings {
                poll_interval: config.poll_interval(),
                sync_wait_timeout: config.sync_wait_timeout(),
            },
        )
        .with_extractors(
            Arc::clone(&registry),
            Arc::clone(&cookies),
            config.media_root.clone(),
        );

        let executor = Executor::new(
            queue.clone(),
            media.clone(),
            registry,
            Arc::clone(&cookies),
            cache.clone(),
            RetryPolicy::from_config(&config),
            config.extraction_timeout(),
        );
        let pool = WorkerPool::new(
            executor,
            config.worker_concurrency,
            config.poll_interval(),
            config.stale_task_after(),
        );

        let sweeper = FileSweeper::new(media.clone(), queue.clone())
            .with_cache(cache.clone())
            .with_stale_recovery(config.stale_task_after(), config.max_attempts);

        info!(cookie_bundles = loaded, "engine ready");
        Ok(Self {
            config,
            db,
            queue,
            media,
            cookies,
            cache,
            service,
            pool,
            sweeper,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    #[must_use]
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    #[must_use]
    pub fn media(&self) -> &MediaStore {
        &self.media
    }

    #[must_use]
    pub fn cookies(&self) -> &Arc<CookieStore> {
        &self.cookies
    }

    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    #[must_use]
    pub fn service(&self) -> &DownloadService {
        &self.service
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    #[must_use]
    pub fn sweeper(&self) -> &FileSweeper {
        &self.sweeper
    }

    /// Runs the worker pool and the periodic sweeper until `shutdown` fires.
    pub async fn run_workers(&self, shutdown: CancellationToken) -> PoolStats {
        let sweeper = self.sweeper.clone();
        let interval = self.config.sweep_interval();
        let sweep_shutdown = shutdown.clone();
        let sweep_handle =
            tokio::spawn(async move { sweeper.run(interval, sweep_shutdown).await });

        let stats = self.pool.run(shutdown).await;
        if let Err(e) = sweep_handle.await {
            tracing::warn!(error = %e, "sweeper task panicked");
        }
        stats
    }
}
