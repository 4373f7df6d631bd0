//! Mediafetch Core Library
//!
//! Accepts media page URLs from social and video platforms, turns each one
//! into a durable download task, runs the extraction in a bounded worker
//! pool with classified retries, and keeps the resulting files on disk for
//! a fixed time before sweeping them.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`validate`] - URL hygiene checks run before anything else
//! - [`platform`] - Hostname/path signature rules mapping a URL to a [`Platform`]
//! - [`extractor`] - Per-platform extraction capability, format selection, fetching
//! - [`queue`] - Durable task records, state transitions and download history
//! - [`download`] - Retry policy, executor and worker pool
//! - [`media`] - Media file records and the TTL sweeper
//! - [`gateway`] - Request-facing service with per-client rate limits
//! - [`auth`] - Per-platform cookie bundles
//! - [`cache`] - TTL cache for format lists and final results
//! - [`db`] - Database connection and schema management
//! - [`config`] - TOML engine configuration
//! - [`runtime`] - Builds every component from one config

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod download;
pub mod extractor;
pub mod gateway;
pub mod media;
pub mod platform;
pub mod queue;
pub mod runtime;
pub mod validate;
mod user_agent;

// Re-export commonly used types
pub use auth::{CookieBundle, CookieBundleInfo, CookieStore, CookieStoreError};
pub use cache::{Cache, CacheClass};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use db::{Database, DbError};
pub use download::{AttemptOutcome, EngineError, Executor, PoolStats, RetryDecision, RetryPolicy, WorkerPool};
pub use extractor::{
    ExtractContext, ExtractError, Extractor, ExtractorRegistry, FailureCause, FormatList,
    MaterializedMedia, MediaFormat, Quality,
};
pub use gateway::{
    CancelResponse, DownloadService, ErrorBody, FormatOption, FormatsResponse, RateDecision,
    RateLimiter, RequestError, StatsResponse, StatusResponse, SubmitRequest, SubmitResponse,
    SyncOutcome,
};
pub use media::{FileSweeper, MediaStore, SweepReport};
pub use platform::{Platform, UnsupportedPlatform, detect_platform};
pub use queue::{
    CancelOutcome, ErrorKind, HistoryEntry, HistoryQuery, HistoryStatus, HistorySummary,
    MediaLocator, NewTask, QueueError, Task, TaskCounts, TaskError, TaskQueue, TaskResult,
    TaskState,
};
pub use runtime::{BuildError, Engine};
pub use validate::{ValidationError, validate_url};
