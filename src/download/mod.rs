//! Task execution: retry policy, execution locks, executor and worker pool.
//!
//! # Example
//!
//! ```ignore
//! let executor = Executor::new(queue, media, registry, cookies, cache, policy, timeout);
//! let pool = WorkerPool::new(executor, 4, Duration::from_millis(500), Duration::from_secs(3600));
//!
//! let shutdown = CancellationToken::new();
//! let stats = pool.run(shutdown.clone()).await;
//! ```

mod engine;
mod locks;
mod retry;

pub use engine::{AttemptOutcome, EngineError, Executor, PoolStats, WorkerPool};
pub use locks::{ExecutionGuard, ExecutionLocks};
pub use retry::{RetryDecision, RetryPolicy};
