//! Durable job pipeline: typed jobs in SQLite, one dispatcher, one worker
//! pool per job type.
//!
//! ## Components
//!
//! - `Job` / `NewJob`: persisted unit of work with a JSON payload
//! - `JobStore`: persistence and the status state machine (in-memory or SQLite)
//! - `Dispatcher`: polls for due jobs and claims them for the pools
//! - `WorkerPool`: bounded concurrency, heartbeats and retry with backoff
//! - Handlers: mirror-item, mirror-replies and discovery on top of a `Bridge`

pub mod dispatcher;
pub mod handlers;
pub mod pool;
pub mod sqlite;
pub mod store;
pub mod types;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use handlers::{DiscoveryHandler, ItemLocks, MirrorItemHandler, MirrorRepliesHandler};
pub use pool::{JobHandler, PoolConfig, PoolHandle, PoolIntake, PoolStats, WorkerPool};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError, StatusChange};
pub use types::{
    DEFAULT_MAX_RETRIES, DiscoveryPayload, EnqueueOutcome, Job, JobFilter, JobId, JobOutcome,
    JobStats, JobStatus, JobType, MirrorItemPayload, MirrorRepliesPayload, NewJob, RetryPolicy,
};
