//! Background job system with retry, backoff, and dead-letter handling.
//!
//! ## Components
//!
//! - `JobPayload`: the closed set of job types, carried on the wire as `{type, data}`
//! - `JobQueue`: producer handle used by services
//! - `JobStore`: persistence for jobs (in-memory or Postgres)
//! - `WorkerPool`: claims due jobs and runs them with bounded concurrency
//!
//! Jobs that exhaust their attempts stay in the store as `DeadLettered` for inspection
//! and manual replay.

pub mod executor;
pub mod payload;
pub mod postgres;
pub mod queue;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobOutcome, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use payload::{
    ASSET_CLEANUP, AssetCleanupJob, BULK_IMPORT, BulkImportJob, IMAGE_OPTIMIZATION,
    ImageOptimizationJob, JobError, JobHandlers, JobPayload, dispatch,
};
pub use postgres::PostgresJobStore;
pub use queue::JobQueue;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DEFAULT_LEASE, EnqueueOptions, Job, JobAttemptRecord, JobEnvelope, JobId, JobStatus,
    RetryPolicy,
};
