//! Asynchronous job queue and worker pool.
//!
//! ## Components
//!
//! - `JobStore`: durable job records with skip-locked claiming (Postgres) or
//!   an in-memory map for tests
//! - `RateLimiter`: per-tenant enqueue and concurrency ceilings
//! - `WorkerPool`: polling loops that run registered handlers with retry and
//!   backoff
//! - `JobQueue`: enqueue and status surface for callers that poll
//! - `CleanupWorker`: retention sweep for terminal jobs

pub mod config;
pub mod error;
pub mod jobs;
pub mod rate_limit;
pub mod status;
pub mod store;
pub mod workers;

pub use config::{ConfigError, QueueConfig};
pub use error::{QueueError, QueueResult};
pub use jobs::{
    BackoffPolicy, BackoffStrategy, Job, JobContext, JobError, JobOutput, JobStats, JobStatus,
    JobStatusView, NewJob,
};
pub use rate_limit::{RateLimitConfig, RateLimitWindow, RateLimiter};
pub use status::{CANCELLED_BY_USER, EnqueueRequest, JobQueue};
pub use store::{InMemoryJobStore, JobStore, PostgresJobStore};
pub use workers::{
    CleanupConfig, CleanupHandle, CleanupWorker, PoolStats, ShutdownReport, WorkerConfig, WorkerPool,
    WorkerPoolHandle,
};

pub use sitesafe_core::{JobId, OrganizationId};
