//! Job records, retry policy, and handler plumbing.
//!
//! - `Job` / `NewJob`: the persisted record and the enqueue request for it
//! - `BackoffPolicy`: delay before a failed job is eligible again
//! - `HandlerRegistry`: closed map from `job_type` to handler function
//! - `JobContext`: deadline-bound context handed to each attempt

pub mod handler;
pub mod types;

pub use handler::{HandlerFuture, HandlerRegistry, JobContext, JobError, JobHandler, JobOutput};
pub use types::{
    BackoffPolicy, BackoffStrategy, DEFAULT_MAX_ATTEMPTS, Job, JobStats, JobStatus, JobStatusView,
    NewJob, add_duration, sub_duration,
};
