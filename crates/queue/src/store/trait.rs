//! Job store boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sitesafe_core::{JobId, OrganizationId};

use crate::error::QueueResult;
use crate::jobs::{Job, JobStats, NewJob};

/// Enqueue ceiling applied atomically with the insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueLimit {
    /// Maximum jobs created per tenant/queue inside the window
    pub max_jobs: u32,
    /// Jobs created at or after this instant count against the ceiling
    pub window_start: DateTime<Utc>,
}

/// Per-tenant concurrency ceiling applied at claim time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimit {
    /// Maximum jobs in `processing` per tenant/queue
    pub max_concurrent: u32,
}

/// Durable job persistence.
///
/// Status transitions are compare-and-set: each names the state it expects
/// and fails with `NotFound` or `Conflict` when another transition committed
/// first. Implementations must be safe to share between worker tasks.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a `pending` job with zero attempts.
    ///
    /// With a limit, the window count and the insert happen under one
    /// per-tenant lock and an over-limit job fails with `RateLimited`.
    async fn enqueue(&self, job: NewJob, limit: Option<EnqueueLimit>) -> QueueResult<JobId>;

    /// Claim up to `batch_size` eligible jobs from `queue_names`, ordered by
    /// priority (desc) then age, moving them to `processing`.
    ///
    /// No job is ever returned to two callers. With a limit, jobs whose
    /// tenant is already at the ceiling are left `pending` and unclaimed.
    async fn dequeue(
        &self,
        queue_names: &[String],
        batch_size: usize,
        limit: Option<DispatchLimit>,
    ) -> QueueResult<Vec<Job>>;

    /// `processing → completed`.
    async fn mark_completed(&self, id: JobId, result: Option<Vec<u8>>) -> QueueResult<()>;

    /// `processing → pending`, counting one failed attempt.
    async fn mark_retry(
        &self,
        id: JobId,
        error_message: &str,
        next_run_at: DateTime<Utc>,
    ) -> QueueResult<()>;

    /// `processing → failed`; the attempt budget is marked exhausted.
    async fn mark_failed(&self, id: JobId, error_message: &str) -> QueueResult<()>;

    /// `processing → pending` without counting an attempt.
    async fn release(&self, id: JobId, next_run_at: DateTime<Utc>) -> QueueResult<()>;

    /// `pending | processing → failed`, returning the cancelled job.
    async fn cancel(&self, id: JobId, error_message: &str) -> QueueResult<Job>;

    async fn get_job(&self, id: JobId) -> QueueResult<Job>;

    /// Pending and processing jobs of a tenant, oldest first.
    async fn list_active(&self, organization_id: OrganizationId) -> QueueResult<Vec<Job>>;

    /// Delete terminal jobs completed before `older_than`.
    async fn cleanup(&self, older_than: DateTime<Utc>) -> QueueResult<u64>;

    async fn count_created_since(
        &self,
        organization_id: OrganizationId,
        queue_name: &str,
        since: DateTime<Utc>,
    ) -> QueueResult<u64>;

    /// Jobs in `processing` for the tenant/queue, optionally ignoring one job.
    async fn count_processing(
        &self,
        organization_id: OrganizationId,
        queue_name: &str,
        exclude: Option<JobId>,
    ) -> QueueResult<u64>;

    async fn stats(&self, organization_id: OrganizationId) -> QueueResult<JobStats>;

    /// Jobs left in `processing` since before `started_before`. Read-only.
    async fn list_stalled(&self, started_before: DateTime<Utc>) -> QueueResult<Vec<Job>>;
}
