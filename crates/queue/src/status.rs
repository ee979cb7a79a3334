//! Enqueue and status surface consumed by the HTTP layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use sitesafe_core::{JobId, OrganizationId};

use crate::error::{QueueError, QueueResult};
use crate::jobs::{DEFAULT_MAX_ATTEMPTS, JobStats, JobStatusView, NewJob};
use crate::rate_limit::{RateLimitConfig, RateLimitWindow, RateLimiter};
use crate::store::JobStore;

/// Error message stored on jobs cancelled through [`JobQueue::cancel`].
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// A job submission. `queue_name` defaults to `job_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub job_type: String,
    pub organization_id: OrganizationId,
    pub payload: Vec<u8>,
    pub priority: i32,
    pub max_attempts: u32,
    pub queue_name: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(job_type: impl Into<String>, organization_id: OrganizationId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            job_type: job_type.into(),
            organization_id,
            payload: payload.into(),
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            queue_name: None,
            run_at: None,
        }
    }

    pub fn json<T: Serialize>(
        job_type: impl Into<String>,
        organization_id: OrganizationId,
        payload: &T,
    ) -> QueueResult<Self> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| QueueError::invalid(format!("payload is not serializable: {e}")))?;
        Ok(Self::new(job_type, organization_id, bytes))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn on_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }
}

impl From<EnqueueRequest> for NewJob {
    fn from(req: EnqueueRequest) -> Self {
        let queue_name = req.queue_name.unwrap_or_else(|| req.job_type.clone());
        NewJob {
            queue_name,
            job_type: req.job_type,
            organization_id: req.organization_id,
            payload: req.payload,
            priority: req.priority,
            max_attempts: req.max_attempts,
            run_at: req.run_at,
        }
    }
}

/// Queue facade: admission-checked enqueue plus status and admin reads.
///
/// Every read goes to the store, so callers always observe the latest
/// committed transition.
pub struct JobQueue<S: JobStore + ?Sized> {
    store: Arc<S>,
    limiter: RateLimiter<S>,
}

impl<S: JobStore + ?Sized> Clone for JobQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            limiter: self.limiter.clone(),
        }
    }
}

impl<S: JobStore + ?Sized> std::fmt::Debug for JobQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").field("limiter", &self.limiter).finish()
    }
}

impl<S: JobStore + ?Sized> JobQueue<S> {
    pub fn new(store: Arc<S>, rate_limit: RateLimitConfig) -> Self {
        let limiter = RateLimiter::new(Arc::clone(&store), rate_limit);
        Self { store, limiter }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn limiter(&self) -> &RateLimiter<S> {
        &self.limiter
    }

    /// Validate, apply the tenant's enqueue ceiling, and insert.
    ///
    /// `Invalid` and `RateLimited` never leave a record behind.
    pub async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<JobId> {
        let job = NewJob::from(request);
        job.validate()?;

        let organization_id = job.organization_id;
        let job_type = job.job_type.clone();
        let limit = self.limiter.enqueue_limit(Utc::now());

        match self.store.enqueue(job, limit).await {
            Ok(id) => {
                debug!(job_id = %id, %organization_id, job_type = %job_type, "job enqueued");
                Ok(id)
            }
            Err(err @ QueueError::RateLimited { .. }) => {
                warn!(%organization_id, job_type = %job_type, "enqueue rejected by rate limit");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get_status(&self, id: JobId) -> QueueResult<JobStatusView> {
        Ok(self.store.get_job(id).await?.status_view())
    }

    /// Like [`get_status`](Self::get_status), but jobs of other tenants are
    /// reported as not found.
    pub async fn get_status_for_organization(
        &self,
        organization_id: OrganizationId,
        id: JobId,
    ) -> QueueResult<JobStatusView> {
        let job = self.store.get_job(id).await?;
        if job.organization_id != organization_id {
            return Err(QueueError::NotFound(id));
        }
        Ok(job.status_view())
    }

    /// Cancel a pending or processing job.
    ///
    /// Racing a worker that completes the same job is safe: whichever
    /// transition commits first wins and the other side gets
    /// `NotFound`/`Conflict`.
    pub async fn cancel(&self, id: JobId) -> QueueResult<JobStatusView> {
        let job = self.store.cancel(id, CANCELLED_BY_USER).await?;
        info!(job_id = %id, organization_id = %job.organization_id, "job cancelled");
        Ok(job.status_view())
    }

    pub async fn cancel_for_organization(
        &self,
        organization_id: OrganizationId,
        id: JobId,
    ) -> QueueResult<JobStatusView> {
        self.get_status_for_organization(organization_id, id).await?;
        self.cancel(id).await
    }

    /// Pending and processing jobs of a tenant, oldest first.
    pub async fn list_active(&self, organization_id: OrganizationId) -> QueueResult<Vec<JobStatusView>> {
        let jobs = self.store.list_active(organization_id).await?;
        Ok(jobs.iter().map(JobStatusView::from).collect())
    }

    pub async fn stats(&self, organization_id: OrganizationId) -> QueueResult<JobStats> {
        self.store.stats(organization_id).await
    }

    /// Jobs stuck in `processing` since before `started_before`. Nothing is
    /// changed; recovery is left to an operator.
    pub async fn list_stalled(&self, started_before: DateTime<Utc>) -> QueueResult<Vec<JobStatusView>> {
        let jobs = self.store.list_stalled(started_before).await?;
        Ok(jobs.iter().map(JobStatusView::from).collect())
    }

    pub async fn rate_limit_window(
        &self,
        organization_id: OrganizationId,
        queue_name: &str,
    ) -> QueueResult<RateLimitWindow> {
        self.limiter.window(organization_id, queue_name).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::jobs::JobStatus;
    use crate::store::InMemoryJobStore;

    fn queue(config: RateLimitConfig) -> JobQueue<InMemoryJobStore> {
        JobQueue::new(InMemoryJobStore::arc(), config)
    }

    fn request(org: OrganizationId) -> EnqueueRequest {
        EnqueueRequest::new("photo_analysis", org, b"{}".to_vec())
    }

    #[test]
    fn queue_name_defaults_to_job_type() {
        let org = OrganizationId::new();
        let job = NewJob::from(request(org));
        assert_eq!(job.queue_name, "photo_analysis");

        let job = NewJob::from(request(org).on_queue("vision").with_priority(4));
        assert_eq!(job.queue_name, "vision");
        assert_eq!(job.priority, 4);
    }

    #[tokio::test]
    async fn enqueue_then_poll_status() {
        let queue = queue(RateLimitConfig::default());
        let org = OrganizationId::new();

        let id = queue
            .enqueue(EnqueueRequest::json("photo_analysis", org, &serde_json::json!({"photo": 1})).unwrap())
            .await
            .unwrap();

        let view = queue.get_status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.attempt_count, 0);
        assert!(!view.is_finished());
        assert_eq!(queue.list_active(org).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_requests_leave_no_record() {
        let queue = queue(RateLimitConfig::default());
        let org = OrganizationId::new();

        let err = queue.enqueue(request(org).with_max_attempts(0)).await.unwrap_err();
        assert_eq!(err.code(), "EINVALID");
        let err = queue
            .enqueue(EnqueueRequest::new("", org, vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EINVALID");
        assert_eq!(queue.stats(org).await.unwrap(), JobStats::default());
    }

    #[tokio::test]
    async fn enqueue_ceiling_rolls_over_with_the_window() {
        let queue = queue(
            RateLimitConfig::default()
                .with_max_jobs_per_hour(2)
                .with_window(Duration::from_millis(200)),
        );
        let org = OrganizationId::new();

        queue.enqueue(request(org)).await.unwrap();
        queue.enqueue(request(org)).await.unwrap();
        let err = queue.enqueue(request(org)).await.unwrap_err();
        assert_eq!(err.code(), "ERATELIMIT");
        assert_eq!(queue.stats(org).await.unwrap().pending, 2);

        // Another tenant is unaffected.
        queue.enqueue(request(OrganizationId::new())).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        queue.enqueue(request(org)).await.unwrap();
    }

    #[tokio::test]
    async fn disabled_rate_limiting_admits_everything() {
        let queue = queue(RateLimitConfig::disabled().with_max_jobs_per_hour(1));
        let org = OrganizationId::new();
        for _ in 0..5 {
            queue.enqueue(request(org)).await.unwrap();
        }
        assert_eq!(queue.stats(org).await.unwrap().pending, 5);
    }

    #[tokio::test]
    async fn cancel_pending_and_completed() {
        let queue = queue(RateLimitConfig::default());
        let org = OrganizationId::new();

        let id = queue.enqueue(request(org)).await.unwrap();
        let view = queue.cancel(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error_message.as_deref(), Some(CANCELLED_BY_USER));

        let done = queue.enqueue(request(org)).await.unwrap();
        let store = queue.store();
        store.dequeue(&["photo_analysis".to_string()], 1, None).await.unwrap();
        store.mark_completed(done, Some(b"ok".to_vec())).await.unwrap();

        let err = queue.cancel(done).await.unwrap_err();
        assert!(err.is_lost_transition());
        let view = queue.get_status(done).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.result.as_deref(), Some(&b"ok"[..]));

        assert_eq!(queue.cancel(JobId::new()).await.unwrap_err().code(), "ENOTFOUND");
    }

    #[tokio::test]
    async fn tenant_scoped_reads_hide_other_tenants() {
        let queue = queue(RateLimitConfig::default());
        let owner = OrganizationId::new();
        let other = OrganizationId::new();

        let id = queue.enqueue(request(owner)).await.unwrap();
        assert!(queue.get_status_for_organization(owner, id).await.is_ok());

        let err = queue.get_status_for_organization(other, id).await.unwrap_err();
        assert_eq!(err, QueueError::NotFound(id));
        let err = queue.cancel_for_organization(other, id).await.unwrap_err();
        assert_eq!(err.code(), "ENOTFOUND");
        assert_eq!(queue.get_status(id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn admin_reads() {
        let queue = queue(RateLimitConfig::default());
        let org = OrganizationId::new();
        queue.enqueue(request(org)).await.unwrap();
        queue
            .store()
            .dequeue(&["photo_analysis".to_string()], 1, None)
            .await
            .unwrap();

        let stalled = queue
            .list_stalled(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stalled.len(), 1);

        let window = queue.rate_limit_window(org, "photo_analysis").await.unwrap();
        assert_eq!((window.jobs_in_window, window.concurrent_jobs), (1, 1));
    }
}
