//! Per-tenant admission control.
//!
//! Two ceilings apply per `(organization_id, queue_name)`:
//! - enqueue: jobs created within a trailing window (an exact sliding count
//!   over `created_at`, so there is no reset boundary to game);
//! - dispatch: jobs currently `processing`.
//!
//! The limiter only decides the numbers. The store applies them atomically
//! with the insert or claim, so concurrent callers cannot jointly overshoot.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use sitesafe_core::OrganizationId;

use crate::error::QueueResult;
use crate::jobs::{Job, sub_duration};
use crate::store::{DispatchLimit, EnqueueLimit, JobStore};

/// Rate limiting settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// When false every check passes and no limits reach the store
    pub enabled: bool,
    /// Enqueue ceiling per tenant/queue within `window`
    pub max_jobs_per_hour: u32,
    /// Concurrency ceiling per tenant/queue
    pub max_concurrent_jobs: u32,
    /// Length of the sliding enqueue window
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_jobs_per_hour: 100,
            max_concurrent_jobs: 5,
            window: Duration::from_secs(60 * 60),
        }
    }
}

impl RateLimitConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_max_jobs_per_hour(mut self, max: u32) -> Self {
        self.max_jobs_per_hour = max;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: u32) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Snapshot of a tenant's usage on one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitWindow {
    pub organization_id: OrganizationId,
    pub queue_name: String,
    pub window_start: DateTime<Utc>,
    pub jobs_in_window: u64,
    pub concurrent_jobs: u64,
}

/// Admission checks backed by store counts.
pub struct RateLimiter<S: JobStore + ?Sized> {
    store: Arc<S>,
    config: RateLimitConfig,
}

impl<S: JobStore + ?Sized> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<S: JobStore + ?Sized> std::fmt::Debug for RateLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}

impl<S: JobStore + ?Sized> RateLimiter<S> {
    pub fn new(store: Arc<S>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// A limiter that admits everything.
    pub fn disabled(store: Arc<S>) -> Self {
        Self::new(store, RateLimitConfig::disabled())
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Enqueue ceiling for a window ending at `now`, if limiting is on.
    pub fn enqueue_limit(&self, now: DateTime<Utc>) -> Option<EnqueueLimit> {
        self.config.enabled.then(|| EnqueueLimit {
            max_jobs: self.config.max_jobs_per_hour,
            window_start: sub_duration(now, self.config.window),
        })
    }

    /// Concurrency ceiling for claims, if limiting is on.
    pub fn dispatch_limit(&self) -> Option<DispatchLimit> {
        self.config.enabled.then(|| DispatchLimit {
            max_concurrent: self.config.max_concurrent_jobs,
        })
    }

    /// Whether one more job may be created right now.
    pub async fn allow_enqueue(&self, organization_id: OrganizationId, queue_name: &str) -> QueueResult<bool> {
        let Some(limit) = self.enqueue_limit(Utc::now()) else {
            return Ok(true);
        };
        let created = self
            .store
            .count_created_since(organization_id, queue_name, limit.window_start)
            .await?;
        Ok(created < u64::from(limit.max_jobs))
    }

    /// Whether one more job may start right now.
    pub async fn allow_dispatch(&self, organization_id: OrganizationId, queue_name: &str) -> QueueResult<bool> {
        let Some(limit) = self.dispatch_limit() else {
            return Ok(true);
        };
        let running = self
            .store
            .count_processing(organization_id, queue_name, None)
            .await?;
        Ok(running < u64::from(limit.max_concurrent))
    }

    /// Whether an already-claimed job may run, ignoring the job itself.
    pub async fn admit_claimed(&self, job: &Job) -> QueueResult<bool> {
        let Some(limit) = self.dispatch_limit() else {
            return Ok(true);
        };
        let others = self
            .store
            .count_processing(job.organization_id, &job.queue_name, Some(job.id))
            .await?;
        Ok(others < u64::from(limit.max_concurrent))
    }

    /// Current usage for diagnostics. Counts are reported even when limiting
    /// is off.
    pub async fn window(&self, organization_id: OrganizationId, queue_name: &str) -> QueueResult<RateLimitWindow> {
        let window_start = sub_duration(Utc::now(), self.config.window);
        let jobs_in_window = self
            .store
            .count_created_since(organization_id, queue_name, window_start)
            .await?;
        let concurrent_jobs = self
            .store
            .count_processing(organization_id, queue_name, None)
            .await?;

        Ok(RateLimitWindow {
            organization_id,
            queue_name: queue_name.to_string(),
            window_start,
            jobs_in_window,
            concurrent_jobs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NewJob;
    use crate::store::InMemoryJobStore;

    const QUEUE: &str = "photo_analysis";

    fn new_job(org: OrganizationId) -> NewJob {
        NewJob::new(QUEUE, "photo_analysis", org, vec![])
    }

    fn limiter(config: RateLimitConfig) -> (Arc<InMemoryJobStore>, RateLimiter<InMemoryJobStore>) {
        let store = InMemoryJobStore::arc();
        (store.clone(), RateLimiter::new(store, config))
    }

    #[tokio::test]
    async fn enqueue_allowance_follows_window_count() {
        let (store, limiter) = limiter(RateLimitConfig::default().with_max_jobs_per_hour(2));
        let org = OrganizationId::new();

        for _ in 0..2 {
            assert!(limiter.allow_enqueue(org, QUEUE).await.unwrap());
            store.enqueue(new_job(org), None).await.unwrap();
        }
        assert!(!limiter.allow_enqueue(org, QUEUE).await.unwrap());
        assert!(limiter.allow_enqueue(OrganizationId::new(), QUEUE).await.unwrap());
        assert!(limiter.allow_enqueue(org, "report_export").await.unwrap());
    }

    #[tokio::test]
    async fn dispatch_allowance_and_admission() {
        let (store, limiter) = limiter(RateLimitConfig::default().with_max_concurrent_jobs(1));
        let org = OrganizationId::new();

        store.enqueue(new_job(org), None).await.unwrap();
        store.enqueue(new_job(org), None).await.unwrap();
        assert!(limiter.allow_dispatch(org, QUEUE).await.unwrap());

        // Claim both without a ceiling, as a misconfigured peer would.
        let claimed = store.dequeue(&[QUEUE.to_string()], 2, None).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(!limiter.allow_dispatch(org, QUEUE).await.unwrap());
        assert!(!limiter.admit_claimed(&claimed[0]).await.unwrap());

        store.release(claimed[1].id, Utc::now()).await.unwrap();
        assert!(limiter.admit_claimed(&claimed[0]).await.unwrap());
    }

    #[tokio::test]
    async fn disabled_limiter_admits_everything() {
        let store = InMemoryJobStore::arc();
        let limiter = RateLimiter::disabled(store.clone());
        let org = OrganizationId::new();

        store.enqueue(new_job(org), None).await.unwrap();
        let job = store.dequeue(&[QUEUE.to_string()], 1, None).await.unwrap().remove(0);

        assert!(limiter.enqueue_limit(Utc::now()).is_none());
        assert!(limiter.dispatch_limit().is_none());
        assert!(limiter.allow_enqueue(org, QUEUE).await.unwrap());
        assert!(limiter.admit_claimed(&job).await.unwrap());
    }

    #[tokio::test]
    async fn window_reports_usage() {
        let (store, limiter) = limiter(RateLimitConfig::default().with_window(Duration::from_secs(60)));
        let org = OrganizationId::new();

        store.enqueue(new_job(org), None).await.unwrap();
        store.enqueue(new_job(org), None).await.unwrap();
        store.dequeue(&[QUEUE.to_string()], 1, None).await.unwrap();

        let window = limiter.window(org, QUEUE).await.unwrap();
        assert_eq!(window.jobs_in_window, 2);
        assert_eq!(window.concurrent_jobs, 1);
        assert!(window.window_start < Utc::now());
    }

    #[test]
    fn limits_mirror_config() {
        let store = InMemoryJobStore::arc();
        let config = RateLimitConfig::default()
            .with_max_jobs_per_hour(7)
            .with_max_concurrent_jobs(2)
            .with_window(Duration::from_secs(10));
        let limiter = RateLimiter::new(store, config);

        let now = Utc::now();
        let enqueue = limiter.enqueue_limit(now).unwrap();
        assert_eq!(enqueue.max_jobs, 7);
        assert_eq!(enqueue.window_start, now - chrono::Duration::seconds(10));
        assert_eq!(limiter.dispatch_limit(), Some(DispatchLimit { max_concurrent: 2 }));
    }
}
