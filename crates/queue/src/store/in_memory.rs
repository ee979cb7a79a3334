//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sitesafe_core::{JobId, OrganizationId};

use crate::error::{QueueError, QueueResult};
use crate::jobs::{Job, JobStats, JobStatus, NewJob};

use super::r#trait::{DispatchLimit, EnqueueLimit, JobStore};

/// Job store backed by a single `RwLock`ed map.
///
/// Every claim and transition happens under the write lock, which gives the
/// same exclusivity the Postgres store gets from row locks.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> QueueResult<RwLockReadGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .read()
            .map_err(|_| QueueError::storage("in-memory job store lock poisoned"))
    }

    fn write(&self) -> QueueResult<RwLockWriteGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .write()
            .map_err(|_| QueueError::storage("in-memory job store lock poisoned"))
    }
}

fn expect_status<'a>(
    jobs: &'a mut HashMap<JobId, Job>,
    id: JobId,
    allowed: &[JobStatus],
    reason: &str,
) -> QueueResult<&'a mut Job> {
    let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
    if !allowed.contains(&job.status) {
        return Err(QueueError::conflict(id, job.status, reason));
    }
    Ok(job)
}

fn fail(job: &mut Job, error_message: &str, now: DateTime<Utc>) {
    job.status = JobStatus::Failed;
    job.attempt_count = job.max_attempts;
    job.error_message = Some(error_message.to_string());
    job.completed_at = Some(now);
    job.updated_at = now;
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob, limit: Option<EnqueueLimit>) -> QueueResult<JobId> {
        job.validate()?;
        let mut jobs = self.write()?;

        if let Some(limit) = limit {
            let created = jobs
                .values()
                .filter(|j| {
                    j.organization_id == job.organization_id
                        && j.queue_name == job.queue_name
                        && j.created_at >= limit.window_start
                })
                .count();
            if created >= limit.max_jobs as usize {
                return Err(QueueError::RateLimited {
                    organization_id: job.organization_id,
                    queue_name: job.queue_name,
                    limit: limit.max_jobs,
                });
            }
        }

        let record = job.into_job(Utc::now());
        let id = record.id;
        jobs.insert(id, record);
        Ok(id)
    }

    async fn dequeue(
        &self,
        queue_names: &[String],
        batch_size: usize,
        limit: Option<DispatchLimit>,
    ) -> QueueResult<Vec<Job>> {
        if batch_size == 0 || queue_names.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut jobs = self.write()?;

        let mut candidates: Vec<(i32, DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.is_ready(now) && queue_names.iter().any(|q| *q == j.queue_name))
            .map(|j| (j.priority, j.created_at, j.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut in_flight: HashMap<(OrganizationId, String), u64> = HashMap::new();
        if limit.is_some() {
            for j in jobs.values().filter(|j| j.status == JobStatus::Processing) {
                *in_flight
                    .entry((j.organization_id, j.queue_name.clone()))
                    .or_default() += 1;
            }
        }

        let mut claimed = Vec::with_capacity(batch_size.min(candidates.len()));
        for (_, _, id) in candidates {
            if claimed.len() >= batch_size {
                break;
            }
            let Some(job) = jobs.get_mut(&id) else {
                continue;
            };

            if let Some(limit) = limit {
                let running = in_flight
                    .entry((job.organization_id, job.queue_name.clone()))
                    .or_default();
                if *running >= u64::from(limit.max_concurrent) {
                    continue;
                }
                *running += 1;
            }

            job.status = JobStatus::Processing;
            job.started_at = Some(now);
            job.updated_at = now;
            claimed.push(job.clone());
        }

        Ok(claimed)
    }

    async fn mark_completed(&self, id: JobId, result: Option<Vec<u8>>) -> QueueResult<()> {
        let now = Utc::now();
        let mut jobs = self.write()?;
        let job = expect_status(&mut jobs, id, &[JobStatus::Processing], "only processing jobs can complete")?;

        job.status = JobStatus::Completed;
        job.result = result;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: JobId,
        error_message: &str,
        next_run_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let mut jobs = self.write()?;
        let job = expect_status(&mut jobs, id, &[JobStatus::Processing], "only processing jobs can be retried")?;
        if job.attempt_count >= job.max_attempts {
            return Err(QueueError::conflict(id, job.status, "attempt budget exhausted"));
        }

        job.status = JobStatus::Pending;
        job.attempt_count += 1;
        job.error_message = Some(error_message.to_string());
        job.next_run_at = next_run_at;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, id: JobId, error_message: &str) -> QueueResult<()> {
        let mut jobs = self.write()?;
        let job = expect_status(&mut jobs, id, &[JobStatus::Processing], "only processing jobs can fail")?;
        fail(job, error_message, Utc::now());
        Ok(())
    }

    async fn release(&self, id: JobId, next_run_at: DateTime<Utc>) -> QueueResult<()> {
        let mut jobs = self.write()?;
        let job = expect_status(&mut jobs, id, &[JobStatus::Processing], "only processing jobs can be released")?;

        job.status = JobStatus::Pending;
        job.next_run_at = next_run_at;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel(&self, id: JobId, error_message: &str) -> QueueResult<Job> {
        let mut jobs = self.write()?;
        let job = expect_status(
            &mut jobs,
            id,
            &[JobStatus::Pending, JobStatus::Processing],
            "only pending or processing jobs can be cancelled",
        )?;
        fail(job, error_message, Utc::now());
        Ok(job.clone())
    }

    async fn get_job(&self, id: JobId) -> QueueResult<Job> {
        self.read()?.get(&id).cloned().ok_or(QueueError::NotFound(id))
    }

    async fn list_active(&self, organization_id: OrganizationId) -> QueueResult<Vec<Job>> {
        let jobs = self.read()?;
        let mut active: Vec<Job> = jobs
            .values()
            .filter(|j| j.organization_id == organization_id && j.status.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|j| (j.created_at, j.id));
        Ok(active)
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.is_terminal() && j.completed_at.is_some_and(|at| at < older_than)));
        Ok((before - jobs.len()) as u64)
    }

    async fn count_created_since(
        &self,
        organization_id: OrganizationId,
        queue_name: &str,
        since: DateTime<Utc>,
    ) -> QueueResult<u64> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|j| {
                j.organization_id == organization_id
                    && j.queue_name == queue_name
                    && j.created_at >= since
            })
            .count() as u64)
    }

    async fn count_processing(
        &self,
        organization_id: OrganizationId,
        queue_name: &str,
        exclude: Option<JobId>,
    ) -> QueueResult<u64> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|j| {
                j.organization_id == organization_id
                    && j.queue_name == queue_name
                    && j.status == JobStatus::Processing
                    && Some(j.id) != exclude
            })
            .count() as u64)
    }

    async fn stats(&self, organization_id: OrganizationId) -> QueueResult<JobStats> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| j.organization_id == organization_id) {
            stats.record(job.status);
        }
        Ok(stats)
    }

    async fn list_stalled(&self, started_before: DateTime<Utc>) -> QueueResult<Vec<Job>> {
        let jobs = self.read()?;
        let mut stalled: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.started_at.is_some_and(|at| at < started_before)
            })
            .cloned()
            .collect();
        stalled.sort_by_key(|j| j.started_at);
        Ok(stalled)
    }
}
