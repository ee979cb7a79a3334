//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `dequeue` selects candidates with `FOR UPDATE SKIP LOCKED`, so concurrent
//! workers never block on (or receive) the same row. When a concurrency
//! ceiling is in force the claim runs in a transaction that also takes a
//! transaction-scoped advisory lock per tenant/queue (in sorted key order)
//! before counting `processing` jobs, which serializes admission decisions
//! for that tenant across processes.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueError |
//! |------------|----------------------|------------|
//! | Database (check constraint violation) | `23514` | `Invalid` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! Transitions that match no row are classified afterwards: a missing row is
//! `NotFound`, a row in another state is `Conflict`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use sitesafe_core::{JobId, OrganizationId};

use crate::error::{QueueError, QueueResult};
use crate::jobs::{Job, JobStats, JobStatus, NewJob};

use super::r#trait::{DispatchLimit, EnqueueLimit, JobStore};

const MIGRATION: &str = include_str!("../../migrations/0001_create_jobs.sql");

const JOB_COLUMNS: &str = "id, queue_name, job_type, organization_id, payload, status, priority, \
     attempt_count, max_attempts, next_run_at, error_message, result, created_at, started_at, \
     completed_at, updated_at";

/// Candidates fetched per claim; rows locked by a concurrent claimant are
/// skipped, so fetch more than the batch.
const CANDIDATE_FACTOR: usize = 4;

/// Postgres job store.
///
/// Every statement carries explicit timestamps from the process clock so
/// both backends agree on `created_at` and `next_run_at` semantics.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `jobs` table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> QueueResult<()> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Explain why a guarded UPDATE matched nothing.
    async fn classify_miss(&self, id: JobId, reason: &str) -> QueueError {
        let status: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await;

        match status {
            Ok(None) => QueueError::NotFound(id),
            Ok(Some(status)) => match status.parse::<JobStatus>() {
                Ok(status) => QueueError::conflict(id, status, reason),
                Err(err) => err,
            },
            Err(e) => map_sqlx_error("classify_miss", e),
        }
    }

    async fn claim_unlimited(
        &self,
        queue_names: &[String],
        batch_size: i64,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = $3, updated_at = $3
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'pending'
                  AND queue_name = ANY($1)
                  AND next_run_at <= $3
                ORDER BY priority DESC, created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(queue_names)
            .bind(batch_size)
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dequeue", e))?;

        rows_to_jobs(&rows)
    }

    async fn claim_limited(
        &self,
        queue_names: &[String],
        batch_size: usize,
        limit: DispatchLimit,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<Job>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let candidate_limit = i64::try_from(batch_size.saturating_mul(CANDIDATE_FACTOR)).unwrap_or(i64::MAX);
        // Rank each tenant's ready jobs and keep only those that fit under its
        // remaining slots, so a saturated tenant cannot fill the candidate page.
        let candidates = sqlx::query(
            r#"
            SELECT j.id, j.organization_id, j.queue_name FROM jobs j
            WHERE j.status = 'pending'
              AND j.id IN (
                SELECT ranked.id FROM (
                    SELECT c.id,
                           ROW_NUMBER() OVER (
                               PARTITION BY c.organization_id, c.queue_name
                               ORDER BY c.priority DESC, c.created_at ASC, c.id ASC
                           ) AS slot,
                           (SELECT COUNT(*) FROM jobs p
                            WHERE p.organization_id = c.organization_id
                              AND p.queue_name = c.queue_name
                              AND p.status = 'processing') AS running
                    FROM jobs c
                    WHERE c.status = 'pending'
                      AND c.queue_name = ANY($1)
                      AND c.next_run_at <= $3
                ) ranked
                WHERE ranked.running + ranked.slot <= $4
              )
            ORDER BY j.priority DESC, j.created_at ASC, j.id ASC
            FOR UPDATE OF j SKIP LOCKED
            LIMIT $2
            "#,
        )
        .bind(queue_names)
        .bind(candidate_limit)
        .bind(now)
        .bind(i64::from(limit.max_concurrent))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("dequeue_candidates", e))?;

        let mut ordered = Vec::with_capacity(candidates.len());
        for row in &candidates {
            let id: uuid::Uuid = row.try_get("id").map_err(|e| map_sqlx_error("dequeue_candidates", e))?;
            let org: uuid::Uuid = row
                .try_get("organization_id")
                .map_err(|e| map_sqlx_error("dequeue_candidates", e))?;
            let queue: String = row
                .try_get("queue_name")
                .map_err(|e| map_sqlx_error("dequeue_candidates", e))?;
            ordered.push((id, (org, queue)));
        }

        if ordered.is_empty() {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(Vec::new());
        }

        // Lock tenants in a stable order so concurrent claims cannot deadlock.
        let keys: BTreeSet<(uuid::Uuid, String)> = ordered.iter().map(|(_, key)| key.clone()).collect();
        let mut running: HashMap<(uuid::Uuid, String), u64> = HashMap::with_capacity(keys.len());
        for (org, queue) in keys {
            advisory_lock(&mut tx, "dispatch", org, &queue).await?;

            let count: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM jobs
                WHERE organization_id = $1 AND queue_name = $2 AND status = 'processing'
                "#,
            )
            .bind(org)
            .bind(&queue)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("count_processing", e))?;

            running.insert((org, queue), count.max(0) as u64);
        }

        let mut chosen = Vec::with_capacity(batch_size);
        for (id, key) in ordered {
            if chosen.len() >= batch_size {
                break;
            }
            let count = running.entry(key).or_default();
            if *count >= u64::from(limit.max_concurrent) {
                continue;
            }
            *count += 1;
            chosen.push(id);
        }

        if chosen.is_empty() {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = $2, updated_at = $2
            WHERE id = ANY($1) AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(&chosen)
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("dequeue", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        rows_to_jobs(&rows)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, job),
        fields(
            organization_id = %job.organization_id,
            queue_name = %job.queue_name,
            job_type = %job.job_type
        ),
        err
    )]
    async fn enqueue(&self, job: NewJob, limit: Option<EnqueueLimit>) -> QueueResult<JobId> {
        job.validate()?;
        let priority = job.priority;
        let max_attempts = i32::try_from(job.max_attempts)
            .map_err(|_| QueueError::invalid("max_attempts is out of range"))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if let Some(limit) = limit {
            advisory_lock(&mut tx, "enqueue", *job.organization_id.as_uuid(), &job.queue_name).await?;

            let created: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM jobs
                WHERE organization_id = $1 AND queue_name = $2 AND created_at >= $3
                "#,
            )
            .bind(job.organization_id.as_uuid())
            .bind(&job.queue_name)
            .bind(limit.window_start)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("count_created_since", e))?;

            if created >= i64::from(limit.max_jobs) {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(QueueError::RateLimited {
                    organization_id: job.organization_id,
                    queue_name: job.queue_name,
                    limit: limit.max_jobs,
                });
            }
        }

        let record = job.into_job(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue_name, job_type, organization_id, payload, status, priority,
                attempt_count, max_attempts, next_run_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, 0, $7, $8, $9, $9)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.queue_name)
        .bind(&record.job_type)
        .bind(record.organization_id.as_uuid())
        .bind(&record.payload)
        .bind(priority)
        .bind(max_attempts)
        .bind(record.next_run_at)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(record.id)
    }

    #[instrument(skip(self, queue_names), fields(queues = ?queue_names), err)]
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
        let mut jobs = match limit {
            Some(limit) => self.claim_limited(queue_names, batch_size, limit, now).await?,
            None => {
                let batch = i64::try_from(batch_size).unwrap_or(i64::MAX);
                self.claim_unlimited(queue_names, batch, now).await?
            }
        };

        // RETURNING does not preserve the subquery order.
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(jobs)
    }

    #[instrument(skip(self, result), fields(job_id = %id), err)]
    async fn mark_completed(&self, id: JobId, result: Option<Vec<u8>>) -> QueueResult<()> {
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', result = $2, completed_at = $3, updated_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(result)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_completed", e))?;

        if updated.rows_affected() == 0 {
            return Err(self.classify_miss(id, "only processing jobs can complete").await);
        }
        Ok(())
    }

    #[instrument(skip(self, error_message), fields(job_id = %id), err)]
    async fn mark_retry(
        &self,
        id: JobId,
        error_message: &str,
        next_run_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempt_count = attempt_count + 1,
                error_message = $2,
                next_run_at = $3,
                updated_at = $4
            WHERE id = $1 AND status = 'processing' AND attempt_count < max_attempts
            "#,
        )
        .bind(id.as_uuid())
        .bind(error_message)
        .bind(next_run_at)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_retry", e))?;

        if updated.rows_affected() == 0 {
            return Err(self
                .classify_miss(id, "only processing jobs with attempts left can be retried")
                .await);
        }
        Ok(())
    }

    #[instrument(skip(self, error_message), fields(job_id = %id), err)]
    async fn mark_failed(&self, id: JobId, error_message: &str) -> QueueResult<()> {
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                attempt_count = max_attempts,
                error_message = $2,
                completed_at = $3,
                updated_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(error_message)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        if updated.rows_affected() == 0 {
            return Err(self.classify_miss(id, "only processing jobs can fail").await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn release(&self, id: JobId, next_run_at: DateTime<Utc>) -> QueueResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', next_run_at = $2, updated_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(next_run_at)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        if updated.rows_affected() == 0 {
            return Err(self.classify_miss(id, "only processing jobs can be released").await);
        }
        Ok(())
    }

    #[instrument(skip(self, error_message), fields(job_id = %id), err)]
    async fn cancel(&self, id: JobId, error_message: &str) -> QueueResult<Job> {
        let now = Utc::now();
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'failed',
                attempt_count = max_attempts,
                error_message = $2,
                completed_at = $3,
                updated_at = $3
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(error_message)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("cancel", e))?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(self
                .classify_miss(id, "only pending or processing jobs can be cancelled")
                .await),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_job(&self, id: JobId) -> QueueResult<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(QueueError::NotFound(id)),
        }
    }

    #[instrument(skip(self), fields(organization_id = %organization_id), err)]
    async fn list_active(&self, organization_id: OrganizationId) -> QueueResult<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE organization_id = $1 AND status IN ('pending', 'processing')
            ORDER BY created_at ASC, id ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(organization_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_active", e))?;

        rows_to_jobs(&rows)
    }

    #[instrument(skip(self), err)]
    async fn cleanup(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed') AND completed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cleanup", e))?;

        Ok(deleted.rows_affected())
    }

    #[instrument(skip(self), fields(organization_id = %organization_id), err)]
    async fn count_created_since(
        &self,
        organization_id: OrganizationId,
        queue_name: &str,
        since: DateTime<Utc>,
    ) -> QueueResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE organization_id = $1 AND queue_name = $2 AND created_at >= $3
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(queue_name)
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_created_since", e))?;

        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self), fields(organization_id = %organization_id), err)]
    async fn count_processing(
        &self,
        organization_id: OrganizationId,
        queue_name: &str,
        exclude: Option<JobId>,
    ) -> QueueResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE organization_id = $1
              AND queue_name = $2
              AND status = 'processing'
              AND ($3::uuid IS NULL OR id <> $3)
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(queue_name)
        .bind(exclude.map(|id| *id.as_uuid()))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_processing", e))?;

        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self), fields(organization_id = %organization_id), err)]
    async fn stats(&self, organization_id: OrganizationId) -> QueueResult<JobStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total FROM jobs
            WHERE organization_id = $1
            GROUP BY status
            "#,
        )
        .bind(organization_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("stats", e))?;
            let total = total.max(0) as u64;
            match status.parse::<JobStatus>()? {
                JobStatus::Pending => stats.pending = total,
                JobStatus::Processing => stats.processing = total,
                JobStatus::Completed => stats.completed = total,
                JobStatus::Failed => stats.failed = total,
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn list_stalled(&self, started_before: DateTime<Utc>) -> QueueResult<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'processing' AND started_at < $1
            ORDER BY started_at ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(started_before)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_stalled", e))?;

        rows_to_jobs(&rows)
    }
}

/// Take a transaction-scoped advisory lock for one tenant/queue.
async fn advisory_lock(
    tx: &mut Transaction<'_, Postgres>,
    scope: &str,
    organization_id: uuid::Uuid,
    queue_name: &str,
) -> QueueResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(format!("{scope}:{organization_id}:{queue_name}"))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("advisory_lock", e))?;
    Ok(())
}

/// Map SQLx errors to queue errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation
                Some("23514") => QueueError::Invalid(msg),
                _ => QueueError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => QueueError::Storage(format!("connection pool closed in {operation}")),
        sqlx::Error::PoolTimedOut => {
            QueueError::Storage(format!("timed out acquiring a connection in {operation}"))
        }
        _ => QueueError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn row_to_job(row: &PgRow) -> QueueResult<Job> {
    let row = JobRow::from_row(row)
        .map_err(|e| QueueError::storage(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(row)
}

fn rows_to_jobs(rows: &[PgRow]) -> QueueResult<Vec<Job>> {
    rows.iter().map(row_to_job).collect()
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    queue_name: String,
    job_type: String,
    organization_id: uuid::Uuid,
    payload: Vec<u8>,
    status: String,
    priority: i32,
    attempt_count: i32,
    max_attempts: i32,
    next_run_at: DateTime<Utc>,
    error_message: Option<String>,
    result: Option<Vec<u8>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            job_type: row.try_get("job_type")?,
            organization_id: row.try_get("organization_id")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            next_run_at: row.try_get("next_run_at")?,
            error_message: row.try_get("error_message")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let counter = |name: &str, value: i32| {
            u32::try_from(value)
                .map_err(|_| QueueError::storage(format!("negative {name} {value} for job {}", row.id)))
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            attempt_count: counter("attempt_count", row.attempt_count)?,
            max_attempts: counter("max_attempts", row.max_attempts)?,
            status: row.status.parse()?,
            queue_name: row.queue_name,
            job_type: row.job_type,
            organization_id: OrganizationId::from_uuid(row.organization_id),
            payload: row.payload,
            priority: row.priority,
            next_run_at: row.next_run_at,
            error_message: row.error_message,
            result: row.result,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}
