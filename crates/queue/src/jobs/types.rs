//! Core job types and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use sitesafe_core::{JobId, OrganizationId};

use crate::error::{QueueError, QueueResult};

/// Attempt budget used when the caller does not pick one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `next_run_at`, then eligible for a claim
    Pending,
    /// Claimed by a worker
    Processing,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted, fatal error, or cancelled
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Pending or processing.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(QueueError::Storage(format!("unknown job status '{other}'"))),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Delay applied before a failed job becomes eligible again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl BackoffPolicy {
    /// Exponential backoff doubling from `base_delay`, capped at `max_delay`.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    /// Retry immediately. Useful for tests and for queues polled by humans.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Calculate delay for a given failed attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => Some(self.base_delay),
            BackoffStrategy::Exponential => 2u32
                .checked_pow(attempt - 1)
                .and_then(|factor| self.base_delay.checked_mul(factor)),
            BackoffStrategy::Linear => self.base_delay.checked_mul(attempt),
        };

        delay.map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Earliest time the job may run again after `attempt` failed.
    pub fn next_run_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        add_duration(now, self.delay_for_attempt(attempt))
    }
}

/// `at + delay`, saturating at the largest representable timestamp.
pub fn add_duration(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - delay`, saturating at the smallest representable timestamp.
pub fn sub_duration(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A job as submitted to the store, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub queue_name: String,
    pub job_type: String,
    pub organization_id: OrganizationId,
    /// Handler-specific encoded data; never interpreted by the queue
    pub payload: Vec<u8>,
    /// Higher dequeues first
    pub priority: i32,
    pub max_attempts: u32,
    /// Delay the first run until this time
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        organization_id: OrganizationId,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            organization_id,
            payload: payload.into(),
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_at: None,
        }
    }

    /// Build a job whose payload is the JSON encoding of `payload`.
    pub fn json<T: Serialize>(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        organization_id: OrganizationId,
        payload: &T,
    ) -> QueueResult<Self> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| QueueError::invalid(format!("payload is not serializable: {e}")))?;
        Ok(Self::new(queue_name, job_type, organization_id, bytes))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Schedule the first run for later.
    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    /// Schedule the first run with a delay from now.
    pub fn delayed(self, delay: Duration) -> Self {
        self.run_at(add_duration(Utc::now(), delay))
    }

    /// Reject jobs that could never be routed or attempted.
    pub fn validate(&self) -> QueueResult<()> {
        if self.queue_name.trim().is_empty() {
            return Err(QueueError::invalid("queue_name must not be empty"));
        }
        if self.job_type.trim().is_empty() {
            return Err(QueueError::invalid("job_type must not be empty"));
        }
        if self.organization_id.is_nil() {
            return Err(QueueError::invalid("organization_id must not be empty"));
        }
        if self.max_attempts < 1 {
            return Err(QueueError::invalid("max_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Materialize the stored record, in `pending` state.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            queue_name: self.queue_name,
            job_type: self.job_type,
            organization_id: self.organization_id,
            payload: self.payload,
            status: JobStatus::Pending,
            priority: self.priority,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            next_run_at: self.run_at.unwrap_or(now),
            error_message: None,
            result: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Logical partition workers subscribe to
    pub queue_name: String,
    /// Selects the registered handler
    pub job_type: String,
    /// Tenant scope
    pub organization_id: OrganizationId,
    pub payload: Vec<u8>,
    pub status: JobStatus,
    pub priority: i32,
    /// Failed attempts so far (a successful run does not count)
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Earliest time the job is eligible for a claim
    pub next_run_at: DateTime<Utc>,
    /// Last failure detail
    pub error_message: Option<String>,
    /// Handler output, only when completed
    pub result: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    /// Most recent claim
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Eligible for a claim at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_run_at <= now
    }

    /// Decode the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Decode the result as JSON, if there is one.
    pub fn result_json<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.result.as_deref().map(serde_json::from_slice)
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView::from(self)
    }
}

/// What a polling client sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub queue_name: String,
    pub job_type: String,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub result: Option<Vec<u8>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobStatusView {
    /// Polling can stop once this is true.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            queue_name: job.queue_name.clone(),
            job_type: job.job_type.clone(),
            status: job.status,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            result: job.result.clone(),
            error_message: job.error_message.clone(),
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

/// Per-tenant job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    pub fn active(&self) -> u64 {
        self.pending + self.processing
    }
}
