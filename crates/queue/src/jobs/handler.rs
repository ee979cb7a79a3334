//! Handler registration and the execution context handed to handlers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use sitesafe_core::{JobId, OrganizationId};

use crate::error::{QueueError, QueueResult};

use super::types::Job;

/// Failure reported by a handler.
///
/// Errors are retryable unless the handler says otherwise; `?` on an
/// [`anyhow::Error`] yields a retryable error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Transient failure; the job is retried with backoff while attempts remain.
    #[error("{0}")]
    Retryable(String),
    /// Permanent failure; the job goes straight to `failed`.
    #[error("{0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, JobError::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Retryable(msg) | JobError::Fatal(msg) => msg,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(format!("{err:#}"))
    }
}

/// What a successful handler hands back to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    result: Option<Vec<u8>>,
}

impl JobOutput {
    /// Success with nothing to report.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn bytes(result: impl Into<Vec<u8>>) -> Self {
        Self {
            result: Some(result.into()),
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, JobError> {
        serde_json::to_vec(value)
            .map(Self::bytes)
            .map_err(|e| JobError::fatal(format!("result is not serializable: {e}")))
    }

    pub fn into_result(self) -> Option<Vec<u8>> {
        self.result
    }
}

/// Execution context for one attempt of one job.
///
/// Handlers should check [`JobContext::is_expired`] or race their work
/// against [`JobContext::expired`] to stop cleanly. Once the deadline passes
/// the pool cancels the handler task at its next await point and records a
/// retryable failure; work between awaits is not interrupted.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    job_type: String,
    queue_name: String,
    organization_id: OrganizationId,
    attempt: u32,
    max_attempts: u32,
    payload: Arc<[u8]>,
    deadline: Instant,
}

impl JobContext {
    pub fn new(job: &Job, timeout: Duration) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            queue_name: job.queue_name.clone(),
            organization_id: job.organization_id,
            attempt: job.attempt_count + 1,
            max_attempts: job.max_attempts,
            payload: Arc::from(job.payload.as_slice()),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }

    /// 1-indexed number of the attempt being executed.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload as JSON. A payload of the wrong shape will never
    /// decode, so the error is fatal.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            JobError::fatal(format!("payload for '{}' could not be decoded: {e}", self.job_type))
        })
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Resolves once the deadline has passed.
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.deadline).await;
    }
}

/// Future returned by a registered handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<JobOutput, JobError>> + Send>>;

/// Type-erased handler function.
pub type JobHandler = Arc<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>;

/// Closed map from `job_type` to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `job_type` to `handler`. Each type can be bound once.
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, handler: F) -> QueueResult<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobOutput, JobError>> + Send + 'static,
    {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(QueueError::invalid("job_type must not be empty"));
        }
        if self.handlers.contains_key(&job_type) {
            return Err(QueueError::DuplicateHandler(job_type));
        }

        let handler: JobHandler = Arc::new(move |ctx| Box::pin(handler(ctx)) as HandlerFuture);
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Option<JobHandler> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NewJob;
    use chrono::Utc;

    fn test_job(payload: &[u8]) -> Job {
        NewJob::new("photo_analysis", "photo_analysis", OrganizationId::new(), payload.to_vec())
            .into_job(Utc::now())
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("photo_analysis", |_ctx| async { Ok(JobOutput::empty()) })
            .unwrap();

        let err = registry
            .register("photo_analysis", |_ctx| async { Ok(JobOutput::empty()) })
            .unwrap_err();
        assert_eq!(err, QueueError::DuplicateHandler("photo_analysis".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_job_type_is_rejected() {
        let mut registry = HandlerRegistry::new();
        let err = registry
            .register("", |_ctx| async { Ok(JobOutput::empty()) })
            .unwrap_err();
        assert_eq!(err.code(), "EINVALID");
        assert!(registry.is_empty());
    }

    #[test]
    fn job_types_are_enumerable() {
        let mut registry = HandlerRegistry::new();
        registry.register("report_export", |_ctx| async { Ok(JobOutput::empty()) }).unwrap();
        registry.register("photo_analysis", |_ctx| async { Ok(JobOutput::empty()) }).unwrap();

        assert_eq!(registry.job_types(), vec!["photo_analysis", "report_export"]);
        assert!(registry.contains("report_export"));
        assert!(registry.get("email_digest").is_none());
    }

    #[tokio::test]
    async fn registered_handler_receives_context() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("photo_analysis", |ctx: JobContext| async move {
                let payload: serde_json::Value = ctx.payload_json()?;
                JobOutput::json(&serde_json::json!({
                    "attempt": ctx.attempt(),
                    "photo": payload["photo"],
                }))
            })
            .unwrap();

        let job = test_job(br#"{"photo":"p-1"}"#);
        let handler = registry.get("photo_analysis").unwrap();
        let output = handler(JobContext::new(&job, Duration::from_secs(5))).await.unwrap();

        let result: serde_json::Value = serde_json::from_slice(&output.into_result().unwrap()).unwrap();
        assert_eq!(result["attempt"], 1);
        assert_eq!(result["photo"], "p-1");
    }

    #[test]
    fn undecodable_payload_is_fatal() {
        let job = test_job(b"not json");
        let ctx = JobContext::new(&job, Duration::from_secs(1));
        let err = ctx.payload_json::<serde_json::Value>().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn anyhow_errors_are_retryable() {
        let err: JobError = anyhow::anyhow!("provider returned 503").into();
        assert_eq!(err, JobError::retryable("provider returned 503"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_tracks_timeout() {
        let job = test_job(b"{}");
        let ctx = JobContext::new(&job, Duration::from_secs(10));
        assert!(!ctx.is_expired());
        assert!(!ctx.is_final_attempt());

        ctx.expired().await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }
}
