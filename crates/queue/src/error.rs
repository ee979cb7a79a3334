//! Queue error taxonomy.

use sitesafe_core::{JobId, OrganizationId};

use crate::jobs::JobStatus;

/// Result type used across the queue.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced by the store, the limiter, and the status interface.
///
/// Each variant has a stable code (see [`QueueError::code`]) that the HTTP
/// layer can hand to clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The job could never be routed or attempted. No record was created.
    #[error("invalid job: {0}")]
    Invalid(String),

    /// The tenant reached its enqueue ceiling for the current window.
    /// No record was created.
    #[error(
        "rate limit exceeded for organization {organization_id} on queue '{queue_name}' \
         ({limit} jobs per window)"
    )]
    RateLimited {
        organization_id: OrganizationId,
        queue_name: String,
        limit: u32,
    },

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The job exists but its current state does not allow the transition,
    /// typically because a concurrent transition committed first.
    #[error("job {id} is {status}; {reason}")]
    Conflict {
        id: JobId,
        status: JobStatus,
        reason: String,
    },

    #[error("handler already registered for job type '{0}'")]
    DuplicateHandler(String),

    /// Connectivity or decoding failure in the backing store.
    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn conflict(id: JobId, status: JobStatus, reason: impl Into<String>) -> Self {
        Self::Conflict {
            id,
            status,
            reason: reason.into(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::Invalid(_) => "EINVALID",
            QueueError::RateLimited { .. } => "ERATELIMIT",
            QueueError::NotFound(_) => "ENOTFOUND",
            QueueError::Conflict { .. } => "ECONFLICT",
            QueueError::DuplicateHandler(_) => "EDUPLICATE",
            QueueError::Storage(_) => "ESTORE",
        }
    }

    /// The caller lost a race for a state transition (or the job is gone).
    pub fn is_lost_transition(&self) -> bool {
        matches!(self, QueueError::NotFound(_) | QueueError::Conflict { .. })
    }

    /// Admission errors are returned to the enqueue caller synchronously.
    pub fn is_admission(&self) -> bool {
        matches!(self, QueueError::Invalid(_) | QueueError::RateLimited { .. })
    }
}
