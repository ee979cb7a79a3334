//! Environment-driven configuration.
//!
//! | Env var | Default |
//! |---------|---------|
//! | `JOBS_WORKER_COUNT` | 4 |
//! | `JOBS_POLL_INTERVAL_MS` | 1000 |
//! | `JOBS_JOB_TIMEOUT_SECS` | 300 |
//! | `JOBS_BATCH_SIZE` | 1 |
//! | `JOBS_SHUTDOWN_TIMEOUT_SECS` | 30 |
//! | `JOBS_BACKOFF_BASE_SECS` | 60 |
//! | `JOBS_BACKOFF_MAX_SECS` | 3600 |
//! | `JOBS_ENABLE_RATE_LIMITING` | true |
//! | `JOBS_MAX_JOBS_PER_HOUR` | 100 |
//! | `JOBS_MAX_CONCURRENT_JOBS` | 5 |
//! | `JOBS_RATE_LIMIT_WINDOW_SECS` | 3600 |
//! | `JOBS_CLEANUP_INTERVAL_SECS` | 3600 |
//! | `JOBS_CLEANUP_RETENTION_HOURS` | 168 |
//! | `DATABASE_URL` | unset |

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::BackoffPolicy;
use crate::rate_limit::RateLimitConfig;
use crate::workers::{CleanupConfig, WorkerConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Everything the queue needs to run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueConfig {
    pub worker: WorkerConfig,
    pub rate_limit: RateLimitConfig,
    pub cleanup: CleanupConfig,
    pub database_url: Option<String>,
}

impl QueueConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read through `lookup`; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();
        let worker = defaults.worker;
        let rate_limit = defaults.rate_limit;
        let cleanup = defaults.cleanup;

        let rate_limit = RateLimitConfig {
            enabled: env.flag("JOBS_ENABLE_RATE_LIMITING", rate_limit.enabled)?,
            max_jobs_per_hour: env.parse("JOBS_MAX_JOBS_PER_HOUR", rate_limit.max_jobs_per_hour)?,
            max_concurrent_jobs: env.parse("JOBS_MAX_CONCURRENT_JOBS", rate_limit.max_concurrent_jobs)?,
            window: env.secs("JOBS_RATE_LIMIT_WINDOW_SECS", rate_limit.window)?,
        };

        let backoff = BackoffPolicy::exponential(
            env.secs("JOBS_BACKOFF_BASE_SECS", worker.backoff.base_delay)?,
            env.secs("JOBS_BACKOFF_MAX_SECS", worker.backoff.max_delay)?,
        );

        let config = Self {
            worker: WorkerConfig {
                worker_count: env.parse("JOBS_WORKER_COUNT", worker.worker_count)?,
                poll_interval: env.millis("JOBS_POLL_INTERVAL_MS", worker.poll_interval)?,
                job_timeout: env.secs("JOBS_JOB_TIMEOUT_SECS", worker.job_timeout)?,
                batch_size: env.parse("JOBS_BATCH_SIZE", worker.batch_size)?,
                shutdown_timeout: env.secs("JOBS_SHUTDOWN_TIMEOUT_SECS", worker.shutdown_timeout)?,
                backoff,
                ..worker
            },
            cleanup: CleanupConfig {
                interval: env.secs("JOBS_CLEANUP_INTERVAL_SECS", cleanup.interval)?,
                retention: env.hours("JOBS_CLEANUP_RETENTION_HOURS", cleanup.retention)?,
                ..cleanup
            }
            .with_rate_limit(&rate_limit),
            rate_limit,
            database_url: env.get("DATABASE_URL"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("JOBS_WORKER_COUNT", self.worker.worker_count as u64)?;
        positive("JOBS_BATCH_SIZE", self.worker.batch_size as u64)?;
        positive("JOBS_POLL_INTERVAL_MS", self.worker.poll_interval.as_millis() as u64)?;
        positive("JOBS_JOB_TIMEOUT_SECS", self.worker.job_timeout.as_secs())?;
        positive("JOBS_RATE_LIMIT_WINDOW_SECS", self.rate_limit.window.as_secs())?;
        positive("JOBS_CLEANUP_INTERVAL_SECS", self.cleanup.interval.as_secs())?;

        if self.rate_limit.enabled {
            positive("JOBS_MAX_JOBS_PER_HOUR", u64::from(self.rate_limit.max_jobs_per_hour))?;
            positive("JOBS_MAX_CONCURRENT_JOBS", u64::from(self.rate_limit.max_concurrent_jobs))?;

            // Finished jobs count against the enqueue window until swept.
            if self.cleanup.retention < self.rate_limit.window {
                return Err(ConfigError::Invalid {
                    var: "JOBS_CLEANUP_RETENTION_HOURS",
                    value: (self.cleanup.retention.as_secs() / 3600).to_string(),
                    reason: "must cover JOBS_RATE_LIMIT_WINDOW_SECS while rate limiting is enabled"
                        .to_string(),
                });
            }
        }

        if self.worker.backoff.max_delay < self.worker.backoff.base_delay {
            return Err(ConfigError::Invalid {
                var: "JOBS_BACKOFF_MAX_SECS",
                value: self.worker.backoff.max_delay.as_secs().to_string(),
                reason: "must not be below JOBS_BACKOFF_BASE_SECS".to_string(),
            });
        }
        Ok(())
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

fn positive(var: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank values are both treated as unset.
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_millis() as u64).map(Duration::from_millis)
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_secs()).map(Duration::from_secs)
    }

    fn hours(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let hours = self.parse(var, default.as_secs() / 3600)?;
        hours
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::Invalid {
                var,
                value: hours.to_string(),
                reason: "too large".to_string(),
            })
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(var) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var,
                    value,
                    reason: "expected true or false".to_string(),
                }),
            },
        }
    }
}
