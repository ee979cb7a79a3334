//! Periodic deletion of old terminal jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{QueueError, QueueResult};
use crate::jobs::sub_duration;
use crate::rate_limit::RateLimitConfig;
use crate::store::JobStore;

/// Cleanup sweeper configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Terminal jobs completed longer ago than this are deleted
    pub retention: Duration,
    /// Shortest accepted retention. Finished jobs still count against the
    /// enqueue window, so deleting them earlier would reopen the ceiling.
    pub min_retention: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            min_retention: RateLimitConfig::default().window,
        }
    }
}

impl CleanupConfig {
    /// Set the retention floor to the enqueue window of `rate_limit`, or
    /// drop it when rate limiting is off.
    pub fn with_rate_limit(mut self, rate_limit: &RateLimitConfig) -> Self {
        self.min_retention = if rate_limit.enabled {
            rate_limit.window
        } else {
            Duration::ZERO
        };
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.interval.is_zero() {
            return Err(QueueError::invalid("cleanup interval must be positive"));
        }
        if self.retention < self.min_retention {
            return Err(QueueError::invalid(format!(
                "cleanup retention {:?} is shorter than the rate limit window {:?}",
                self.retention, self.min_retention
            )));
        }
        Ok(())
    }
}

/// Delete terminal jobs completed more than `retention` ago.
pub async fn run_cleanup<S: JobStore + ?Sized>(store: &S, retention: Duration) -> QueueResult<u64> {
    store.cleanup(sub_duration(Utc::now(), retention)).await
}

/// Handle to a running sweeper.
#[derive(Debug)]
pub struct CleanupHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<u64>>,
}

impl CleanupHandle {
    /// Stop the sweeper and return how many jobs it deleted in total.
    pub async fn shutdown(mut self) -> u64 {
        let _ = self.shutdown.send(true);
        match self.join.take() {
            Some(join) => join.await.unwrap_or_else(|err| {
                error!(error = %err, "cleanup worker ended abnormally");
                0
            }),
            None => 0,
        }
    }
}

/// Background retention sweeper.
#[derive(Debug)]
pub struct CleanupWorker;

impl CleanupWorker {
    /// Spawn the sweeper on the current tokio runtime. The first sweep runs
    /// immediately.
    pub fn spawn<S>(store: Arc<S>, config: CleanupConfig) -> QueueResult<CleanupHandle>
    where
        S: JobStore + ?Sized + 'static,
    {
        config.validate()?;
        tokio::runtime::Handle::try_current()
            .map_err(|_| QueueError::invalid("cleanup worker must be spawned inside a tokio runtime"))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(cleanup_loop(store, config, shutdown_rx));

        Ok(CleanupHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

async fn cleanup_loop<S: JobStore + ?Sized>(
    store: Arc<S>,
    config: CleanupConfig,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    info!(
        interval = ?config.interval,
        retention = ?config.retention,
        "cleanup worker started"
    );

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut total = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match run_cleanup(store.as_ref(), config.retention).await {
                    Ok(0) => debug!("cleanup found nothing to delete"),
                    Ok(deleted) => {
                        total += deleted;
                        info!(deleted, "deleted expired jobs");
                    }
                    Err(err) => error!(error = %err, "cleanup sweep failed"),
                }
            }
        }
    }

    info!(total_deleted = total, "cleanup worker stopped");
    total
}
