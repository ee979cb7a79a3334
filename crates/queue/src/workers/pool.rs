//! Worker pool: polls the store, runs handlers, writes outcomes back.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use sitesafe_core::JobId;

use crate::error::{QueueError, QueueResult};
use crate::jobs::{BackoffPolicy, HandlerRegistry, Job, JobContext, JobError, JobHandler, JobOutput};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::store::JobStore;

/// Longest idle pause after repeated poll failures.
const MAX_IDLE_BACKOFF: Duration = Duration::from_secs(30);

/// How long loops get to hand back unstarted jobs once running handlers are
/// abandoned.
const RELEASE_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle broadcast from the handle to the loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Finish the current handler, release the rest of the batch, exit.
    Stopping,
    /// Stop waiting for the current handler as well.
    Abandoning,
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Independent polling loops
    pub worker_count: usize,
    /// Pause between polls
    pub poll_interval: Duration,
    /// Upper bound on a single handler invocation
    pub job_timeout: Duration,
    /// Jobs claimed per poll
    pub batch_size: usize,
    /// Default drain budget for [`WorkerPoolHandle::shutdown`]
    pub shutdown_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            worker_count: 4,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(5 * 60),
            batch_size: 1,
            shutdown_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.worker_count == 0 {
            return Err(QueueError::invalid("worker_count must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(QueueError::invalid("batch_size must be at least 1"));
        }
        if self.job_timeout.is_zero() {
            return Err(QueueError::invalid("job_timeout must be positive"));
        }
        Ok(())
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Handler outcomes written back (or attempted)
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    /// Claimed jobs handed back without running (ceiling or shutdown)
    pub jobs_deferred: u64,
    /// Outcomes discarded because the job changed state meanwhile
    pub transitions_lost: u64,
    pub in_flight: usize,
}

/// What `stop` observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every loop finished inside the timeout
    pub drained: bool,
    /// Jobs whose handlers were still running; they remain `processing`
    pub abandoned: Vec<JobId>,
}

#[derive(Debug, Default)]
struct PoolState {
    stats: Mutex<PoolStats>,
    running: Mutex<HashSet<JobId>>,
}

impl PoolState {
    fn stats(&self) -> PoolStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, f: impl FnOnce(&mut PoolStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn track(&self, id: JobId) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.insert(id);
        let in_flight = running.len();
        drop(running);
        self.update(|s| s.in_flight = in_flight);
    }

    fn untrack(&self, id: JobId) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.remove(&id);
        let in_flight = running.len();
        drop(running);
        self.update(|s| s.in_flight = in_flight);
    }

    /// Forget every running handler, returning their job ids. The handler
    /// tasks are left to finish on their own; nothing records their outcome.
    fn abandon_running(&self) -> Vec<JobId> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let mut abandoned: Vec<JobId> = running.drain().collect();
        drop(running);
        self.update(|s| s.in_flight = 0);
        abandoned.sort();
        abandoned
    }
}

/// How a handler outcome was written back.
enum Settled {
    Completed,
    Retried,
    Failed,
}

struct Shared<S: JobStore + ?Sized> {
    store: Arc<S>,
    limiter: RateLimiter<S>,
    handlers: HandlerRegistry,
    config: WorkerConfig,
    state: Arc<PoolState>,
}

impl<S: JobStore + ?Sized> Shared<S> {
    /// Claim one batch and run it. Returns the number of handlers invoked.
    async fn poll_once(
        &self,
        worker: &str,
        queue_names: &[String],
        shutdown: Option<&watch::Receiver<Phase>>,
    ) -> QueueResult<usize> {
        let batch = self
            .store
            .dequeue(queue_names, self.config.batch_size, self.limiter.dispatch_limit())
            .await?;
        if !batch.is_empty() {
            debug!(worker, claimed = batch.len(), "claimed jobs");
        }

        let mut handled = 0;
        let mut jobs = batch.into_iter();
        while let Some(job) = jobs.next() {
            let stopping = shutdown.is_some_and(|rx| *rx.borrow() != Phase::Running);
            if stopping {
                self.release_unstarted(worker, std::iter::once(job).chain(jobs)).await;
                break;
            }
            self.dispatch(worker, job, shutdown).await;
            handled += 1;
        }
        Ok(handled)
    }

    async fn release_unstarted(&self, worker: &str, jobs: impl Iterator<Item = Job>) {
        for job in jobs {
            match self.store.release(job.id, Utc::now()).await {
                Ok(()) => {
                    debug!(worker, job_id = %job.id, "released unstarted job on shutdown");
                    self.state.update(|s| s.jobs_deferred += 1);
                }
                Err(err) => {
                    warn!(worker, job_id = %job.id, error = %err, "failed to release unstarted job");
                }
            }
        }
    }

    async fn dispatch(&self, worker: &str, job: Job, shutdown: Option<&watch::Receiver<Phase>>) {
        match self.limiter.admit_claimed(&job).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    worker,
                    job_id = %job.id,
                    organization_id = %job.organization_id,
                    "concurrency ceiling reached; deferring job"
                );
                self.defer(worker, &job).await;
                return;
            }
            Err(err) => {
                warn!(worker, job_id = %job.id, error = %err, "admission check failed; deferring job");
                self.defer(worker, &job).await;
                return;
            }
        }

        if shutdown.is_some_and(|rx| *rx.borrow() != Phase::Running) {
            self.release_unstarted(worker, std::iter::once(job)).await;
            return;
        }

        let outcome = match self.handlers.get(&job.job_type) {
            Some(handler) => match self.invoke(worker, handler, &job, shutdown).await {
                Some(outcome) => outcome,
                None => return,
            },
            None => {
                warn!(worker, job_id = %job.id, job_type = %job.job_type, "no handler registered");
                Err(JobError::fatal(format!(
                    "no handler registered for job type '{}'",
                    job.job_type
                )))
            }
        };

        self.settle(worker, &job, outcome).await;
    }

    async fn defer(&self, worker: &str, job: &Job) {
        match self.store.release(job.id, Utc::now()).await {
            Ok(()) => self.state.update(|s| s.jobs_deferred += 1),
            Err(err) => warn!(worker, job_id = %job.id, error = %err, "failed to release deferred job"),
        }
    }

    /// Run the handler on its own task, bounded by the job timeout.
    ///
    /// Returns `None` when shutdown abandons the handler: the task keeps
    /// running detached, the job stays `processing` and stays tracked.
    async fn invoke(
        &self,
        worker: &str,
        handler: JobHandler,
        job: &Job,
        shutdown: Option<&watch::Receiver<Phase>>,
    ) -> Option<Result<JobOutput, JobError>> {
        let timeout = self.config.job_timeout;
        let ctx = JobContext::new(job, timeout);

        debug!(
            worker,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = ctx.attempt(),
            "running job"
        );

        let task = tokio::spawn(handler(ctx));
        let abort = task.abort_handle();
        self.state.track(job.id);
        let joined = tokio::select! {
            joined = tokio::time::timeout(timeout, task) => joined,
            _ = abandoned(shutdown.cloned()) => {
                warn!(worker, job_id = %job.id, "stopped waiting for running job; it stays processing");
                return None;
            }
        };
        self.state.untrack(job.id);

        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) if err.is_panic() => Err(JobError::retryable(format!(
                "handler panicked: {}",
                panic_message(err.into_panic())
            ))),
            Ok(Err(err)) => Err(JobError::retryable(format!("handler task ended abnormally: {err}"))),
            Err(_) => {
                abort.abort();
                Err(JobError::retryable(format!("job timed out after {timeout:?}")))
            }
        };
        Some(outcome)
    }

    /// Write the outcome back. A lost transition (the job was cancelled or
    /// otherwise moved on) is logged and the outcome dropped.
    async fn settle(&self, worker: &str, job: &Job, outcome: Result<JobOutput, JobError>) {
        let id = job.id;
        let written = match outcome {
            Ok(output) => self
                .store
                .mark_completed(id, output.into_result())
                .await
                .map(|()| Settled::Completed),
            Err(JobError::Fatal(message)) => {
                self.store.mark_failed(id, &message).await.map(|()| Settled::Failed)
            }
            Err(JobError::Retryable(message)) => {
                let attempt = job.attempt_count + 1;
                if attempt < job.max_attempts {
                    let next_run_at = self.config.backoff.next_run_at(Utc::now(), attempt);
                    debug!(worker, job_id = %id, attempt, %next_run_at, error = %message, "scheduling retry");
                    self.store
                        .mark_retry(id, &message, next_run_at)
                        .await
                        .map(|()| Settled::Retried)
                } else {
                    self.store.mark_failed(id, &message).await.map(|()| Settled::Failed)
                }
            }
        };

        self.state.update(|s| s.jobs_processed += 1);
        match written {
            Ok(Settled::Completed) => {
                debug!(worker, job_id = %id, job_type = %job.job_type, "job completed");
                self.state.update(|s| s.jobs_succeeded += 1);
            }
            Ok(Settled::Retried) => self.state.update(|s| s.jobs_retried += 1),
            Ok(Settled::Failed) => {
                warn!(
                    worker,
                    job_id = %id,
                    job_type = %job.job_type,
                    organization_id = %job.organization_id,
                    "job failed"
                );
                self.state.update(|s| s.jobs_failed += 1);
            }
            Err(err) if err.is_lost_transition() => {
                info!(worker, job_id = %id, error = %err, "job changed state while running; outcome discarded");
                self.state.update(|s| s.transitions_lost += 1);
            }
            Err(err) => {
                error!(worker, job_id = %id, error = %err, "failed to record job outcome");
            }
        }
    }
}

/// Resolves once the pool abandons running handlers, or when the handle is
/// gone. Never resolves without a shutdown channel.
async fn abandoned(shutdown: Option<watch::Receiver<Phase>>) {
    let Some(mut rx) = shutdown else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() == Phase::Abandoning {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn join_workers(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "job worker ended abnormally");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Idle pause before the next poll: the poll interval, doubled per
/// consecutive poll failure and capped.
fn idle_delay(poll_interval: Duration, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return poll_interval;
    }
    let cap = MAX_IDLE_BACKOFF.max(poll_interval);
    poll_interval
        .max(Duration::from_millis(100))
        .checked_mul(1 << consecutive_failures.min(8))
        .map_or(cap, |d| d.min(cap))
}

/// Worker pool, configured before it starts.
///
/// Handlers are registered on the pool; [`WorkerPool::start`] consumes it, so
/// the handler set is fixed once loops are running.
pub struct WorkerPool<S: JobStore + ?Sized> {
    shared: Shared<S>,
}

impl<S: JobStore + ?Sized + 'static> WorkerPool<S> {
    pub fn new(store: Arc<S>, config: WorkerConfig, rate_limit: RateLimitConfig) -> Self {
        let limiter = RateLimiter::new(Arc::clone(&store), rate_limit);
        Self {
            shared: Shared {
                store,
                limiter,
                handlers: HandlerRegistry::new(),
                config,
                state: Arc::new(PoolState::default()),
            },
        }
    }

    /// Bind a handler to `job_type`.
    pub fn register_handler<F, Fut>(&mut self, job_type: impl Into<String>, handler: F) -> QueueResult<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobOutput, JobError>> + Send + 'static,
    {
        let job_type = job_type.into();
        self.shared.handlers.register(job_type.clone(), handler)?;
        debug!(pool = %self.shared.config.name, job_type = %job_type, "registered job handler");
        Ok(())
    }

    pub fn registered_job_types(&self) -> Vec<&str> {
        self.shared.handlers.job_types()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    pub fn limiter(&self) -> &RateLimiter<S> {
        &self.shared.limiter
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.state.stats()
    }

    /// Claim and run a single batch on the current task.
    pub async fn run_once(&self, queue_names: &[String]) -> QueueResult<usize> {
        self.shared.poll_once("inline", queue_names, None).await
    }

    /// Spawn `worker_count` polling loops on the current tokio runtime.
    pub fn start<I, Q>(self, queue_names: I) -> QueueResult<WorkerPoolHandle>
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        self.shared.config.validate()?;

        let queues: Vec<String> = queue_names.into_iter().map(Into::into).collect();
        if queues.is_empty() || queues.iter().any(|q| q.trim().is_empty()) {
            return Err(QueueError::invalid("worker pool needs at least one non-empty queue name"));
        }

        tokio::runtime::Handle::try_current()
            .map_err(|_| QueueError::invalid("worker pool must be started inside a tokio runtime"))?;

        let shared = Arc::new(self.shared);
        let queues: Arc<[String]> = queues.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(Phase::Running);

        info!(
            pool = %shared.config.name,
            workers = shared.config.worker_count,
            queues = ?queues,
            job_types = ?shared.handlers.job_types(),
            "starting worker pool"
        );

        let mut workers = JoinSet::new();
        for idx in 0..shared.config.worker_count {
            let worker = format!("{}-{idx}", shared.config.name);
            workers.spawn(worker_loop(
                Arc::clone(&shared),
                worker,
                Arc::clone(&queues),
                shutdown_rx.clone(),
            ));
        }

        Ok(WorkerPoolHandle {
            name: shared.config.name.clone(),
            shutdown_timeout: shared.config.shutdown_timeout,
            shutdown: shutdown_tx,
            workers,
            state: Arc::clone(&shared.state),
        })
    }
}

impl<S: JobStore + ?Sized> std::fmt::Debug for WorkerPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .field("handlers", &self.shared.handlers)
            .finish()
    }
}

async fn worker_loop<S: JobStore + ?Sized>(
    shared: Arc<Shared<S>>,
    worker: String,
    queues: Arc<[String]>,
    mut shutdown: watch::Receiver<Phase>,
) {
    info!(worker = %worker, "job worker started");
    let mut consecutive_failures = 0u32;

    loop {
        if *shutdown.borrow() != Phase::Running {
            break;
        }

        let delay = idle_delay(shared.config.poll_interval, consecutive_failures);
        tokio::select! {
            // Also resolves when the handle is dropped.
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        match shared.poll_once(&worker, &queues, Some(&shutdown)).await {
            Ok(_) => consecutive_failures = 0,
            Err(err) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                error!(
                    worker = %worker,
                    error = %err,
                    consecutive_failures,
                    "failed to poll for jobs"
                );
            }
        }
    }

    info!(worker = %worker, "job worker stopped");
}

/// Handle to a running pool.
///
/// Dropping the handle aborts the loops without draining; use
/// [`WorkerPoolHandle::stop`] for a graceful shutdown.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    name: String,
    shutdown_timeout: Duration,
    shutdown: watch::Sender<Phase>,
    workers: JoinSet<()>,
    state: Arc<PoolState>,
}

impl WorkerPoolHandle {
    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.state.stats()
    }

    /// Stop polling and wait up to `timeout` for in-flight handlers.
    ///
    /// Unstarted jobs of a claimed batch are released to `pending`. Handlers
    /// still running at the deadline are no longer waited for and their jobs
    /// stay in `processing`.
    pub async fn stop(mut self, timeout: Duration) -> ShutdownReport {
        info!(pool = %self.name, ?timeout, "stopping worker pool");
        let _ = self.shutdown.send(Phase::Stopping);

        let drained = tokio::time::timeout(timeout, join_workers(&mut self.workers))
            .await
            .is_ok();

        if !drained {
            // Loops stop waiting for their handler, release the rest of their
            // batch and exit. Handler tasks keep running detached.
            let _ = self.shutdown.send(Phase::Abandoning);
            let released = tokio::time::timeout(RELEASE_GRACE, join_workers(&mut self.workers))
                .await
                .is_ok();
            if !released {
                warn!(pool = %self.name, "job workers did not exit after abandoning; aborting them");
                self.workers.abort_all();
                while self.workers.join_next().await.is_some() {}
            }
        }

        let abandoned = self.state.abandon_running();

        if abandoned.is_empty() {
            info!(pool = %self.name, drained, "worker pool stopped");
        } else {
            warn!(
                pool = %self.name,
                abandoned = abandoned.len(),
                "worker pool stopped with jobs still running; they remain processing"
            );
        }

        ShutdownReport { drained, abandoned }
    }

    /// [`stop`](Self::stop) with the configured shutdown timeout.
    pub async fn shutdown(self) -> ShutdownReport {
        let timeout = self.shutdown_timeout;
        self.stop(timeout).await
    }
}
