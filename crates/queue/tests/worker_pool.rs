use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sitesafe_queue::{
    BackoffPolicy, EnqueueRequest, InMemoryJobStore, JobError, JobId, JobOutput, JobQueue,
    JobStatus, JobStore, OrganizationId, RateLimitConfig, WorkerConfig, WorkerPool,
};

const JOB_TYPE: &str = "photo_analysis";

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_name("test-pool")
        .with_worker_count(2)
        .with_poll_interval(Duration::from_millis(10))
        .with_job_timeout(Duration::from_secs(30))
        .with_backoff(BackoffPolicy::immediate())
}

/// Poll `check` until it returns true or five seconds pass.
async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_status(store: &InMemoryJobStore, id: JobId, status: JobStatus) {
    wait_until(status.as_str(), || async move {
        store.get_job(id).await.map(|j| j.status == status).unwrap_or(false)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn always_retryable_job_ends_failed_with_full_budget() {
    let store = InMemoryJobStore::arc();
    let queue = JobQueue::new(store.clone(), RateLimitConfig::default());
    let mut pool = WorkerPool::new(store.clone(), fast_config(), RateLimitConfig::default());
    pool.register_handler(JOB_TYPE, |_ctx| async {
        Err(JobError::retryable("vision provider unavailable"))
    })
    .unwrap();
    let handle = pool.start([JOB_TYPE]).unwrap();

    let id = queue
        .enqueue(EnqueueRequest::new(JOB_TYPE, OrganizationId::new(), b"{}".to_vec()).with_max_attempts(3))
        .await
        .unwrap();
    wait_for_status(&store, id, JobStatus::Failed).await;

    let view = queue.get_status(id).await.unwrap();
    assert_eq!(view.attempt_count, 3);
    assert_eq!(view.error_message.as_deref(), Some("vision provider unavailable"));
    assert!(view.result.is_none());

    let report = handle.stop(Duration::from_secs(5)).await;
    assert!(report.drained);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn job_succeeding_on_second_attempt_counts_one_failure() {
    let store = InMemoryJobStore::arc();
    let queue = JobQueue::new(store.clone(), RateLimitConfig::default());
    let mut pool = WorkerPool::new(store.clone(), fast_config(), RateLimitConfig::default());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    pool.register_handler(JOB_TYPE, move |ctx| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(anyhow::anyhow!("photo not yet uploaded").into());
            }
            JobOutput::json(&serde_json::json!({ "attempt": ctx.attempt(), "hazards": 2 }))
        }
    })
    .unwrap();
    let handle = pool.start([JOB_TYPE]).unwrap();

    let id = queue
        .enqueue(EnqueueRequest::new(JOB_TYPE, OrganizationId::new(), b"{}".to_vec()))
        .await
        .unwrap();
    wait_for_status(&store, id, JobStatus::Completed).await;

    let job = store.get_job(id).await.unwrap();
    assert_eq!(job.attempt_count, 1);
    let result: serde_json::Value = job.result_json().unwrap().unwrap();
    assert_eq!(result["attempt"], 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_ceiling_of_one_runs_tenant_jobs_one_at_a_time() {
    let store = InMemoryJobStore::arc();
    let limits = RateLimitConfig::default().with_max_concurrent_jobs(1);
    let queue = JobQueue::new(store.clone(), limits.clone());
    let mut pool = WorkerPool::new(store.clone(), fast_config().with_worker_count(4), limits);

    let running = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let (r, p) = (running.clone(), peak.clone());
    pool.register_handler(JOB_TYPE, move |_ctx| {
        let (running, peak) = (r.clone(), p.clone());
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(JobOutput::empty())
        }
    })
    .unwrap();

    let org = OrganizationId::new();
    let first = queue.enqueue(EnqueueRequest::new(JOB_TYPE, org, vec![])).await.unwrap();
    let second = queue.enqueue(EnqueueRequest::new(JOB_TYPE, org, vec![])).await.unwrap();
    let handle = pool.start([JOB_TYPE]).unwrap();

    let mut max_processing = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = store.stats(org).await.unwrap();
        max_processing = max_processing.max(stats.processing);
        if stats.completed == 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert_eq!(max_processing, 1);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    for id in [first, second] {
        assert_eq!(store.get_job(id).await.unwrap().attempt_count, 0);
    }

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_waits_for_in_flight_handlers() {
    let store = InMemoryJobStore::arc();
    let mut pool = WorkerPool::new(store.clone(), fast_config(), RateLimitConfig::disabled());
    pool.register_handler(JOB_TYPE, |_ctx| async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(JobOutput::bytes("done"))
    })
    .unwrap();
    let handle = pool.start([JOB_TYPE]).unwrap();

    let id = store
        .enqueue(sitesafe_queue::NewJob::new(JOB_TYPE, JOB_TYPE, OrganizationId::new(), vec![]), None)
        .await
        .unwrap();
    wait_for_status(&store, id, JobStatus::Processing).await;

    let report = handle.stop(Duration::from_secs(5)).await;
    assert!(report.drained);
    assert!(report.abandoned.is_empty());
    assert_eq!(store.get_job(id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_timeout_abandons_running_jobs_in_processing() {
    let store = InMemoryJobStore::arc();
    let mut pool = WorkerPool::new(store.clone(), fast_config(), RateLimitConfig::disabled());
    pool.register_handler(JOB_TYPE, |_ctx| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(JobOutput::empty())
    })
    .unwrap();
    let handle = pool.start([JOB_TYPE]).unwrap();

    let id = store
        .enqueue(sitesafe_queue::NewJob::new(JOB_TYPE, JOB_TYPE, OrganizationId::new(), vec![]), None)
        .await
        .unwrap();
    wait_until("handler to start", || {
        let stats = handle.stats();
        async move { stats.in_flight == 1 }
    })
    .await;

    let report = handle.stop(Duration::from_millis(50)).await;
    assert!(!report.drained);
    assert_eq!(report.abandoned, vec![id]);

    let job = store.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempt_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_releases_unstarted_jobs_of_the_batch() {
    let store = InMemoryJobStore::arc();
    let config = fast_config().with_worker_count(1).with_batch_size(3);
    let mut pool = WorkerPool::new(store.clone(), config, RateLimitConfig::disabled());
    pool.register_handler(JOB_TYPE, |_ctx| async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(JobOutput::empty())
    })
    .unwrap();

    let org = OrganizationId::new();
    for _ in 0..3 {
        store
            .enqueue(sitesafe_queue::NewJob::new(JOB_TYPE, JOB_TYPE, org, vec![]), None)
            .await
            .unwrap();
    }
    let handle = pool.start([JOB_TYPE]).unwrap();
    wait_until("batch to be claimed", || {
        let store = store.clone();
        async move { store.stats(org).await.unwrap().processing == 3 }
    })
    .await;

    let report = handle.stop(Duration::from_secs(5)).await;
    assert!(report.drained);

    let stats = store.stats(org).await.unwrap();
    assert_eq!((stats.completed, stats.pending, stats.processing), (1, 2, 0));
    for job in store.list_active(org).await.unwrap() {
        assert_eq!(job.attempt_count, 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_timeout_still_releases_unstarted_jobs_of_the_batch() {
    let store = InMemoryJobStore::arc();
    let config = fast_config().with_worker_count(1).with_batch_size(3);
    let mut pool = WorkerPool::new(store.clone(), config, RateLimitConfig::disabled());
    pool.register_handler(JOB_TYPE, |_ctx| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(JobOutput::empty())
    })
    .unwrap();

    let org = OrganizationId::new();
    for _ in 0..3 {
        store
            .enqueue(sitesafe_queue::NewJob::new(JOB_TYPE, JOB_TYPE, org, vec![]), None)
            .await
            .unwrap();
    }
    let handle = pool.start([JOB_TYPE]).unwrap();
    wait_until("handler to start", || {
        let stats = handle.stats();
        async move { stats.in_flight == 1 }
    })
    .await;

    let report = handle.stop(Duration::from_millis(50)).await;
    assert!(!report.drained);
    assert_eq!(report.abandoned.len(), 1);

    let running = store.get_job(report.abandoned[0]).await.unwrap();
    assert_eq!(running.status, JobStatus::Processing);
    let stats = store.stats(org).await.unwrap();
    assert_eq!((stats.processing, stats.pending), (1, 2));
    for job in store.list_active(org).await.unwrap() {
        assert_eq!(job.attempt_count, 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_wins_over_late_completion() {
    let store = InMemoryJobStore::arc();
    let queue = JobQueue::new(store.clone(), RateLimitConfig::default());
    let mut pool = WorkerPool::new(store.clone(), fast_config(), RateLimitConfig::default());
    pool.register_handler(JOB_TYPE, |_ctx| async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(JobOutput::bytes("late"))
    })
    .unwrap();
    let handle = pool.start([JOB_TYPE]).unwrap();

    let id = queue
        .enqueue(EnqueueRequest::new(JOB_TYPE, OrganizationId::new(), vec![]))
        .await
        .unwrap();
    wait_for_status(&store, id, JobStatus::Processing).await;

    let cancelled = queue.cancel(id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Failed);

    wait_until("worker to observe the cancel", || {
        let stats = handle.stats();
        async move { stats.transitions_lost == 1 }
    })
    .await;

    let job = store.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some(sitesafe_queue::CANCELLED_BY_USER));
    assert!(job.result.is_none());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pools_sharing_a_store_run_each_job_once() {
    let store = InMemoryJobStore::arc();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for name in ["pool-a", "pool-b"] {
        let mut pool = WorkerPool::new(
            store.clone(),
            fast_config().with_name(name).with_worker_count(4).with_batch_size(2),
            RateLimitConfig::disabled(),
        );
        let seen = seen.clone();
        pool.register_handler(JOB_TYPE, move |ctx| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(ctx.job_id());
                Ok(JobOutput::empty())
            }
        })
        .unwrap();
        handles.push(pool.start([JOB_TYPE]).unwrap());
    }

    let org = OrganizationId::new();
    for _ in 0..100 {
        store
            .enqueue(sitesafe_queue::NewJob::new(JOB_TYPE, JOB_TYPE, org, vec![]), None)
            .await
            .unwrap();
    }
    wait_until("all jobs to complete", || {
        let store = store.clone();
        async move { store.stats(org).await.unwrap().completed == 100 }
    })
    .await;

    for handle in handles {
        handle.shutdown().await;
    }

    let seen = seen.lock().unwrap();
    let unique: HashSet<JobId> = seen.iter().copied().collect();
    assert_eq!(seen.len(), 100);
    assert_eq!(unique.len(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_job_types_fail_without_retries() {
    let store = InMemoryJobStore::arc();
    let mut pool = WorkerPool::new(store.clone(), fast_config(), RateLimitConfig::disabled());
    pool.register_handler(JOB_TYPE, |_ctx| async { Ok(JobOutput::empty()) })
        .unwrap();
    let handle = pool.start(["reports"]).unwrap();

    let id = store
        .enqueue(
            sitesafe_queue::NewJob::new("reports", "report_export", OrganizationId::new(), vec![])
                .with_max_attempts(5),
            None,
        )
        .await
        .unwrap();
    wait_for_status(&store, id, JobStatus::Failed).await;

    let job = store.get_job(id).await.unwrap();
    assert_eq!(job.attempt_count, 5);
    assert!(job.error_message.unwrap().contains("report_export"));

    handle.shutdown().await;
}
