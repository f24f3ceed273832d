//! Stress and concurrency tests for the dispatch path: dedup registration
//! under contention, the worker pool draining a large backlog, concurrent
//! job status writes, and cancellation racing with dispatch.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use crate::clock::{Clock, ManualClock};
    use crate::dedup::DeduplicationService;
    use crate::dispatcher::{DispatcherConfig, JobContext, JobDispatcher, JobHandler};
    use crate::error::Result;
    use crate::job_status_store::{InMemoryJobStatusStore, JobStatusStore};
    use crate::types::{BackgroundJob, BackgroundJobStatusInfo, JobResult, JobType};

    /// 64 tasks race to register the same fingerprint; exactly one of them
    /// should observe a successful registration, and the loser count should
    /// make up the rest.
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_dedup_registration_admits_exactly_one_winner() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let svc = Arc::new(DeduplicationService::new(clock));
        let ttl = Duration::from_secs(60);

        let mut handles = Vec::new();
        for i in 0..64 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.try_register("plan:contended-task", &format!("job-{i}"), ttl)
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("task panicked") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    /// Releasing and immediately re-registering the same fingerprint many
    /// times in a tight loop never leaves the service in a state where two
    /// concurrent registrations both succeed.
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn dedup_release_then_register_cycle_never_double_admits() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let svc = Arc::new(DeduplicationService::new(clock));
        let ttl = Duration::from_secs(60);

        for round in 0..200 {
            let fp = "plan:cycling-task";
            assert!(svc.try_register(fp, &format!("job-{round}-a"), ttl));
            assert!(!svc.try_register(fp, &format!("job-{round}-b"), ttl));
            svc.release(fp);
        }
    }

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &BackgroundJob, _ctx: &JobContext) -> Result<JobResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(JobResult::success())
        }
    }

    fn test_dispatcher(handler: Arc<dyn JobHandler>, max_concurrency: usize) -> Arc<JobDispatcher> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let status_store: Arc<dyn JobStatusStore> = Arc::new(InMemoryJobStatusStore::new());
        let audit_store: Arc<dyn opencopilot_audit::AuditStore> =
            Arc::new(opencopilot_audit::InMemoryAuditStore::new());
        let mut handlers: HashMap<JobType, Arc<dyn JobHandler>> = HashMap::new();
        handlers.insert(JobType::Plan, handler);
        let config = DispatcherConfig { max_concurrency, max_retries: 4, queue_capacity: 1024 };
        JobDispatcher::new(config, clock, status_store, audit_store, handlers)
    }

    /// A worker pool of 8 drains a backlog of 300 independently-fingerprinted
    /// jobs without dropping or double-running any of them.
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn worker_pool_drains_a_large_backlog_exactly_once_each() {
        const JOB_COUNT: usize = 300;
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = test_dispatcher(Arc::new(CountingHandler { calls: calls.clone() }), 8);
        let workers = dispatcher.spawn_workers();

        for i in 0..JOB_COUNT {
            let job = BackgroundJob::new(JobType::Plan, json!({"taskId": format!("o/r/issues/{i}")}), 3);
            assert!(dispatcher.dispatch(job).await);
        }

        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) == JOB_COUNT {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), JOB_COUNT);

        dispatcher.shutdown();
        for w in workers {
            let _ = w.await;
        }
    }

    /// Cancelling job ids concurrently with dispatch of unrelated jobs never
    /// panics or deadlocks the dispatcher, whether or not the cancelled id
    /// is actually in flight yet.
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_cancellation_and_dispatch_does_not_panic() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = test_dispatcher(Arc::new(CountingHandler { calls: calls.clone() }), 4);
        let workers = dispatcher.spawn_workers();

        let mut dispatch_tasks = Vec::new();
        for i in 0..100 {
            let dispatcher = dispatcher.clone();
            dispatch_tasks.push(tokio::spawn(async move {
                let job = BackgroundJob::new(JobType::Plan, json!({"taskId": format!("o/r/issues/{i}")}), 3);
                dispatcher.dispatch(job).await
            }));
        }

        let mut cancel_tasks = Vec::new();
        for i in 0..100 {
            let dispatcher = dispatcher.clone();
            cancel_tasks.push(tokio::spawn(async move {
                dispatcher.cancel_job(&format!("nonexistent-{i}"))
            }));
        }

        for t in dispatch_tasks {
            let _ = t.await.expect("dispatch task panicked");
        }
        for t in cancel_tasks {
            let _ = t.await.expect("cancel task panicked");
        }

        dispatcher.shutdown();
        for w in workers {
            let _ = w.await;
        }
    }

    struct AlwaysRetryableFailureHandler {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for AlwaysRetryableFailureHandler {
        async fn handle(&self, _job: &BackgroundJob, _ctx: &JobContext) -> Result<JobResult> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(JobResult::failure("sandbox create timed out", true))
        }
    }

    /// A handler that always reports a retryable failure is retried up to
    /// the configured limit and then settles as `Failed`, never retrying
    /// forever.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retry_exhaustion_settles_as_failed_after_max_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        const MAX_RETRIES: u32 = 2;

        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let status_store: Arc<dyn JobStatusStore> = Arc::new(InMemoryJobStatusStore::new());
        let audit_store: Arc<dyn opencopilot_audit::AuditStore> =
            Arc::new(opencopilot_audit::InMemoryAuditStore::new());
        let mut handlers: HashMap<JobType, Arc<dyn JobHandler>> = HashMap::new();
        handlers.insert(JobType::Plan, Arc::new(AlwaysRetryableFailureHandler { attempts: attempts.clone() }));
        let config = DispatcherConfig { max_concurrency: 1, max_retries: MAX_RETRIES, queue_capacity: 16 };
        let dispatcher = JobDispatcher::new(config, clock, status_store.clone(), audit_store, handlers);
        let workers = dispatcher.spawn_workers();

        let job = BackgroundJob::new(JobType::Plan, json!({"taskId": "o/r/issues/retry-exhaustion"}), MAX_RETRIES);
        let job_id = job.id.clone();
        assert!(dispatcher.dispatch(job).await);

        let mut final_status = None;
        for _ in 0..200 {
            if let Some(status) = status_store.get(&job_id).expect("get should not fail") {
                if matches!(status.status, crate::types::JobStatus::Failed) {
                    final_status = Some(status);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let final_status = final_status.expect("job should settle as Failed within the timeout");
        // One initial attempt plus MAX_RETRIES retries before giving up.
        assert_eq!(final_status.attempt_count, MAX_RETRIES + 1);
        assert_eq!(attempts.load(Ordering::SeqCst) as u32, MAX_RETRIES + 1);

        dispatcher.shutdown();
        for w in workers {
            let _ = w.await;
        }
    }

    /// Many tasks saving distinct job statuses concurrently, interleaved
    /// with reads, never lose a write: every job id that was saved is
    /// readable afterward with the right status.
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_job_status_writes_are_all_observable() {
        const JOB_COUNT: usize = 200;
        let store: Arc<dyn JobStatusStore> = Arc::new(InMemoryJobStatusStore::new());
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 0..JOB_COUNT {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let job = BackgroundJob::new(JobType::Plan, json!({"taskId": format!("o/r/issues/{i}")}), 3);
                let status = BackgroundJobStatusInfo::queued(&job, now);
                store.save(&status).expect("save should not fail");
                status.job_id
            }));
        }

        let mut job_ids = Vec::with_capacity(JOB_COUNT);
        for h in handles {
            job_ids.push(h.await.expect("task panicked"));
        }

        assert_eq!(store.list().expect("list should not fail").len(), JOB_COUNT);
        for id in job_ids {
            assert!(store.get(&id).expect("get should not fail").is_some());
        }
    }
}
