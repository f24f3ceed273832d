//! The Job Dispatcher (C8): admits jobs, deduplicates them, owns the
//! worker pool, and implements the retry/backoff and cancellation
//! contracts. Built on `tokio` per the concurrency model: `tokio::sync`
//! primitives for the queue and cancellation registry, `tokio::time::sleep`
//! for backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use opencopilot_audit::{AuditEventType, AuditLog, AuditStore, ResultTag};
use opencopilot_retry::{RetryPolicy, calculate_delay};

use crate::clock::Clock;
use crate::dedup::{self, DeduplicationService};
use crate::error::{AgentError, Result};
use crate::job_status_store::JobStatusStore;
use crate::queue::JobQueue;
use crate::types::{BackgroundJob, BackgroundJobStatusInfo, JobResult, JobStatus, JobType};

const DEDUP_TTL: Duration = Duration::from_secs(30 * 60);

/// Everything a [`JobHandler`] needs to do its work cooperatively: the job
/// payload's deserialized form is the handler's own business, but the
/// cancellation context is shared infrastructure.
pub struct JobContext {
    pub cancel: CancellationToken,
}

/// What a handler needs to enqueue a follow-on job (C9 enqueueing C10's
/// Execute job) without holding a strong reference back to the dispatcher
/// that owns it.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn enqueue(&self, job: BackgroundJob) -> bool;
}

/// A weak handle to a [`JobDispatcher`], safe for a handler to hold
/// without creating an `Arc` reference cycle (dispatcher → handler →
/// dispatcher).
pub struct DispatcherHandle(std::sync::Weak<JobDispatcher>);

#[async_trait]
impl Enqueuer for DispatcherHandle {
    async fn enqueue(&self, job: BackgroundJob) -> bool {
        match self.0.upgrade() {
            Some(dispatcher) => dispatcher.dispatch(job).await,
            None => false,
        }
    }
}

/// One chained job handler (C9 Plan, C10 Execute). A `Cancelled` error
/// propagates by unwinding; every other outcome is returned as a
/// [`JobResult`] value, never thrown.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &BackgroundJob, ctx: &JobContext) -> Result<JobResult>;
}

/// Tuning knobs the dispatcher needs beyond what [`crate::config`] already
/// validated, kept separate so the dispatcher can be constructed in tests
/// without a full `AppConfig`.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { max_concurrency: 4, max_retries: 4, queue_capacity: 256 }
    }
}

pub struct JobDispatcher {
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    queue: Arc<JobQueue>,
    dedup: Arc<DeduplicationService>,
    status_store: Arc<dyn JobStatusStore>,
    audit_store: Arc<dyn AuditStore>,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

impl JobDispatcher {
    pub fn new(
        config: DispatcherConfig,
        clock: Arc<dyn Clock>,
        status_store: Arc<dyn JobStatusStore>,
        audit_store: Arc<dyn AuditStore>,
        handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Arc::new(JobQueue::new(config.queue_capacity)),
            dedup: Arc::new(DeduplicationService::new(clock.clone())),
            config,
            clock,
            status_store,
            audit_store,
            handlers,
            cancellations: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawns the worker pool. The returned handles should be joined on
    /// shutdown.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.max_concurrency)
            .map(|_| {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.worker_loop().await })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.queue.shutdown();
    }

    /// A weak handle handlers can hold to enqueue follow-on jobs, without
    /// keeping the dispatcher alive past its owner.
    pub fn handle(self: &Arc<Self>) -> DispatcherHandle {
        DispatcherHandle(Arc::downgrade(self))
    }

    /// Admits a job: computes its fingerprint, deduplicates, records
    /// `Queued` status, and enqueues. Returns `false` if a live job already
    /// owns the fingerprint, or if enqueueing failed (queue full and
    /// shutting down).
    pub async fn dispatch(&self, job: BackgroundJob) -> bool {
        let fp = dedup::fingerprint(&job);
        if !self.dedup.try_register(&fp, &job.id, DEDUP_TTL) {
            self.audit(AuditEventType::JobDeduped, &job, ResultTag::Skipped, None);
            return false;
        }

        let now = self.clock.now();
        let status = BackgroundJobStatusInfo::queued(&job, now);
        let _ = self.status_store.save(&status);
        self.audit(AuditEventType::JobDispatched, &job, ResultTag::Success, None);

        if !self.queue.enqueue(job).await {
            self.dedup.release(&fp);
            return false;
        }
        true
    }

    /// Trips the cancellation token registered for `job_id`, if the job is
    /// known and not yet terminal. Returns `false` for an unknown id.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let guard = self.cancellations.lock().unwrap_or_else(|e| e.into_inner());
        match guard.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let job = tokio::select! {
                job = self.queue.dequeue() => job,
                _ = self.shutdown.cancelled() => None,
            };
            let Some(job) = job else { break };
            self.run_job(job, 0).await;
        }
    }

    async fn run_job(self: &Arc<Self>, job: BackgroundJob, attempt: u32) {
        let fp = dedup::fingerprint(&job);
        let job_token = CancellationToken::new();
        {
            let mut guard = self.cancellations.lock().unwrap_or_else(|e| e.into_inner());
            guard.insert(job.id.clone(), job_token.clone());
        }
        let linked = self.shutdown.child_token();
        let ctx = JobContext { cancel: job_token.clone().or(linked) };

        let started_at = self.clock.now();
        if let Ok(Some(mut status)) = self.status_store.get(&job.id) {
            status.status = JobStatus::Running;
            status.started_at = Some(started_at);
            status.attempt_count = attempt + 1;
            let _ = self.status_store.save(&status);
        }

        let handler = self.handlers.get(&job.job_type).cloned();
        let outcome = match handler {
            Some(handler) => handler.handle(&job, &ctx).await,
            None => Err(AgentError::InvalidPayload(format!("no handler registered for job type {}", job.job_type))),
        };

        {
            let mut guard = self.cancellations.lock().unwrap_or_else(|e| e.into_inner());
            guard.remove(&job.id);
        }

        match outcome {
            Err(AgentError::Cancelled) => {
                self.finish(&job, JobStatus::Cancelled, None, started_at).await;
                self.audit(AuditEventType::JobCancelled, &job, ResultTag::Skipped, None);
                self.dedup.release(&fp);
            }
            Err(other) => {
                self.handle_result(job, attempt, JobResult::failure(other.to_string(), other.is_retryable()), started_at)
                    .await;
            }
            Ok(result) => {
                self.handle_result(job, attempt, result, started_at).await;
            }
        }
    }

    async fn handle_result(self: &Arc<Self>, job: BackgroundJob, attempt: u32, result: JobResult, started_at: chrono::DateTime<chrono::Utc>) {
        let fp = dedup::fingerprint(&job);
        if result.success {
            self.finish(&job, JobStatus::Completed, result.result_data.clone(), started_at).await;
            self.dedup.release(&fp);
            return;
        }

        if result.should_retry && attempt < job.max_retries.max(self.config.max_retries) {
            self.audit(AuditEventType::JobRetried, &job, ResultTag::Failure, result.error.clone());
            let delay = calculate_delay(&RetryPolicy::AgentDefault.to_config(), attempt + 1);
            self.dedup.release(&fp);
            let dispatcher = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if dispatcher.shutdown.is_cancelled() {
                    return;
                }
                let new_fp = dedup::fingerprint(&job);
                if dispatcher.dedup.try_register(&new_fp, &job.id, DEDUP_TTL) {
                    dispatcher.run_job(job, attempt + 1).await;
                }
            });
            return;
        }

        self.finish(&job, JobStatus::Failed, None, started_at).await;
        self.audit(AuditEventType::JobDispatched, &job, ResultTag::Failure, result.error);
        self.dedup.release(&fp);
    }

    async fn finish(
        &self,
        job: &BackgroundJob,
        status: JobStatus,
        result_data: Option<serde_json::Value>,
        started_at: chrono::DateTime<chrono::Utc>,
    ) {
        let now = self.clock.now();
        if let Ok(Some(mut info)) = self.status_store.get(&job.id) {
            info.status = status;
            info.completed_at = Some(now);
            info.result_data = result_data;
            let _ = self.status_store.save(&info);
        } else {
            let mut info = BackgroundJobStatusInfo::queued(job, started_at);
            info.status = status;
            info.completed_at = Some(now);
            info.result_data = result_data;
            let _ = self.status_store.save(&info);
        }
    }

    fn audit(&self, event_type: AuditEventType, job: &BackgroundJob, result: ResultTag, error: Option<String>) {
        let mut entry = AuditLog::new(event_type, self.clock.now(), job.id.clone(), "dispatcher", job.id.clone())
            .with_description(format!("job {} ({})", job.id, job.job_type))
            .with_result(result);
        if let Some(err) = error {
            entry = entry.with_error(err);
        }
        let _ = self.audit_store.store(entry);
    }
}

trait TokenOrExt {
    fn or(self, other: CancellationToken) -> CancellationToken;
}

impl TokenOrExt for CancellationToken {
    /// Returns a token that trips when either `self` or `other` trips,
    /// without requiring `self` to have been created as `other`'s child.
    fn or(self, other: CancellationToken) -> CancellationToken {
        let combined = CancellationToken::new();
        let c1 = combined.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = self.cancelled() => c1.cancel(),
                _ = other.cancelled() => c1.cancel(),
            }
        });
        combined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job_status_store::InMemoryJobStatusStore;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        result: JobResult,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &BackgroundJob, _ctx: &JobContext) -> Result<JobResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    fn test_dispatcher(handler: Arc<dyn JobHandler>) -> Arc<JobDispatcher> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let status_store: Arc<dyn JobStatusStore> = Arc::new(InMemoryJobStatusStore::new());
        let audit_store: Arc<dyn AuditStore> = Arc::new(opencopilot_audit::InMemoryAuditStore::new());
        let mut handlers: HashMap<JobType, Arc<dyn JobHandler>> = HashMap::new();
        handlers.insert(JobType::Plan, handler);
        JobDispatcher::new(DispatcherConfig::default(), clock, status_store, audit_store, handlers)
    }

    #[tokio::test]
    async fn dispatch_then_worker_runs_the_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler { calls: calls.clone(), result: JobResult::success() });
        let dispatcher = test_dispatcher(handler);
        let workers = dispatcher.spawn_workers();

        let job = BackgroundJob::new(JobType::Plan, json!({"taskId": "o/r/issues/1"}), 3);
        assert!(dispatcher.dispatch(job).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        dispatcher.shutdown();
        for w in workers {
            let _ = w.await;
        }
    }

    #[tokio::test]
    async fn duplicate_fingerprint_while_in_flight_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler { calls: calls.clone(), result: JobResult::success() });
        let dispatcher = test_dispatcher(handler);

        let job1 = BackgroundJob::new(JobType::Plan, json!({"taskId": "o/r/issues/1"}), 3);
        let job2 = BackgroundJob::new(JobType::Plan, json!({"taskId": "o/r/issues/1"}), 3);
        assert!(dispatcher.dispatch(job1).await);
        assert!(!dispatcher.dispatch(job2).await);
    }

    #[tokio::test]
    async fn cancel_job_trips_its_token() {
        let dispatcher = test_dispatcher(Arc::new(CountingHandler {
            calls: Arc::new(AtomicUsize::new(0)),
            result: JobResult::success(),
        }));
        assert!(!dispatcher.cancel_job("unknown"));
    }
}
