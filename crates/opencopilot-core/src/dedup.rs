//! The Deduplication Service (C6): maps a job fingerprint to the id of the
//! job currently in flight for it, with a TTL. Guarantees at most one live
//! job per fingerprint — for Plan/Execute jobs the task id is part of the
//! fingerprint, so the same task can never be planned or executed twice
//! concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::clock::Clock;
use crate::types::{BackgroundJob, JobType};

/// Derives the fingerprint a job should register under: its type plus the
/// task id carried in its payload's `taskId` field. Jobs without a
/// recognizable `taskId` fall back to the job's own id, which makes them
/// effectively unique (never deduplicated) rather than panicking.
pub fn fingerprint(job: &BackgroundJob) -> String {
    let task_id = job
        .payload
        .get("taskId")
        .and_then(|v| v.as_str())
        .unwrap_or(job.id.as_str());
    format!("{}:{}", job.job_type, task_id)
}

struct Entry {
    job_id: String,
    expires_at: DateTime<Utc>,
}

pub struct DeduplicationService {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl DeduplicationService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, entries: Mutex::new(HashMap::new()) }
    }

    /// Registers `job_id` for `fingerprint` if no live (non-expired) entry
    /// exists, or the existing live entry is for the same `job_id`. Returns
    /// `false` on conflict with a different live job id.
    pub fn try_register(&self, fingerprint: &str, job_id: &str, ttl: std::time::Duration) -> bool {
        let now = self.clock.now();
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = guard.get(fingerprint) {
            if existing.expires_at > now && existing.job_id != job_id {
                return false;
            }
        }
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero());
        guard.insert(
            fingerprint.to_string(),
            Entry { job_id: job_id.to_string(), expires_at: now + ttl },
        );
        true
    }

    pub fn release(&self, fingerprint: &str) {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(fingerprint);
    }

    /// Returns the live job id registered for `fingerprint`, if any and
    /// unexpired.
    pub fn get_active(&self, fingerprint: &str) -> Option<String> {
        let now = self.clock.now();
        let guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(fingerprint).and_then(|e| if e.expires_at > now { Some(e.job_id.clone()) } else { None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn plan_job(task_id: &str) -> BackgroundJob {
        BackgroundJob::new(JobType::Plan, json!({ "taskId": task_id }), 3)
    }

    #[test]
    fn fingerprint_includes_job_type_and_task_id() {
        let job = plan_job("o/r/issues/1");
        assert_eq!(fingerprint(&job), "plan:o/r/issues/1");
    }

    #[test]
    fn second_register_for_same_fingerprint_conflicts() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let svc = DeduplicationService::new(clock);
        let ttl = std::time::Duration::from_secs(60);
        assert!(svc.try_register("plan:t1", "job-a", ttl));
        assert!(!svc.try_register("plan:t1", "job-b", ttl));
    }

    #[test]
    fn release_frees_the_fingerprint_for_reuse() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let svc = DeduplicationService::new(clock);
        let ttl = std::time::Duration::from_secs(60);
        assert!(svc.try_register("plan:t1", "job-a", ttl));
        svc.release("plan:t1");
        assert!(svc.try_register("plan:t1", "job-b", ttl));
    }

    #[test]
    fn expired_entry_allows_a_new_registration() {
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let svc = DeduplicationService::new(clock.clone());
        let ttl = std::time::Duration::from_secs(10);
        assert!(svc.try_register("plan:t1", "job-a", ttl));
        clock.advance(ChronoDuration::seconds(11));
        assert!(svc.try_register("plan:t1", "job-b", ttl));
    }

    #[test]
    fn get_active_returns_none_when_nothing_registered() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let svc = DeduplicationService::new(clock);
        assert!(svc.get_active("plan:t1").is_none());
    }

    #[test]
    fn get_active_returns_job_id_while_live() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let svc = DeduplicationService::new(clock);
        svc.try_register("plan:t1", "job-a", std::time::Duration::from_secs(60));
        assert_eq!(svc.get_active("plan:t1").as_deref(), Some("job-a"));
    }
}
