//! The Job Status Store (C5): an observability record per background job.
//! Status writes are advisory — job correctness never depends on their
//! durability — so both backings use the same simple read/replace pattern
//! as [`crate::task_store`].

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{AgentError, Result};
use crate::types::BackgroundJobStatusInfo;

const JOB_STATUS_FILE: &str = "job_status.json";

pub trait JobStatusStore: Send + Sync {
    fn save(&self, status: &BackgroundJobStatusInfo) -> Result<()>;
    fn get(&self, job_id: &str) -> Result<Option<BackgroundJobStatusInfo>>;
    fn list(&self) -> Result<Vec<BackgroundJobStatusInfo>>;
}

#[derive(Default)]
pub struct InMemoryJobStatusStore {
    statuses: Mutex<HashMap<String, BackgroundJobStatusInfo>>,
}

impl InMemoryJobStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStatusStore for InMemoryJobStatusStore {
    fn save(&self, status: &BackgroundJobStatusInfo) -> Result<()> {
        let mut guard = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(status.job_id.clone(), status.clone());
        Ok(())
    }

    fn get(&self, job_id: &str) -> Result<Option<BackgroundJobStatusInfo>> {
        let guard = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(job_id).cloned())
    }

    fn list(&self) -> Result<Vec<BackgroundJobStatusInfo>> {
        let guard = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.values().cloned().collect())
    }
}

pub struct FileJobStatusStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, BackgroundJobStatusInfo>>,
}

impl FileJobStatusStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(JOB_STATUS_FILE);
        let cache = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            HashMap::new()
        };
        Ok(Self { path, cache: Mutex::new(cache) })
    }

    fn persist(&self, map: &HashMap<String, BackgroundJobStatusInfo>) -> Result<()> {
        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(map)?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(AgentError::Io)
    }
}

impl JobStatusStore for FileJobStatusStore {
    fn save(&self, status: &BackgroundJobStatusInfo) -> Result<()> {
        let mut guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(status.job_id.clone(), status.clone());
        self.persist(&guard)
    }

    fn get(&self, job_id: &str) -> Result<Option<BackgroundJobStatusInfo>> {
        let guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(job_id).cloned())
    }

    fn list(&self) -> Result<Vec<BackgroundJobStatusInfo>> {
        let guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackgroundJob, JobType};
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample() -> BackgroundJobStatusInfo {
        let job = BackgroundJob::new(JobType::Plan, serde_json::json!({}), 3);
        BackgroundJobStatusInfo::queued(&job, Utc::now())
    }

    #[test]
    fn in_memory_round_trips_a_status() {
        let store = InMemoryJobStatusStore::new();
        let status = sample();
        store.save(&status).unwrap();
        let loaded = store.get(&status.job_id).unwrap().unwrap();
        assert_eq!(loaded.job_id, status.job_id);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let status = sample();
        {
            let store = FileJobStatusStore::open(dir.path()).unwrap();
            store.save(&status).unwrap();
        }
        let reopened = FileJobStatusStore::open(dir.path()).unwrap();
        assert!(reopened.get(&status.job_id).unwrap().is_some());
    }

    #[test]
    fn list_returns_every_saved_status() {
        let store = InMemoryJobStatusStore::new();
        store.save(&sample()).unwrap();
        store.save(&sample()).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);
    }
}
