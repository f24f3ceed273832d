//! The Task Store (C4): keeps one [`AgentTask`] per task id. Either purely
//! in-memory or file-backed under the configured state directory,
//! selected at wiring time per [`crate::config::StoreConfig`].

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{AgentError, Result};
use crate::types::AgentTask;

const TASK_STORE_FILE: &str = "tasks.json";

pub trait TaskStore: Send + Sync {
    fn save(&self, task: &AgentTask) -> Result<()>;
    fn get(&self, task_id: &str) -> Result<Option<AgentTask>>;
    fn list(&self) -> Result<Vec<AgentTask>>;
    fn delete(&self, task_id: &str) -> Result<()>;
}

/// Pure in-memory backing, used when no state directory is configured.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<String, AgentTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn save(&self, task: &AgentTask) -> Result<()> {
        let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get(&self, task_id: &str) -> Result<Option<AgentTask>> {
        let guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(task_id).cloned())
    }

    fn list(&self) -> Result<Vec<AgentTask>> {
        let guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.values().cloned().collect())
    }

    fn delete(&self, task_id: &str) -> Result<()> {
        let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(task_id);
        Ok(())
    }
}

/// File-backed store: a single JSON map under the state directory, kept
/// cached in memory and rewritten atomically on every mutation.
pub struct FileTaskStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, AgentTask>>,
}

impl FileTaskStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(TASK_STORE_FILE);
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

    fn persist(&self, map: &HashMap<String, AgentTask>) -> Result<()> {
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

impl TaskStore for FileTaskStore {
    fn save(&self, task: &AgentTask) -> Result<()> {
        let mut guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(task.id.clone(), task.clone());
        self.persist(&guard)
    }

    fn get(&self, task_id: &str) -> Result<Option<AgentTask>> {
        let guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(task_id).cloned())
    }

    fn list(&self) -> Result<Vec<AgentTask>> {
        let guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.values().cloned().collect())
    }

    fn delete(&self, task_id: &str) -> Result<()> {
        let mut guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(task_id);
        self.persist(&guard)
    }
}
