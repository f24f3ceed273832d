//! The Forge client contract: out of scope for this crate (no concrete
//! implementation), but its shape is load-bearing for C9/C10, so it is
//! pinned here as a trait every handler is constructed against.

use async_trait::async_trait;

use crate::error::Result;

/// A pull request as the handlers need to see it.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
}

/// `RepositoryContents.GetAll` raises a distinct "not found" error
/// (`AgentError::NotFound`) from a transport error, which the instructions
/// loader's ordered-probe algorithm (C9 step 5) relies on to keep
/// searching rather than abort.
#[async_trait]
pub trait Forge: Send + Sync {
    async fn create_working_branch(&self, owner: &str, repo: &str, issue_number: u64) -> Result<String>;

    async fn create_draft_pull_request(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        issue_number: u64,
        title: &str,
        body: &str,
    ) -> Result<u64>;

    async fn update_pull_request_description(&self, owner: &str, repo: &str, pr_number: u64, title: &str, body: &str) -> Result<()>;

    async fn get_pull_request_number_for_branch(&self, owner: &str, repo: &str, branch: &str) -> Result<Option<u64>>;

    async fn post_pull_request_comment(&self, owner: &str, repo: &str, pr_number: u64, body: &str) -> Result<u64>;

    async fn get_pull_request(&self, owner: &str, repo: &str, pr_number: u64) -> Result<PullRequest>;

    /// Returns the raw contents of `path`. Distinguishes a missing path
    /// (`AgentError::NotFound`) from a transport error (`AgentError::Transient`).
    async fn get_repository_contents(&self, owner: &str, repo: &str, path: &str) -> Result<String>;

    /// Obtains an installation access token scoped to `installation_id`.
    async fn get_installation_token(&self, installation_id: u64) -> Result<String>;
}

/// Default working-branch name, per §4.9.
pub fn default_branch_name(issue_number: u64) -> String {
    format!("open-copilot/issue-{issue_number}")
}
