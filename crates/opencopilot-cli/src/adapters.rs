//! Placeholder adapters for the collaborators this codebase pins as
//! traits but never implements concretely: the forge client, the LM
//! planner/executor, and repository analysis. `serve` wires these in so
//! the dispatcher and handlers have something to construct against; every
//! method returns `AgentError::Config` naming the trait that has no
//! concrete implementation, rather than silently no-opping.

use async_trait::async_trait;

use opencopilot_core::error::{AgentError, Result};
use opencopilot_core::forge::{Forge, PullRequest};
use opencopilot_core::handlers::plan::RepoAnalyzer;
use opencopilot_core::lm::{Executor, GenerationRequest, Planner, PlanningContext};
use opencopilot_core::types::AgentPlan;

fn unconfigured(what: &str) -> AgentError {
    AgentError::Config(format!("{what} has no concrete implementation in this build"))
}

pub struct UnconfiguredForge;

#[async_trait]
impl Forge for UnconfiguredForge {
    async fn create_working_branch(&self, _owner: &str, _repo: &str, _issue_number: u64) -> Result<String> {
        Err(unconfigured("Forge"))
    }

    async fn create_draft_pull_request(
        &self,
        _owner: &str,
        _repo: &str,
        _branch: &str,
        _issue_number: u64,
        _title: &str,
        _body: &str,
    ) -> Result<u64> {
        Err(unconfigured("Forge"))
    }

    async fn update_pull_request_description(
        &self,
        _owner: &str,
        _repo: &str,
        _pr_number: u64,
        _title: &str,
        _body: &str,
    ) -> Result<()> {
        Err(unconfigured("Forge"))
    }

    async fn get_pull_request_number_for_branch(&self, _owner: &str, _repo: &str, _branch: &str) -> Result<Option<u64>> {
        Err(unconfigured("Forge"))
    }

    async fn post_pull_request_comment(&self, _owner: &str, _repo: &str, _pr_number: u64, _body: &str) -> Result<u64> {
        Err(unconfigured("Forge"))
    }

    async fn get_pull_request(&self, _owner: &str, _repo: &str, _pr_number: u64) -> Result<PullRequest> {
        Err(unconfigured("Forge"))
    }

    async fn get_repository_contents(&self, _owner: &str, _repo: &str, _path: &str) -> Result<String> {
        Err(AgentError::NotFound("no Forge client is configured in this build".into()))
    }

    async fn get_installation_token(&self, _installation_id: u64) -> Result<String> {
        Err(unconfigured("Forge"))
    }
}

pub struct UnconfiguredPlanner;

#[async_trait]
impl Planner for UnconfiguredPlanner {
    async fn create_plan(&self, _context: &PlanningContext) -> Result<AgentPlan> {
        Err(unconfigured("Planner"))
    }
}

pub struct UnconfiguredExecutor;

#[async_trait]
impl Executor for UnconfiguredExecutor {
    async fn generate_code(&self, _request: &GenerationRequest, _existing_code: Option<&str>) -> Result<String> {
        Err(unconfigured("Executor"))
    }
}

pub struct UnconfiguredRepoAnalyzer;

#[async_trait]
impl RepoAnalyzer for UnconfiguredRepoAnalyzer {
    async fn analyze(&self, _owner: &str, _repo: &str) -> Result<String> {
        Err(unconfigured("RepoAnalyzer"))
    }
}
