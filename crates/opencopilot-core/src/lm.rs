//! The LM client contract: out of scope for this crate (no concrete
//! implementation of prompting or token handling), pinned here as traits
//! for the planner and executor roles C9/C10 call through.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::AgentPlan;

/// The context the planner needs to produce an [`AgentPlan`].
#[derive(Debug, Clone, Default)]
pub struct PlanningContext {
    pub task_id: String,
    pub issue_title: String,
    pub issue_body: String,
    pub repository_summary: Option<String>,
    pub instructions_markdown: Option<String>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn create_plan(&self, context: &PlanningContext) -> Result<AgentPlan>;
}

/// The context the executor needs to generate one step's code changes.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub task_id: String,
    pub step_title: String,
    pub step_details: String,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn generate_code(&self, request: &GenerationRequest, existing_code: Option<&str>) -> Result<String>;
}
