//! The Plan Job Handler (C9): creates the working branch and draft PR,
//! gathers best-effort repository context, calls the LM planner, persists
//! the plan, and enqueues the Execute job.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use opencopilot_audit::{AuditEventType, AuditLog, AuditStore, ResultTag};

use crate::clock::Clock;
use crate::dispatcher::{Enqueuer, JobContext, JobHandler};
use crate::error::{AgentError, Result};
use crate::forge::{self, Forge};
use crate::lm::{Planner, PlanningContext};
use crate::progress::ProgressReporter;
use crate::task_store::TaskStore;
use crate::types::{AgentTaskStatus, BackgroundJob, JobResult, JobType};

/// Best-effort static analysis of the target repository; out of scope for
/// this crate's contract, pinned here as a trait so C9 can call through it.
#[async_trait]
pub trait RepoAnalyzer: Send + Sync {
    async fn analyze(&self, owner: &str, repo: &str) -> Result<String>;
}

const INSTRUCTION_PATHS: [&str; 3] =
    [".github/open-copilot/{issue}.md", ".github/open-copilot/instructions.md", ".github/open-copilot/README.md"];

/// Probes, in order, the paths named by §4.9 step 5, returning the
/// content of the first that exists and is non-empty. A non-"not found"
/// transport error on one path does not abort the probe.
async fn load_instructions(forge: &dyn Forge, owner: &str, repo: &str, issue_number: u64) -> Option<String> {
    for template in INSTRUCTION_PATHS {
        let path = template.replace("{issue}", &issue_number.to_string());
        match forge.get_repository_contents(owner, repo, &path).await {
            Ok(content) if !content.trim().is_empty() => return Some(content),
            Ok(_) => continue,
            Err(AgentError::NotFound(_)) => continue,
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "instructions probe failed, continuing");
                continue;
            }
        }
    }
    None
}

#[derive(Debug, Deserialize)]
pub struct PlanJobPayload {
    pub task_id: String,
    pub installation_id: u64,
    pub owner: String,
    pub repo: String,
    pub issue_number: u64,
    pub issue_title: String,
    pub issue_body: String,
    #[serde(default)]
    pub webhook_id: Option<String>,
}

pub struct PlanJobHandler {
    forge: Arc<dyn Forge>,
    planner: Arc<dyn Planner>,
    repo_analyzer: Arc<dyn RepoAnalyzer>,
    task_store: Arc<dyn TaskStore>,
    progress: Arc<ProgressReporter>,
    enqueuer: Arc<dyn Enqueuer>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditStore>,
}

impl PlanJobHandler {
    pub fn new(
        forge: Arc<dyn Forge>,
        planner: Arc<dyn Planner>,
        repo_analyzer: Arc<dyn RepoAnalyzer>,
        task_store: Arc<dyn TaskStore>,
        progress: Arc<ProgressReporter>,
        enqueuer: Arc<dyn Enqueuer>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self { forge, planner, repo_analyzer, task_store, progress, enqueuer, clock, audit }
    }

    /// Records an audit entry for a task-scoped occurrence. Best-effort:
    /// a store failure is not allowed to affect job outcome.
    fn audit(&self, event_type: AuditEventType, task_id: &str, result: ResultTag, error: Option<String>) {
        let mut entry = AuditLog::new(event_type, self.clock.now(), task_id, "plan_handler", task_id);
        entry = entry.with_result(result);
        if let Some(error) = error {
            entry = entry.with_error(error);
        }
        let _ = self.audit.store(entry);
    }
}

#[async_trait]
impl JobHandler for PlanJobHandler {
    async fn handle(&self, job: &BackgroundJob, ctx: &JobContext) -> Result<JobResult> {
        let payload: PlanJobPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(p) => p,
            Err(e) => return Ok(JobResult::failure(e.to_string(), true)),
        };

        if ctx.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let branch = forge::default_branch_name(payload.issue_number);
        let branch = match self.forge.create_working_branch(&payload.owner, &payload.repo, payload.issue_number).await {
            Ok(b) if !b.is_empty() => b,
            Ok(_) => branch,
            Err(e) if e.is_retryable() => return Ok(JobResult::failure(e.to_string(), true)),
            Err(e) => return Ok(JobResult::failure(e.to_string(), false)),
        };

        let pr_number = match self
            .forge
            .create_draft_pull_request(&payload.owner, &payload.repo, &branch, payload.issue_number, &payload.issue_title, &payload.issue_body)
            .await
        {
            Ok(n) => n,
            Err(e) => return Ok(JobResult::failure(e.to_string(), e.is_retryable())),
        };

        let repository_summary = match self.repo_analyzer.analyze(&payload.owner, &payload.repo).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                tracing::warn!(error = %e, "repository analysis failed, continuing with no summary");
                None
            }
        };

        let instructions_markdown = load_instructions(self.forge.as_ref(), &payload.owner, &payload.repo, payload.issue_number).await;

        let mut task = match self.task_store.get(&payload.task_id)? {
            Some(t) => t,
            None => return Ok(JobResult::failure(format!("task {} not found", payload.task_id), false)),
        };

        if ctx.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let now = self.clock.now();
        if let Err(e) = task.transition(AgentTaskStatus::Planning, now) {
            return Ok(JobResult::failure(e, false));
        }
        task.branch = Some(branch.clone());
        task.pr_number = Some(pr_number);
        self.task_store.save(&task)?;
        self.audit(AuditEventType::TaskStatusChanged, &task.id, ResultTag::Success, None);

        let context = PlanningContext {
            task_id: payload.task_id.clone(),
            issue_title: payload.issue_title.clone(),
            issue_body: payload.issue_body.clone(),
            repository_summary,
            instructions_markdown,
        };
        let plan = match self.planner.create_plan(&context).await {
            Ok(plan) => plan,
            Err(e) => return Ok(JobResult::failure(e.to_string(), e.is_retryable())),
        };
        if let Err(e) = plan.validate() {
            return Ok(JobResult::failure(e, false));
        }
        self.audit(AuditEventType::PlanGeneration, &task.id, ResultTag::Success, None);

        let now = self.clock.now();
        task.plan = Some(plan.clone());
        if let Err(e) = task.transition(AgentTaskStatus::Planned, now) {
            return Ok(JobResult::failure(e, false));
        }
        self.task_store.save(&task)?;
        self.audit(AuditEventType::TaskStatusChanged, &task.id, ResultTag::Success, None);

        match self.progress.post_plan(&payload.owner, &payload.repo, pr_number, &payload.issue_title, &plan).await {
            Ok(()) => self.audit(AuditEventType::PullRequestUpdated, &task.id, ResultTag::Success, None),
            Err(e) => tracing::warn!(error = %e, "failed to post plan to pull request"),
        }

        let execute_payload = serde_json::json!({ "taskId": payload.task_id });
        let execute_job = BackgroundJob::new(JobType::Execute, execute_payload, job.max_retries);
        if !self.enqueuer.enqueue(execute_job).await {
            tracing::warn!(task_id = %payload.task_id, "dispatcher rejected the follow-on execute job");
        }

        Ok(JobResult::success())
    }
}
