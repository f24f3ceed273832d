//! The Execute Job Handler (C10): runs the plan step-by-step inside the
//! task's sandbox, commits and pushes when the tree is dirty, and
//! finalizes the pull request.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use opencopilot_audit::{AuditEventType, AuditLog, AuditStore, ResultTag};

use crate::clock::Clock;
use crate::dispatcher::{JobContext, JobHandler};
use crate::error::{AgentError, Result};
use crate::forge::Forge;
use crate::lm::{Executor, GenerationRequest};
use crate::progress::ProgressReporter;
use crate::sandbox::SandboxManager;
use crate::task_store::TaskStore;
use crate::types::{AgentTaskStatus, BackgroundJob, ImageType, JobResult};

#[derive(Debug, Deserialize)]
pub struct ExecuteJobPayload {
    pub task_id: String,
}

pub struct ExecuteJobHandler {
    forge: Arc<dyn Forge>,
    executor: Arc<dyn Executor>,
    sandbox: Arc<SandboxManager>,
    task_store: Arc<dyn TaskStore>,
    progress: Arc<ProgressReporter>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditStore>,
}

impl ExecuteJobHandler {
    pub fn new(
        forge: Arc<dyn Forge>,
        executor: Arc<dyn Executor>,
        sandbox: Arc<SandboxManager>,
        task_store: Arc<dyn TaskStore>,
        progress: Arc<ProgressReporter>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self { forge, executor, sandbox, task_store, progress, clock, audit }
    }

    /// Records an audit entry for a task-scoped occurrence. Best-effort:
    /// a store failure is not allowed to affect job outcome.
    fn audit(&self, event_type: AuditEventType, task_id: &str, result: ResultTag, error: Option<String>) {
        let mut entry = AuditLog::new(event_type, self.clock.now(), task_id, "execute_handler", task_id);
        entry = entry.with_result(result);
        if let Some(error) = error {
            entry = entry.with_error(error);
        }
        let _ = self.audit.store(entry);
    }

    /// Transitions the task to `Cancelled` and persists it. Mirrors
    /// `fail_task` but never marks for retry: the dispatcher already
    /// settles the job itself as `Cancelled`.
    fn cancel_task(&self, task: &mut crate::types::AgentTask) {
        let now = self.clock.now();
        let _ = task.transition(AgentTaskStatus::Cancelled, now);
        let _ = self.task_store.save(task);
        self.audit(AuditEventType::TaskStatusChanged, &task.id, ResultTag::Skipped, None);
    }
}

#[async_trait]
impl JobHandler for ExecuteJobHandler {
    async fn handle(&self, job: &BackgroundJob, ctx: &JobContext) -> Result<JobResult> {
        let payload: ExecuteJobPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(p) => p,
            Err(e) => return Ok(JobResult::failure(e.to_string(), true)),
        };

        let mut task = match self.task_store.get(&payload.task_id)? {
            Some(t) => t,
            None => return Ok(JobResult::failure(format!("task {} not found", payload.task_id), false)),
        };
        let Some(plan) = task.plan.clone() else {
            return Ok(JobResult::failure("PlanMissing", false));
        };
        let branch = task.branch.clone().unwrap_or_else(|| crate::forge::default_branch_name(task.issue_number));
        let pr_number = task.pr_number;

        let now = self.clock.now();
        if let Err(e) = task.transition(AgentTaskStatus::Executing, now) {
            return Ok(JobResult::failure(e, false));
        }
        self.task_store.save(&task)?;
        self.audit(AuditEventType::TaskStatusChanged, &task.id, ResultTag::Success, None);

        if ctx.cancel.is_cancelled() {
            self.cancel_task(&mut task);
            return Err(AgentError::Cancelled);
        }

        let image_type = match plan.image_hint.as_deref() {
            Some(hint) => match ImageType::parse(hint) {
                Ok(image) => image,
                Err(e) => return Ok(self.fail_task(&mut task, e.to_string(), false)),
            },
            None => ImageType::default(),
        };

        let token = match self.forge.get_installation_token(task.installation_id).await {
            Ok(t) => t,
            Err(e) => return Ok(self.fail_task(&mut task, e.to_string(), e.is_retryable())),
        };

        let sandbox = match self.sandbox.create(&task.owner, &task.repo, &token, &branch, image_type, &ctx.cancel).await {
            Ok(s) => s,
            Err(AgentError::Cancelled) => {
                self.cancel_task(&mut task);
                return Err(AgentError::Cancelled);
            }
            Err(e) => return Ok(self.fail_task(&mut task, e.to_string(), true)),
        };
        self.audit(AuditEventType::SandboxCreated, &task.id, ResultTag::Success, None);

        let run_result = self.run_steps(&mut task, &sandbox, &plan, pr_number, ctx).await;

        let outcome = match run_result {
            Ok(()) => {
                let commit_message = format!("Resolve issue #{}", task.issue_number);
                let push_result = self
                    .sandbox
                    .commit_and_push(&sandbox, &commit_message, &task.owner, &task.repo, &branch, &token, &ctx.cancel)
                    .await;
                match push_result {
                    Ok(()) => self.finalize(&mut task, pr_number, &plan).await,
                    Err(AgentError::Cancelled) => {
                        self.cancel_task(&mut task);
                        Err(AgentError::Cancelled)
                    }
                    Err(e) => Ok(self.fail_task(&mut task, e.to_string(), true)),
                }
            }
            Err(AgentError::Cancelled) => {
                self.cancel_task(&mut task);
                Err(AgentError::Cancelled)
            }
            Err(e) => Ok(self.fail_task(&mut task, e.to_string(), e.is_retryable())),
        };

        self.sandbox.cleanup(&sandbox).await;
        outcome
    }
}

impl ExecuteJobHandler {
    async fn run_steps(
        &self,
        task: &mut crate::types::AgentTask,
        sandbox: &crate::sandbox::Sandbox,
        plan: &crate::types::AgentPlan,
        pr_number: Option<u64>,
        ctx: &JobContext,
    ) -> Result<()> {
        let mut plan = plan.clone();
        for step in &mut plan.steps {
            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let request = GenerationRequest {
                task_id: task.id.clone(),
                step_title: step.title.clone(),
                step_details: step.details.clone(),
            };
            let existing = self.sandbox.read_file(sandbox, &step.id, &ctx.cancel).await.ok();
            let code = self.executor.generate_code(&request, existing.as_deref()).await?;
            self.sandbox.write_file(sandbox, &step.id, &code, &ctx.cancel).await?;

            step.done = true;
            task.plan = Some(plan.clone());
            self.task_store.save(task)?;
            self.audit(AuditEventType::StepCompleted, &task.id, ResultTag::Success, None);

            if let Some(pr_number) = pr_number {
                let body = format!("- [x] {}", step.title);
                if let Err(e) = self.progress.post_step_update(&task.owner, &task.repo, pr_number, &task.id, &body).await {
                    tracing::warn!(error = %e, "failed to post step progress update");
                } else {
                    self.audit(AuditEventType::PullRequestUpdated, &task.id, ResultTag::Success, None);
                }
            }
        }
        Ok(())
    }

    async fn finalize(&self, task: &mut crate::types::AgentTask, pr_number: Option<u64>, plan: &crate::types::AgentPlan) -> Result<JobResult> {
        if let Some(pr_number) = pr_number {
            match self.progress.finalize_pull_request(&task.owner, &task.repo, pr_number, plan).await {
                Ok(()) => self.audit(AuditEventType::PullRequestUpdated, &task.id, ResultTag::Success, None),
                Err(e) => tracing::warn!(error = %e, "failed to finalize pull request"),
            }
        }
        let now = self.clock.now();
        if let Err(e) = task.transition(AgentTaskStatus::Completed, now) {
            return Ok(self.fail_task(task, e, false));
        }
        self.task_store.save(task)?;
        self.audit(AuditEventType::TaskStatusChanged, &task.id, ResultTag::Success, None);
        Ok(JobResult::success())
    }

    /// Transitions the task to `Failed` with `last_error` set, persists it,
    /// and returns the corresponding `JobResult`. Per the failure taxonomy
    /// this always lands on `Failed`, never `Completed`.
    fn fail_task(&self, task: &mut crate::types::AgentTask, error: String, should_retry: bool) -> JobResult {
        let now = self.clock.now();
        task.last_error = Some(error.clone());
        let _ = task.transition(AgentTaskStatus::Failed, now);
        let _ = self.task_store.save(task);
        self.audit(AuditEventType::TaskStatusChanged, &task.id, ResultTag::Failure, Some(error.clone()));
        JobResult::failure(error, should_retry)
    }
}
