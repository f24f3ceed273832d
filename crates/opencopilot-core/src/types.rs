//! Domain types: agent tasks, plans, background jobs, and job results.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Container base image selection for the Execute handler's sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ImageType {
    #[default]
    DotNet,
    JavaScript,
    Java,
    Go,
    Rust,
}

impl ImageType {
    /// The exact image reference for each recognized variant (§4.2).
    pub fn image_ref(&self) -> &'static str {
        match self {
            ImageType::DotNet => "mcr.microsoft.com/dotnet/sdk:10.0",
            ImageType::JavaScript => "node:20-bookworm",
            ImageType::Java => "eclipse-temurin:21-jdk",
            ImageType::Go => "golang:1.22-bookworm",
            ImageType::Rust => "rust:1-bookworm",
        }
    }

    /// Parses an image type name as supplied by a plan's `image_hint`
    /// (itself derived from repository analysis). Case-insensitive over
    /// the recognized set; anything else is the one untrusted boundary
    /// where an unrecognized selection surfaces as `ArgumentOutOfRange`
    /// rather than silently falling back to the default.
    pub fn parse(value: &str) -> crate::error::Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "dotnet" => Ok(ImageType::DotNet),
            "javascript" | "js" | "node" => Ok(ImageType::JavaScript),
            "java" => Ok(ImageType::Java),
            "go" | "golang" => Ok(ImageType::Go),
            "rust" => Ok(ImageType::Rust),
            _ => Err(crate::error::AgentError::ArgumentOutOfRange {
                name: "imageType".to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// Lifecycle status of an [`AgentTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTaskStatus {
    PendingPlanning,
    Planning,
    Planned,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl AgentTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentTaskStatus::Completed | AgentTaskStatus::Failed | AgentTaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition: forward progression
    /// through the happy path, any non-terminal state may move to
    /// `Cancelled`, and any non-terminal state may move to `Failed`. A task
    /// never regresses to an earlier status, and terminal states are final.
    pub fn can_transition_to(&self, next: AgentTaskStatus) -> bool {
        use AgentTaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (PendingPlanning, Planning) | (Planning, Planned) | (Planned, Executing) | (Executing, Completed)
        )
    }
}

/// A single step of an [`AgentPlan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub title: String,
    pub details: String,
    pub done: bool,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, title: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            details: details.into(),
            done: false,
        }
    }
}

/// The plan produced by the LM planner for one [`AgentTask`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPlan {
    pub problem_summary: String,
    pub steps: Vec<PlanStep>,
    pub checklist: Vec<String>,
    pub constraints: Vec<String>,
    /// Optional base-image selection, named by the planner from repository
    /// analysis (e.g. `"rust"`, `"javascript"`). Resolved by [`ImageType::parse`]
    /// at sandbox creation; absent means the default applies.
    #[serde(default)]
    pub image_hint: Option<String>,
}

impl AgentPlan {
    /// Enforces the step-id-uniqueness invariant; called when a plan is
    /// assigned to a task.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(format!("duplicate plan step id: {}", step.id));
            }
        }
        Ok(())
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.problem_summary);
        out.push_str("\n\n## Plan\n\n");
        for step in &self.steps {
            let mark = if step.done { "x" } else { " " };
            out.push_str(&format!("- [{mark}] {}\n", step.title));
        }
        if !self.checklist.is_empty() {
            out.push_str("\n## Checklist\n\n");
            for item in &self.checklist {
                out.push_str(&format!("- {item}\n"));
            }
        }
        out
    }
}

/// One unit of work scoped to a single repository issue. Identity is
/// `"{owner}/{repo}/issues/{issue}"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub owner: String,
    pub repo: String,
    pub issue_number: u64,
    pub installation_id: u64,
    pub status: AgentTaskStatus,
    /// The working branch created for this task by the Plan handler.
    pub branch: Option<String>,
    pub pr_number: Option<u64>,
    pub plan: Option<AgentPlan>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AgentTask {
    pub fn task_id(owner: &str, repo: &str, issue_number: u64) -> String {
        format!("{owner}/{repo}/issues/{issue_number}")
    }

    pub fn new(owner: String, repo: String, issue_number: u64, installation_id: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: Self::task_id(&owner, &repo, issue_number),
            owner,
            repo,
            issue_number,
            installation_id,
            status: AgentTaskStatus::PendingPlanning,
            branch: None,
            pr_number: None,
            plan: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_error: None,
        }
    }

    /// Applies a status transition, enforcing the legality rules above.
    pub fn transition(&mut self, next: AgentTaskStatus, now: DateTime<Utc>) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!("illegal task transition: {:?} -> {:?}", self.status, next));
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}

/// Status of a [`BackgroundJob`] as tracked by the Job Status Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// The type tag of a [`BackgroundJob`], used for fingerprinting and
/// dispatch to the right handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Plan,
    Execute,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Plan => write!(f, "plan"),
            JobType::Execute => write!(f, "execute"),
        }
    }
}

/// An immutable unit of admitted work. Immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub max_retries: u32,
    #[serde(default)]
    pub priority: i32,
}

impl BackgroundJob {
    pub fn new(job_type: JobType, payload: serde_json::Value, max_retries: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type,
            payload,
            metadata: HashMap::new(),
            max_retries,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Observability record tracked by the Job Status Store. Status writes are
/// advisory; job correctness never depends on their durability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundJobStatusInfo {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub result_data: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl BackgroundJobStatusInfo {
    pub fn queued(job: &BackgroundJob, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            completed_at: None,
            attempt_count: 0,
            last_error: None,
            result_data: None,
            metadata: job.metadata.clone(),
        }
    }
}

/// The value a job handler returns; only `AgentError::Cancelled` propagates
/// by unwinding, everything else is a return value here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub error: Option<String>,
    pub should_retry: bool,
    pub result_data: Option<serde_json::Value>,
}

impl JobResult {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
            should_retry: false,
            result_data: None,
        }
    }

    pub fn success_with_data(data: serde_json::Value) -> Self {
        Self {
            success: true,
            error: None,
            should_retry: false,
            result_data: Some(data),
        }
    }

    pub fn failure(error: impl Into<String>, should_retry: bool) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            should_retry,
            result_data: None,
        }
    }
}
