//! The Sandbox Manager (C2): a thin, CLI-driven containerization
//! abstraction over whatever driver program (`docker` by default) C1 is
//! told to invoke. This is not a client of any container engine's API; it
//! only ever shells out via [`crate::process`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result, SandboxOp};
use crate::process::{run_command, run_command_checked};
use crate::types::ImageType;

const WORKSPACE_ROOT: &str = "/workspace";

/// Build tools C2 probes for inside a freshly created container. Availability
/// is recorded for observability only; a missing tool never fails `create`.
const BUILD_TOOLS: [&str; 6] = ["dotnet", "npm", "gradle", "mvn", "go", "cargo"];

/// Normalizes and jails a user-supplied relative path under
/// `/workspace`: backslashes become forward slashes, a leading slash is
/// stripped, and `.`/`..` components are resolved lexically. Any result
/// that would land outside `/workspace` is rejected.
pub fn jail_path(relative: &str) -> Result<String> {
    let normalized = relative.replace('\\', "/");
    let trimmed = normalized.trim();
    if trimmed.is_empty() {
        return Err(AgentError::PathEscape { path: relative.to_string() });
    }
    let trimmed = trimmed.trim_start_matches('/');

    let mut stack: Vec<&str> = Vec::new();
    for component in trimmed.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if stack.pop().is_none() {
                    return Err(AgentError::PathEscape { path: relative.to_string() });
                }
            }
            other => stack.push(other),
        }
    }

    if stack.is_empty() {
        return Ok(WORKSPACE_ROOT.to_string());
    }
    Ok(format!("{WORKSPACE_ROOT}/{}", stack.join("/")))
}

/// Shell-quotes a string for embedding as a single POSIX argument: wraps it
/// in single quotes and escapes any embedded `'` as `'\''`, so the argument
/// round-trips byte-for-byte inside the sandbox shell regardless of its
/// content.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Configuration for a [`SandboxManager`]: which CLI driver program to
/// invoke and how long operations may run before being treated as failed.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub driver_program: String,
    pub op_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            driver_program: "docker".to_string(),
            op_timeout: Duration::from_secs(120),
        }
    }
}

/// A running container created by [`SandboxManager::create`]. Exclusively
/// owned by whichever handler created it for its lifetime.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub container_id: String,
    pub image: ImageType,
    /// Availability of each probed build tool, recorded at creation time.
    /// Never consulted to fail `create`; purely observability.
    pub available_tools: HashMap<String, bool>,
}

/// The CLI-driven container abstraction. Holds no container state itself;
/// every operation re-derives its command from the given `Sandbox`.
pub struct SandboxManager {
    config: SandboxConfig,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Starts a detached container from the image mapped to `image_type`,
    /// ensures git is present, and clones `owner/repo` at `branch` using a
    /// token-embedded URL. Tears the container down before propagating any
    /// failure that occurs after it comes up.
    pub async fn create(
        &self,
        owner: &str,
        repo: &str,
        token: &str,
        branch: &str,
        image_type: ImageType,
        cancel: &CancellationToken,
    ) -> Result<Sandbox> {
        let image = image_type.image_ref();
        let output = run_command_checked(
            &self.config.driver_program,
            &["run", "-d", "--rm", image, "sleep", "infinity"],
            Path::new("."),
            Some(self.config.op_timeout),
            cancel,
        )
        .await
        .map_err(|e| to_sandbox_error(SandboxOp::Create, e))?;

        let container_id = output.stdout.trim().to_string();
        if container_id.is_empty() {
            return Err(AgentError::SandboxFailure {
                op: SandboxOp::Create,
                message: "driver returned an empty container id".to_string(),
            });
        }
        let mut sandbox = Sandbox { container_id, image: image_type, available_tools: HashMap::new() };

        if let Err(err) = self.provision(&mut sandbox, owner, repo, token, branch, cancel).await {
            self.cleanup(&sandbox).await;
            return Err(err);
        }
        Ok(sandbox)
    }

    async fn provision(
        &self,
        sandbox: &mut Sandbox,
        owner: &str,
        repo: &str,
        token: &str,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_git(&sandbox.container_id, cancel).await?;
        sandbox.available_tools = self.probe_build_tools(&sandbox.container_id, cancel).await;
        let clone_url = format!("https://{token}@github.com/{owner}/{repo}");
        let clone_cmd = format!(
            "git clone --branch {} {} {}",
            shell_quote(branch),
            shell_quote(&clone_url),
            shell_quote(WORKSPACE_ROOT),
        );
        let output = self
            .execute(sandbox, ".", &clone_cmd, cancel)
            .await
            .map_err(|e| to_sandbox_error(SandboxOp::Clone, e))?;
        if !output.success() {
            return Err(AgentError::SandboxFailure { op: SandboxOp::Clone, message: output.stderr });
        }
        Ok(())
    }

    /// Ensures `git` is available inside the container, installing it only
    /// when `which git` reports nonzero.
    async fn ensure_git(&self, container_id: &str, cancel: &CancellationToken) -> Result<()> {
        let probe = run_command(
            &self.config.driver_program,
            &["exec", container_id, "which", "git"],
            Path::new("."),
            Some(self.config.op_timeout),
            cancel,
        )
        .await
        .map_err(|e| to_sandbox_error(SandboxOp::Exec, e))?;

        if probe.success() {
            return Ok(());
        }

        run_command_checked(
            &self.config.driver_program,
            &["exec", container_id, "apt-get", "update"],
            Path::new("."),
            Some(self.config.op_timeout),
            cancel,
        )
        .await
        .map_err(|e| to_sandbox_error(SandboxOp::Exec, e))?;

        run_command_checked(
            &self.config.driver_program,
            &["exec", container_id, "apt-get", "install", "-y", "git"],
            Path::new("."),
            Some(self.config.op_timeout),
            cancel,
        )
        .await
        .map_err(|e| to_sandbox_error(SandboxOp::Exec, e))?;

        Ok(())
    }

    /// Probes each tool in [`BUILD_TOOLS`] via `which`, recording whether it
    /// is present. Never fails: a probe that errors (cancellation aside) is
    /// simply recorded as unavailable.
    async fn probe_build_tools(&self, container_id: &str, cancel: &CancellationToken) -> HashMap<String, bool> {
        let mut available = HashMap::new();
        for tool in BUILD_TOOLS {
            let probe = run_command(
                &self.config.driver_program,
                &["exec", container_id, "which", tool],
                Path::new("."),
                Some(self.config.op_timeout),
                cancel,
            )
            .await;
            let present = matches!(probe, Ok(output) if output.success());
            available.insert(tool.to_string(), present);
        }
        available
    }

    /// Executes an arbitrary shell command inside the sandbox, with its
    /// working directory set to `cwd` (jailed under `/workspace`).
    pub async fn execute(
        &self,
        sandbox: &Sandbox,
        cwd: &str,
        shell_command: &str,
        cancel: &CancellationToken,
    ) -> Result<crate::process::CommandOutput> {
        let jailed = jail_path(cwd)?;
        let script = format!("cd {} && {shell_command}", shell_quote(&jailed));
        run_command(
            &self.config.driver_program,
            &["exec", &sandbox.container_id, "sh", "-c", &script],
            Path::new("."),
            Some(self.config.op_timeout),
            cancel,
        )
        .await
        .map_err(|e| to_sandbox_error(SandboxOp::Exec, e))
    }

    pub async fn read_file(&self, sandbox: &Sandbox, path: &str, cancel: &CancellationToken) -> Result<String> {
        let jailed = jail_path(path)?;
        let output = run_command_checked(
            &self.config.driver_program,
            &["exec", &sandbox.container_id, "cat", &jailed],
            Path::new("."),
            Some(self.config.op_timeout),
            cancel,
        )
        .await
        .map_err(|e| to_sandbox_error(SandboxOp::Exec, e))?;
        Ok(output.stdout)
    }

    /// Writes `content` to `path`. Content is embedded as a single quoted
    /// shell argument (`shell_quote`), so any metacharacter in it —
    /// including an embedded `'` — is reproduced byte-for-byte instead of
    /// being interpreted by the sandbox's shell.
    pub async fn write_file(
        &self,
        sandbox: &Sandbox,
        path: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let jailed = jail_path(path)?;
        let script = format!(
            "mkdir -p $(dirname {}) && printf '%s' {} > {}",
            shell_quote(&jailed),
            shell_quote(content),
            shell_quote(&jailed),
        );
        run_command_checked(
            &self.config.driver_program,
            &["exec", &sandbox.container_id, "sh", "-c", &script],
            Path::new("."),
            Some(self.config.op_timeout),
            cancel,
        )
        .await
        .map_err(|e| to_sandbox_error(SandboxOp::Exec, e))?;
        Ok(())
    }

    pub async fn create_directory(&self, sandbox: &Sandbox, path: &str, cancel: &CancellationToken) -> Result<()> {
        let jailed = jail_path(path)?;
        run_command_checked(
            &self.config.driver_program,
            &["exec", &sandbox.container_id, "mkdir", "-p", &jailed],
            Path::new("."),
            Some(self.config.op_timeout),
            cancel,
        )
        .await
        .map_err(|e| to_sandbox_error(SandboxOp::Exec, e))?;
        Ok(())
    }

    pub async fn directory_exists(&self, sandbox: &Sandbox, path: &str, cancel: &CancellationToken) -> Result<bool> {
        let jailed = jail_path(path)?;
        let output = run_command(
            &self.config.driver_program,
            &["exec", &sandbox.container_id, "test", "-d", &jailed],
            Path::new("."),
            Some(self.config.op_timeout),
            cancel,
        )
        .await
        .map_err(|e| to_sandbox_error(SandboxOp::Exec, e))?;
        Ok(output.success())
    }

    pub async fn list_contents(&self, sandbox: &Sandbox, path: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        let jailed = jail_path(path)?;
        let output = run_command_checked(
            &self.config.driver_program,
            &["exec", &sandbox.container_id, "ls", "-1", &jailed],
            Path::new("."),
            Some(self.config.op_timeout),
            cancel,
        )
        .await
        .map_err(|e| to_sandbox_error(SandboxOp::Exec, e))?;
        Ok(output.stdout.lines().map(str::to_string).collect())
    }

    pub async fn copy(&self, sandbox: &Sandbox, from: &str, to: &str, cancel: &CancellationToken) -> Result<()> {
        let from_j = jail_path(from)?;
        let to_j = jail_path(to)?;
        run_command_checked(
            &self.config.driver_program,
            &["exec", &sandbox.container_id, "cp", "-r", &from_j, &to_j],
            Path::new("."),
            Some(self.config.op_timeout),
            cancel,
        )
        .await
        .map_err(|e| to_sandbox_error(SandboxOp::Exec, e))?;
        Ok(())
    }

    pub async fn move_path(&self, sandbox: &Sandbox, from: &str, to: &str, cancel: &CancellationToken) -> Result<()> {
        let from_j = jail_path(from)?;
        let to_j = jail_path(to)?;
        run_command_checked(
            &self.config.driver_program,
            &["exec", &sandbox.container_id, "mv", &from_j, &to_j],
            Path::new("."),
            Some(self.config.op_timeout),
            cancel,
        )
        .await
        .map_err(|e| to_sandbox_error(SandboxOp::Exec, e))?;
        Ok(())
    }

    pub async fn delete(&self, sandbox: &Sandbox, path: &str, cancel: &CancellationToken) -> Result<()> {
        let jailed = jail_path(path)?;
        run_command_checked(
            &self.config.driver_program,
            &["exec", &sandbox.container_id, "rm", "-rf", &jailed],
            Path::new("."),
            Some(self.config.op_timeout),
            cancel,
        )
        .await
        .map_err(|e| to_sandbox_error(SandboxOp::Exec, e))?;
        Ok(())
    }

    /// Configures a bot commit identity, rewrites `origin` to embed `token`,
    /// and commits+pushes `HEAD:branch` if (and only if) `git status
    /// --porcelain` reports changes — a clean tree is a no-op, issuing
    /// neither command. Commit failure and push failure are distinct error
    /// kinds, per the failure taxonomy.
    #[allow(clippy::too_many_arguments)]
    pub async fn commit_and_push(
        &self,
        sandbox: &Sandbox,
        message: &str,
        owner: &str,
        repo: &str,
        branch: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let identity_cmd = "git config user.name 'RG.OpenCopilot[bot]' && git config user.email 'rg-opencopilot-bot@users.noreply.github.com'";
        self.execute(sandbox, ".", identity_cmd, cancel)
            .await
            .map_err(|e| to_sandbox_error(SandboxOp::Commit, e))?;

        let origin_url = format!("https://{token}@github.com/{owner}/{repo}");
        let origin_cmd = format!("git remote set-url origin {}", shell_quote(&origin_url));
        self.execute(sandbox, ".", &origin_cmd, cancel)
            .await
            .map_err(|e| to_sandbox_error(SandboxOp::Commit, e))?;

        let status = self
            .execute(sandbox, ".", "git status --porcelain", cancel)
            .await
            .map_err(|e| to_sandbox_error(SandboxOp::Commit, e))?;
        if status.stdout.trim().is_empty() {
            return Ok(());
        }

        let add = self
            .execute(sandbox, ".", "git add -A", cancel)
            .await
            .map_err(|e| to_sandbox_error(SandboxOp::Commit, e))?;
        if !add.success() {
            return Err(AgentError::SandboxFailure { op: SandboxOp::Commit, message: add.stderr });
        }

        let commit_cmd = format!("git commit -m {}", shell_quote(message));
        let commit = self
            .execute(sandbox, ".", &commit_cmd, cancel)
            .await
            .map_err(|e| to_sandbox_error(SandboxOp::Commit, e))?;
        if !commit.success() {
            return Err(AgentError::SandboxFailure { op: SandboxOp::Commit, message: commit.stderr });
        }

        let push_cmd = format!("git push origin HEAD:{}", shell_quote(branch));
        let push = self
            .execute(sandbox, ".", &push_cmd, cancel)
            .await
            .map_err(|e| to_sandbox_error(SandboxOp::Push, e))?;
        if !push.success() {
            return Err(AgentError::SandboxFailure { op: SandboxOp::Push, message: push.stderr });
        }
        Ok(())
    }

    /// Stops and removes the container. Runs under its own short-lived
    /// context so that a cancelled job's cleanup still completes; failure
    /// here is logged, never surfaced as job failure (§4.10).
    pub async fn cleanup(&self, sandbox: &Sandbox) {
        let detached = CancellationToken::new();
        let result = run_command_checked(
            &self.config.driver_program,
            &["rm", "-f", &sandbox.container_id],
            Path::new("."),
            Some(Duration::from_secs(30)),
            &detached,
        )
        .await;
        if let Err(err) = result {
            tracing::warn!(container_id = %sandbox.container_id, error = %err, "sandbox cleanup failed");
        }
    }
}

fn to_sandbox_error(op: SandboxOp, err: AgentError) -> AgentError {
    match err {
        AgentError::Cancelled | AgentError::PathEscape { .. } => err,
        other => AgentError::SandboxFailure { op, message: other.to_string() },
    }
}
