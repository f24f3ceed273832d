//! The Command Runner (C1): spawns a program, captures output, and honors a
//! timeout and a cooperative cancellation signal. Holds no per-process
//! state, so a single instance can be shared by every sandbox operation.

use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }
}

/// Runs `program args...` in `working_dir`, racing completion against
/// `timeout` and `cancel`. A tripped `cancel` kills the child and returns
/// `Ok` with `cancelled: true` rather than an error, so callers can fold it
/// into `AgentError::Cancelled` at the point that matters to them.
pub async fn run_command(
    program: &str,
    args: &[&str],
    working_dir: &std::path::Path,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let wait_fut = child.wait();
    let timeout_fut = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        status = wait_fut => {
            let status = status?;
            let (stdout, stderr) = read_pipes(stdout_pipe.take(), stderr_pipe.take()).await;
            Ok(CommandOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
                timed_out: false,
                cancelled: false,
                duration: start.elapsed(),
            })
        }
        _ = timeout_fut => {
            let _ = child.kill().await;
            let (stdout, mut stderr) = read_pipes(stdout_pipe.take(), stderr_pipe.take()).await;
            if let Some(d) = timeout {
                stderr.push_str(&format!("\ncommand timed out after {}", humantime::format_duration(d)));
            }
            Ok(CommandOutput {
                exit_code: -1,
                stdout,
                stderr,
                timed_out: true,
                cancelled: false,
                duration: start.elapsed(),
            })
        }
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            let (stdout, stderr) = read_pipes(stdout_pipe.take(), stderr_pipe.take()).await;
            Ok(CommandOutput {
                exit_code: -1,
                stdout,
                stderr,
                timed_out: false,
                cancelled: true,
                duration: start.elapsed(),
            })
        }
    }
}

/// Convenience wrapper for callers that want a hard error instead of an
/// exit-code inspection; maps a non-zero or cancelled outcome to
/// `AgentError::Cancelled` or `AgentError::Transient`.
pub async fn run_command_checked(
    program: &str,
    args: &[&str],
    working_dir: &std::path::Path,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    let output = run_command(program, args, working_dir, timeout, cancel).await?;
    if output.cancelled {
        return Err(AgentError::Cancelled);
    }
    if !output.success() {
        return Err(AgentError::Transient(format!(
            "`{program}` exited {} (timed_out={}): {}",
            output.exit_code, output.timed_out, output.stderr
        )));
    }
    Ok(output)
}

async fn read_pipes(
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
) -> (String, String) {
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = stdout {
        let _ = out.read_to_end(&mut stdout_bytes).await;
    }
    if let Some(mut err) = stderr {
        let _ = err.read_to_end(&mut stderr_bytes).await;
    }
    (
        String::from_utf8_lossy(&stdout_bytes).to_string(),
        String::from_utf8_lossy(&stderr_bytes).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let cancel = CancellationToken::new();
        let output = run_command("echo", &["hello"], std::path::Path::new("."), None, &cancel)
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("hello"));
        assert!(output.success());
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let cancel = CancellationToken::new();
        let output = run_command("false", &[], std::path::Path::new("."), None, &cancel)
            .await
            .unwrap();
        assert!(!output.success());
    }

    #[tokio::test]
    async fn cancellation_short_circuits_a_long_command() {
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.cancel();
        });
        let output = run_command("sleep", &["5"], std::path::Path::new("."), None, &cancel)
            .await
            .unwrap();
        assert!(output.cancelled);
    }

    #[tokio::test]
    async fn timeout_marks_output_timed_out() {
        let cancel = CancellationToken::new();
        let output = run_command(
            "sleep",
            &["5"],
            std::path::Path::new("."),
            Some(Duration::from_millis(20)),
            &cancel,
        )
        .await
        .unwrap();
        assert!(output.timed_out);
    }

    #[tokio::test]
    async fn run_command_checked_maps_failure_to_transient() {
        let cancel = CancellationToken::new();
        let err = run_command_checked("false", &[], std::path::Path::new("."), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Transient(_)));
    }
}
