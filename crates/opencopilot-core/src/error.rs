//! Named error kinds shared by every component in this crate.

use thiserror::Error;

/// A sandbox operation that failed, used by [`AgentError::SandboxFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxOp {
    Create,
    Exec,
    Clone,
    Commit,
    Push,
    Cleanup,
}

impl std::fmt::Display for SandboxOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxOp::Create => "create",
            SandboxOp::Exec => "exec",
            SandboxOp::Clone => "clone",
            SandboxOp::Commit => "commit",
            SandboxOp::Push => "push",
            SandboxOp::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// The error kinds named in the error handling design. Every public
/// fallible operation in this crate returns `Result<T, AgentError>`.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("sandbox {op} failed: {message}")]
    SandboxFailure { op: SandboxOp, message: String },

    #[error("{path} is outside the workspace directory")]
    PathEscape { path: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("argument {name} is out of range: {value}")]
    ArgumentOutOfRange { name: String, value: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether the job-level retry policy should re-enqueue a job that
    /// failed with this error. `Cancelled` is handled separately by the
    /// dispatcher and never reaches this method in practice.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::InvalidPayload(_) => true,
            AgentError::NotFound(_) => false,
            AgentError::Transient(_) => true,
            AgentError::SandboxFailure { op, .. } => !matches!(op, SandboxOp::Cleanup),
            AgentError::PathEscape { .. } => false,
            AgentError::Cancelled => false,
            AgentError::Config(_) => false,
            AgentError::ArgumentOutOfRange { .. } => false,
            AgentError::Io(_) => true,
            AgentError::Serialization(_) => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
