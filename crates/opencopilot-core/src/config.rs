//! Configuration loading for the OpenCopilot agent (`opencopilot.toml`).
//!
//! Layered load: defaults, then a TOML file (default `opencopilot.toml`,
//! override via `OPENCOPILOT_CONFIG`), then environment-variable overrides
//! (`OPENCOPILOT_LM_PLANNER_API_KEY` and siblings). Never panics on a
//! malformed file or missing value; every fallible path returns
//! `Result<_, AgentError>`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

const DEFAULT_CONFIG_FILE: &str = "opencopilot.toml";
const CONFIG_FILE_ENV: &str = "OPENCOPILOT_CONFIG";

fn default_max_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    4
}

fn default_job_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_audit_retention() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn default_queue_capacity() -> usize {
    256
}

/// LM provider selection, shared by the planner and executor roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum LmProvider {
    #[default]
    OpenAI,
    AzureOpenAI,
}

impl std::fmt::Display for LmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LmProvider::OpenAI => write!(f, "OpenAI"),
            LmProvider::AzureOpenAI => write!(f, "AzureOpenAI"),
        }
    }
}

/// Configuration for a single LM role (planner or executor).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LmRoleConfig {
    #[serde(default)]
    pub provider: LmProvider,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub azure_endpoint: Option<String>,
    #[serde(default)]
    pub azure_deployment: Option<String>,
}

impl LmRoleConfig {
    fn apply_env(&mut self, prefix: &str) {
        if let Ok(v) = std::env::var(format!("{prefix}_API_KEY")) {
            self.api_key = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}_MODEL_ID")) {
            self.model_id = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}_PROVIDER")) {
            match v.as_str() {
                "OpenAI" => self.provider = LmProvider::OpenAI,
                "AzureOpenAI" => self.provider = LmProvider::AzureOpenAI,
                other => tracing::warn!(value = %other, "unrecognized LM provider from environment, keeping prior value"),
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}_AZURE_ENDPOINT")) {
            self.azure_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{prefix}_AZURE_DEPLOYMENT")) {
            self.azure_deployment = Some(v);
        }
    }

    fn validate(&self, role: &str) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(AgentError::Config(format!("LM.{role}.ApiKey is missing")));
        }
        match self.provider {
            LmProvider::OpenAI => {}
            LmProvider::AzureOpenAI => {
                if self.azure_endpoint.as_deref().unwrap_or("").trim().is_empty() {
                    return Err(AgentError::Config(format!(
                        "LM.{role}.AzureEndpoint is required when Provider is AzureOpenAI"
                    )));
                }
                if self.azure_deployment.as_deref().unwrap_or("").trim().is_empty() {
                    return Err(AgentError::Config(format!(
                        "LM.{role}.AzureDeployment is required when Provider is AzureOpenAI"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Combined planner/executor LM configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LmConfig {
    #[serde(default)]
    pub planner: LmRoleConfig,
    #[serde(default)]
    pub executor: LmRoleConfig,
}

/// Forge (source-forge/issue-tracker) connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeConfig {
    /// Optional; improves rate limits when set.
    #[serde(default)]
    pub token: Option<String>,
}

/// Background job dispatcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundJobConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(
        default = "default_job_timeout",
        with = "humantime_serde"
    )]
    pub job_timeout: Duration,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BackgroundJobConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            job_timeout: default_job_timeout(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Audit log retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_retention", with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention: default_audit_retention(),
        }
    }
}

/// Which backing a store uses, derived from whether `database_connection`
/// was set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreConfig {
    InMemory,
    /// File-backed store rooted at this directory.
    File(PathKind),
}

/// A thin marker so `StoreConfig::File` can carry a path without requiring
/// `Eq`/`Copy` on `PathBuf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathKind;

impl StoreConfig {
    pub fn from_connection(database_connection: &Option<PathBuf>) -> (StoreConfig, Option<PathBuf>) {
        match database_connection {
            Some(dir) if !dir.as_os_str().is_empty() => (StoreConfig::File(PathKind), Some(dir.clone())),
            _ => (StoreConfig::InMemory, None),
        }
    }
}

/// The fully loaded, validated application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub lm: LmConfig,
    #[serde(default)]
    pub forge: ForgeConfig,
    /// Optional state directory. Empty/absent means all stores run
    /// in-memory; otherwise a file-backed store is rooted here.
    #[serde(default)]
    pub database_connection: Option<PathBuf>,
    #[serde(default)]
    pub background_job: BackgroundJobConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            lm: LmConfig::default(),
            forge: ForgeConfig::default(),
            database_connection: None,
            background_job: BackgroundJobConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads from `OPENCOPILOT_CONFIG`, falling back to
    /// `./opencopilot.toml`, then layers environment-variable overrides, then
    /// validates. A missing file is not an error: defaults plus environment
    /// overrides are used.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            AppConfig::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| AgentError::Config(format!("failed to parse config file {}: {e}", path.display())))
    }

    fn apply_env(&mut self) {
        self.lm.planner.apply_env("OPENCOPILOT_LM_PLANNER");
        self.lm.executor.apply_env("OPENCOPILOT_LM_EXECUTOR");
        if let Ok(v) = std::env::var("OPENCOPILOT_FORGE_TOKEN") {
            self.forge.token = Some(v);
        }
        if let Ok(v) = std::env::var("OPENCOPILOT_DATABASE_CONNECTION") {
            self.database_connection = if v.trim().is_empty() { None } else { Some(PathBuf::from(v)) };
        }
    }

    /// Validates the recognized configuration options per the error
    /// handling design: a missing API key or malformed Azure settings is
    /// fatal at startup, never retryable.
    pub fn validate(&self) -> Result<()> {
        self.lm.planner.validate("Planner")?;
        self.lm.executor.validate("Executor")?;
        if self.background_job.max_concurrency == 0 {
            return Err(AgentError::Config("BackgroundJob.MaxConcurrency must be greater than 0".into()));
        }
        if self.background_job.queue_capacity == 0 {
            return Err(AgentError::Config("BackgroundJob.queue_capacity must be greater than 0".into()));
        }
        if self.background_job.job_timeout.is_zero() {
            return Err(AgentError::Config("BackgroundJob.JobTimeout must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn store_config(&self) -> (StoreConfig, Option<PathBuf>) {
        StoreConfig::from_connection(&self.database_connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_env::with_vars;

    #[test]
    fn default_config_fails_validation_without_api_keys() {
        let config = AppConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert!(err.to_string().contains("Planner.ApiKey"));
    }

    #[test]
    fn valid_openai_config_passes() {
        let mut config = AppConfig::default();
        config.lm.planner.api_key = "sk-planner".into();
        config.lm.executor.api_key = "sk-executor".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn azure_provider_requires_endpoint_and_deployment() {
        let mut config = AppConfig::default();
        config.lm.planner.api_key = "k".into();
        config.lm.planner.provider = LmProvider::AzureOpenAI;
        config.lm.executor.api_key = "k".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("AzureEndpoint"));

        config.lm.planner.azure_endpoint = Some("https://x".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("AzureDeployment"));

        config.lm.planner.azure_deployment = Some("dep".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_vars_override_file_values() {
        with_vars(
            [
                ("OPENCOPILOT_LM_PLANNER_API_KEY", Some("from-env")),
                ("OPENCOPILOT_LM_EXECUTOR_API_KEY", Some("from-env-2")),
            ],
            || {
                let mut config = AppConfig::default();
                config.apply_env();
                assert_eq!(config.lm.planner.api_key, "from-env");
                assert_eq!(config.lm.executor.api_key, "from-env-2");
            },
        );
    }

    #[test]
    fn empty_database_connection_selects_in_memory() {
        let config = AppConfig::default();
        let (store, dir) = config.store_config();
        assert_eq!(store, StoreConfig::InMemory);
        assert!(dir.is_none());
    }

    #[test]
    fn nonempty_database_connection_selects_file_backing() {
        let mut config = AppConfig::default();
        config.database_connection = Some(PathBuf::from("/tmp/opencopilot-state"));
        let (store, dir) = config.store_config();
        assert_eq!(store, StoreConfig::File(PathKind));
        assert_eq!(dir.unwrap(), PathBuf::from("/tmp/opencopilot-state"));
    }

    #[test]
    fn malformed_toml_file_is_a_config_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opencopilot.toml");
        std::fs::write(&path, "not valid = [[[ toml").unwrap();
        let err = AppConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
