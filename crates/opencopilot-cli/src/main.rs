mod adapters;
mod reporter;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{CommandFactory, Parser, Subcommand};

use opencopilot_audit::{FileAuditStore, InMemoryAuditStore};
use opencopilot_core::clock::{Clock, SystemClock};
use opencopilot_core::config::{AppConfig, StoreConfig};
use opencopilot_core::dispatcher::{DispatcherConfig, DispatcherHandle, Enqueuer, JobDispatcher, JobHandler};
use opencopilot_core::error::Result as AgentResult;
use opencopilot_core::handlers::{ExecuteJobHandler, PlanJobHandler};
use opencopilot_core::job_status_store::{FileJobStatusStore, InMemoryJobStatusStore, JobStatusStore};
use opencopilot_core::progress::{FileCommentIdStore, InMemoryCommentIdStore, ProgressReporter};
use opencopilot_core::sandbox::{SandboxConfig, SandboxManager};
use opencopilot_core::task_store::{FileTaskStore, InMemoryTaskStore, TaskStore};
use opencopilot_core::types::{BackgroundJob, JobType};

use adapters::{UnconfiguredExecutor, UnconfiguredForge, UnconfiguredPlanner, UnconfiguredRepoAnalyzer};
use reporter::{CliReporter, Reporter};

/// Build tools C2 probes for inside a sandbox, surfaced by `doctor` without
/// creating one.
const SANDBOX_BUILD_TOOLS: [&str; 6] = ["dotnet", "npm", "gradle", "mvn", "go", "cargo"];

#[derive(Parser, Debug)]
#[command(name = "opencopilot", version, about = "Issue-to-pull-request agent orchestration core")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load config, wire the dispatcher and handlers, and run until shutdown.
    Serve,
    /// Print the status of a background job from the configured Job Status Store.
    Status {
        job_id: String,
    },
    /// Validate configuration and report which build tools are available, without creating a sandbox.
    Doctor,
    /// Print a shell completion script for the given shell.
    Completions {
        shell: clap_complete::Shell,
    },
}

/// An [`Enqueuer`] that forwards to a [`DispatcherHandle`] set after the
/// dispatcher it wraps is constructed. Needed because the handlers passed
/// into [`JobDispatcher::new`] must exist before the `Arc<JobDispatcher>`
/// they enqueue follow-on jobs through does.
struct DeferredEnqueuer(OnceLock<DispatcherHandle>);

impl DeferredEnqueuer {
    fn new() -> Self {
        Self(OnceLock::new())
    }

    fn bind(&self, handle: DispatcherHandle) {
        let _ = self.0.set(handle);
    }
}

#[async_trait]
impl Enqueuer for DeferredEnqueuer {
    async fn enqueue(&self, job: BackgroundJob) -> bool {
        match self.0.get() {
            Some(handle) => handle.enqueue(job).await,
            None => false,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut reporter = CliReporter;

    match cli.cmd {
        Commands::Serve => {
            let config = AppConfig::load().context("loading configuration")?;
            let rt = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
            rt.block_on(run_serve(config, &mut reporter))
        }
        Commands::Status { job_id } => {
            let config = AppConfig::load().context("loading configuration")?;
            run_status(&config, &job_id)
        }
        Commands::Doctor => {
            let config = AppConfig::load();
            run_doctor(config, &mut reporter)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

fn open_task_store(store: StoreConfig, dir: &Option<PathBuf>) -> AgentResult<Arc<dyn TaskStore>> {
    Ok(match store {
        StoreConfig::InMemory => Arc::new(InMemoryTaskStore::new()),
        StoreConfig::File(_) => {
            let dir = dir.as_ref().expect("File store config always carries a directory");
            Arc::new(FileTaskStore::open(dir)?)
        }
    })
}

fn open_job_status_store(store: StoreConfig, dir: &Option<PathBuf>) -> AgentResult<Arc<dyn JobStatusStore>> {
    Ok(match store {
        StoreConfig::InMemory => Arc::new(InMemoryJobStatusStore::new()),
        StoreConfig::File(_) => {
            let dir = dir.as_ref().expect("File store config always carries a directory");
            Arc::new(FileJobStatusStore::open(dir)?)
        }
    })
}

fn open_comment_id_store(
    store: StoreConfig,
    dir: &Option<PathBuf>,
) -> AgentResult<Arc<dyn opencopilot_core::progress::CommentIdStore>> {
    Ok(match store {
        StoreConfig::InMemory => Arc::new(InMemoryCommentIdStore::new()),
        StoreConfig::File(_) => {
            let dir = dir.as_ref().expect("File store config always carries a directory");
            Arc::new(FileCommentIdStore::open(dir)?)
        }
    })
}

fn open_audit_store(store: StoreConfig, dir: &Option<PathBuf>) -> AgentResult<Arc<dyn opencopilot_audit::AuditStore>> {
    Ok(match store {
        StoreConfig::InMemory => Arc::new(InMemoryAuditStore::new()),
        StoreConfig::File(_) => {
            let dir = dir.as_ref().expect("File store config always carries a directory");
            Arc::new(FileAuditStore::open(dir)?)
        }
    })
}

async fn run_serve(config: AppConfig, reporter: &mut dyn Reporter) -> Result<()> {
    let (store_kind, store_dir) = config.store_config();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let task_store = open_task_store(store_kind, &store_dir)?;
    let job_status_store = open_job_status_store(store_kind, &store_dir)?;
    let comment_store = open_comment_id_store(store_kind, &store_dir)?;
    let audit_store = open_audit_store(store_kind, &store_dir)?;

    let sandbox = Arc::new(SandboxManager::new(SandboxConfig::default()));
    let forge: Arc<dyn opencopilot_core::forge::Forge> = Arc::new(UnconfiguredForge);
    let planner: Arc<dyn opencopilot_core::lm::Planner> = Arc::new(UnconfiguredPlanner);
    let executor: Arc<dyn opencopilot_core::lm::Executor> = Arc::new(UnconfiguredExecutor);
    let repo_analyzer: Arc<dyn opencopilot_core::handlers::plan::RepoAnalyzer> = Arc::new(UnconfiguredRepoAnalyzer);
    let progress = Arc::new(ProgressReporter::new(forge.clone(), comment_store));

    let enqueuer = Arc::new(DeferredEnqueuer::new());

    let mut handlers: HashMap<JobType, Arc<dyn JobHandler>> = HashMap::new();
    handlers.insert(
        JobType::Plan,
        Arc::new(PlanJobHandler::new(
            forge.clone(),
            planner,
            repo_analyzer,
            task_store.clone(),
            progress.clone(),
            enqueuer.clone(),
            clock.clone(),
            audit_store.clone(),
        )),
    );
    handlers.insert(
        JobType::Execute,
        Arc::new(ExecuteJobHandler::new(forge, executor, sandbox, task_store, progress, clock.clone(), audit_store.clone())),
    );

    let dispatcher_config = DispatcherConfig {
        max_concurrency: config.background_job.max_concurrency,
        max_retries: config.background_job.max_retries,
        queue_capacity: config.background_job.queue_capacity,
    };
    let dispatcher = JobDispatcher::new(dispatcher_config, clock, job_status_store, audit_store, handlers);
    enqueuer.bind(dispatcher.handle());

    let workers = dispatcher.spawn_workers();
    reporter.info(&format!(
        "serving with {} worker(s); waiting for shutdown signal",
        config.background_job.max_concurrency
    ));

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    reporter.info("shutdown signal received, draining workers");
    dispatcher.shutdown();
    for w in workers {
        let _ = w.await;
    }
    Ok(())
}

fn run_status(config: &AppConfig, job_id: &str) -> Result<()> {
    let (store_kind, store_dir) = config.store_config();
    let job_status_store = open_job_status_store(store_kind, &store_dir)?;
    match job_status_store.get(job_id)? {
        Some(info) => {
            println!("job_id:        {}", info.job_id);
            println!("job_type:      {}", info.job_type);
            println!("status:        {:?}", info.status);
            println!("created_at:    {}", info.created_at);
            println!(
                "started_at:    {}",
                info.started_at.map(|t| t.to_string()).unwrap_or_else(|| "-".into())
            );
            println!(
                "completed_at:  {}",
                info.completed_at.map(|t| t.to_string()).unwrap_or_else(|| "-".into())
            );
            println!("attempt_count: {}", info.attempt_count);
            if let Some(err) = &info.last_error {
                println!("last_error:    {err}");
            }
        }
        None => {
            println!("no job found with id {job_id}");
        }
    }
    Ok(())
}

fn run_doctor(config: Result<AppConfig, opencopilot_core::error::AgentError>, reporter: &mut dyn Reporter) -> Result<()> {
    match config {
        Ok(config) => {
            reporter.info("configuration is valid");
            println!("max_concurrency: {}", config.background_job.max_concurrency);
            println!("max_retries:     {}", config.background_job.max_retries);
            println!("job_timeout:     {}", humantime::format_duration(config.background_job.job_timeout));
            println!("audit_retention: {}", humantime::format_duration(config.audit.retention));
            let retry = opencopilot_retry::RetryPolicy::AgentDefault.to_config();
            println!(
                "retry_policy:    base={} max={} jitter={:.0}%",
                humantime::format_duration(retry.base_delay),
                humantime::format_duration(retry.max_delay),
                retry.jitter * 100.0
            );
            let (store_kind, store_dir) = config.store_config();
            match (store_kind, store_dir) {
                (StoreConfig::InMemory, _) => println!("store:           in-memory"),
                (StoreConfig::File(_), Some(dir)) => println!("store:           file-backed at {}", dir.display()),
                (StoreConfig::File(_), None) => unreachable!("File store config always carries a directory"),
            }
        }
        Err(e) => {
            reporter.error(&format!("configuration is invalid: {e}"));
        }
    }

    println!();
    print_cmd_version("git", reporter);
    print_cmd_version("docker", reporter);
    for tool in SANDBOX_BUILD_TOOLS {
        print_cmd_version(tool, reporter);
    }

    Ok(())
}

fn print_cmd_version(cmd: &str, reporter: &mut dyn Reporter) {
    let out = Command::new(cmd).arg("--version").output();
    match out {
        Ok(o) if o.status.success() => {
            let s = String::from_utf8_lossy(&o.stdout).trim().to_string();
            println!("{cmd}: {s}");
        }
        Ok(o) => {
            reporter.warn(&format!("{cmd} --version failed: {}", String::from_utf8_lossy(&o.stderr).trim()));
        }
        Err(e) => {
            reporter.warn(&format!("unable to run {cmd} --version: {e}"));
        }
    }
}
