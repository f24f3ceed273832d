//! Append-only audit log for agent task and job lifecycle events.
//!
//! This crate provides a small `AuditStore` trait with two implementations:
//! an in-memory store for tests and single-process runs, and a file-backed
//! store that persists entries as JSON Lines so they survive a restart.
//!
//! # Example
//!
//! ```
//! use opencopilot_audit::{AuditLog, AuditEventType, AuditQuery, AuditStore, InMemoryAuditStore, ResultTag};
//! use chrono::Utc;
//!
//! let store = InMemoryAuditStore::new();
//! store.store(AuditLog::new(
//!     AuditEventType::WebhookReceived,
//!     Utc::now(),
//!     "corr-1",
//!     "webhook",
//!     "o/r/issues/1",
//! )).unwrap();
//!
//! let found = store.query(&AuditQuery::default()).unwrap();
//! assert_eq!(found.len(), 1);
//! ```

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const AUDIT_LOG_FILE: &str = "audit.jsonl";

/// Default result of an audit query when no limit is given.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Hard cap on the number of entries any single query may return.
pub const MAX_QUERY_LIMIT: usize = 1000;

pub fn audit_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join(AUDIT_LOG_FILE)
}

/// Kind of event an audit entry records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    WebhookReceived,
    PlanGeneration,
    TaskStatusChanged,
    JobDispatched,
    JobDeduped,
    JobRetried,
    JobCancelled,
    StepCompleted,
    StepFailed,
    SandboxCreated,
    SandboxCleanup,
    PullRequestUpdated,
    Custom(String),
}

/// Outcome tag attached to an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultTag {
    Success,
    Failure,
    Skipped,
}

/// A single immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: String,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub initiator: String,
    pub target: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
    #[serde(default)]
    pub result: Option<ResultTag>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AuditLog {
    pub fn new(
        event_type: AuditEventType,
        timestamp: DateTime<Utc>,
        correlation_id: impl Into<String>,
        initiator: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            timestamp,
            correlation_id: correlation_id.into(),
            initiator: initiator.into(),
            target: target.into(),
            description: String::new(),
            data: HashMap::new(),
            result: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_result(mut self, result: ResultTag) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Filter parameters for [`AuditStore::query`]. Every field is optional; an
/// absent field imposes no constraint.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub event_type: Option<AuditEventType>,
    pub correlation_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, entry: &AuditLog) -> bool {
        if let Some(et) = &self.event_type {
            if et != &entry.event_type {
                return false;
            }
        }
        if let Some(cid) = &self.correlation_id {
            if cid != &entry.correlation_id {
                return false;
            }
        }
        if let Some(start) = self.start {
            if entry.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if entry.timestamp > end {
                return false;
            }
        }
        true
    }

    fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT)
    }
}

/// Trait implemented by every audit log backing. Implementations must be
/// safe for concurrent calls.
pub trait AuditStore: Send + Sync {
    fn store(&self, entry: AuditLog) -> Result<()>;
    fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLog>>;
    /// Deletes entries with `timestamp < now - retention`. `retention ==
    /// Duration::zero()` deletes everything. Returns the number removed.
    fn delete_older_than(&self, retention: Duration, now: DateTime<Utc>) -> Result<usize>;
}

fn select(entries: &[AuditLog], query: &AuditQuery) -> Vec<AuditLog> {
    let mut matched: Vec<&AuditLog> = entries.iter().filter(|e| query.matches(e)).collect();
    matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    matched
        .into_iter()
        .take(query.effective_limit())
        .cloned()
        .collect()
}

fn retain_after_prune(entries: &[AuditLog], retention: Duration, now: DateTime<Utc>) -> (Vec<AuditLog>, usize) {
    if retention <= Duration::zero() {
        return (Vec::new(), entries.len());
    }
    let cutoff = now - retention;
    let (keep, drop): (Vec<AuditLog>, Vec<AuditLog>) =
        entries.iter().cloned().partition(|e| e.timestamp >= cutoff);
    (keep, drop.len())
}

/// Process-lifetime audit store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    entries: Mutex<Vec<AuditLog>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for InMemoryAuditStore {
    fn store(&self, entry: AuditLog) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
        Ok(())
    }

    fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLog>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(select(&entries, query))
    }

    fn delete_older_than(&self, retention: Duration, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let (keep, removed) = retain_after_prune(&entries, retention, now);
        *entries = keep;
        Ok(removed)
    }
}

/// File-backed audit store. Entries are kept in memory for querying and
/// mirrored to an append-only JSONL file so they survive a process restart.
pub struct FileAuditStore {
    path: PathBuf,
    entries: Mutex<Vec<AuditLog>>,
}

impl FileAuditStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        let path = audit_log_path(state_dir);
        let entries = read_all(&path)?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: &AuditLog) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create audit log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        let line = serde_json::to_string(entry).context("failed to serialize audit entry")?;
        writeln!(writer, "{line}").context("failed to write audit entry")?;
        writer.flush().context("failed to flush audit log")?;
        Ok(())
    }

    fn rewrite(&self, entries: &[AuditLog]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create audit log dir {}", parent.display()))?;
        }
        let tmp_path = self.path.with_extension("jsonl.tmp");
        {
            let file = File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            let mut writer = std::io::BufWriter::new(file);
            for entry in entries {
                let line = serde_json::to_string(entry).context("failed to serialize audit entry")?;
                writeln!(writer, "{line}").context("failed to write audit entry")?;
            }
            writer.flush().context("failed to flush audit log")?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

fn read_all(path: &Path) -> Result<Vec<AuditLog>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file =
        File::open(path).with_context(|| format!("failed to open audit log {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line =
            line.with_context(|| format!("failed to read line from audit log {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditLog = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse audit entry: {line}"))?;
        entries.push(entry);
    }
    Ok(entries)
}

impl AuditStore for FileAuditStore {
    fn store(&self, entry: AuditLog) -> Result<()> {
        self.append(&entry)?;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
        Ok(())
    }

    fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLog>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(select(&entries, query))
    }

    fn delete_older_than(&self, retention: Duration, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let (keep, removed) = retain_after_prune(&entries, retention, now);
        self.rewrite(&keep)?;
        *entries = keep;
        Ok(removed)
    }
}
