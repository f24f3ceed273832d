use std::collections::HashMap;
use std::fs;

use assert_cmd::Command;
use chrono::Utc;
use predicates::str::contains;
use tempfile::tempdir;

use opencopilot_core::types::{BackgroundJob, BackgroundJobStatusInfo, JobType};

fn opencopilot_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("opencopilot"))
}

fn seed_job_status(state_dir: &std::path::Path, status: &BackgroundJobStatusInfo) {
    fs::create_dir_all(state_dir).expect("mkdir");
    let mut map = HashMap::new();
    map.insert(status.job_id.clone(), status.clone());
    let json = serde_json::to_string_pretty(&map).expect("serialize");
    fs::write(state_dir.join("job_status.json"), json).expect("write");
}

#[test]
fn given_no_job_status_store_entries_when_querying_status_then_reports_not_found() {
    let td = tempdir().expect("tempdir");

    opencopilot_cmd()
        .current_dir(td.path())
        .env("OPENCOPILOT_CONFIG", td.path().join("nonexistent.toml"))
        .env("OPENCOPILOT_LM_PLANNER_API_KEY", "k")
        .env("OPENCOPILOT_LM_EXECUTOR_API_KEY", "k")
        .env("OPENCOPILOT_DATABASE_CONNECTION", td.path().join("state"))
        .arg("status")
        .arg("ghost-job")
        .assert()
        .success()
        .stdout(contains("no job found with id ghost-job"));
}

#[test]
fn given_a_queued_job_when_querying_status_then_prints_its_fields() {
    let td = tempdir().expect("tempdir");
    let state_dir = td.path().join("state");

    let job = BackgroundJob::new(JobType::Plan, serde_json::json!({"taskId": "o/r/issues/7"}), 3);
    let status = BackgroundJobStatusInfo::queued(&job, Utc::now());
    seed_job_status(&state_dir, &status);

    opencopilot_cmd()
        .current_dir(td.path())
        .env("OPENCOPILOT_CONFIG", td.path().join("nonexistent.toml"))
        .env("OPENCOPILOT_LM_PLANNER_API_KEY", "k")
        .env("OPENCOPILOT_LM_EXECUTOR_API_KEY", "k")
        .env("OPENCOPILOT_DATABASE_CONNECTION", &state_dir)
        .arg("status")
        .arg(&status.job_id)
        .assert()
        .success()
        .stdout(contains(status.job_id.clone()))
        .stdout(contains("Queued"))
        .stdout(contains("plan"));
}
