use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn opencopilot_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("opencopilot"))
}

#[test]
fn doctor_reports_invalid_config_without_crashing() {
    let td = tempdir().expect("tempdir");

    opencopilot_cmd()
        .current_dir(td.path())
        .env("OPENCOPILOT_CONFIG", td.path().join("nonexistent.toml"))
        .env("OPENCOPILOT_LM_PLANNER_API_KEY", "")
        .env("OPENCOPILOT_LM_EXECUTOR_API_KEY", "")
        .arg("doctor")
        .assert()
        .success()
        .stderr(contains("configuration is invalid"));
}

#[test]
fn doctor_reports_valid_config_and_tool_versions() {
    let td = tempdir().expect("tempdir");

    opencopilot_cmd()
        .current_dir(td.path())
        .env("OPENCOPILOT_CONFIG", td.path().join("nonexistent.toml"))
        .env("OPENCOPILOT_LM_PLANNER_API_KEY", "sk-planner")
        .env("OPENCOPILOT_LM_EXECUTOR_API_KEY", "sk-executor")
        .arg("doctor")
        .assert()
        .success()
        .stdout(contains("max_concurrency:"))
        .stdout(contains("retry_policy:"))
        .stdout(contains("cargo:"));
}

#[test]
fn status_reports_missing_job_without_error() {
    let td = tempdir().expect("tempdir");

    opencopilot_cmd()
        .current_dir(td.path())
        .env("OPENCOPILOT_CONFIG", td.path().join("nonexistent.toml"))
        .env("OPENCOPILOT_LM_PLANNER_API_KEY", "sk-planner")
        .env("OPENCOPILOT_LM_EXECUTOR_API_KEY", "sk-executor")
        .env("OPENCOPILOT_DATABASE_CONNECTION", td.path().join("state"))
        .arg("status")
        .arg("no-such-job")
        .assert()
        .success()
        .stdout(contains("no job found with id no-such-job"));
}

#[test]
fn completions_prints_a_nonempty_script() {
    opencopilot_cmd()
        .arg("completions")
        .arg("bash")
        .assert()
        .success()
        .stdout(contains("opencopilot"));
}
