use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn opencopilot_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("opencopilot"))
}

#[test]
fn given_no_lm_api_keys_when_running_doctor_then_reports_missing_planner_key() {
    let td = tempdir().expect("tempdir");

    opencopilot_cmd()
        .current_dir(td.path())
        .env("OPENCOPILOT_CONFIG", td.path().join("nonexistent.toml"))
        .env("OPENCOPILOT_LM_PLANNER_API_KEY", "")
        .env("OPENCOPILOT_LM_EXECUTOR_API_KEY", "")
        .arg("doctor")
        .assert()
        .success()
        .stderr(contains("LM.Planner.ApiKey"));
}

#[test]
fn given_azure_provider_without_endpoint_when_running_doctor_then_reports_the_missing_field() {
    let td = tempdir().expect("tempdir");
    std::fs::write(
        td.path().join("opencopilot.toml"),
        r#"
[lm.planner]
provider = "AzureOpenAI"
api_key = "k"
"#,
    )
    .expect("write config");

    opencopilot_cmd()
        .current_dir(td.path())
        .env("OPENCOPILOT_CONFIG", td.path().join("opencopilot.toml"))
        .env("OPENCOPILOT_LM_EXECUTOR_API_KEY", "k")
        .arg("doctor")
        .assert()
        .success()
        .stderr(contains("AzureEndpoint"));
}

#[test]
fn given_valid_config_when_running_doctor_then_lists_sandbox_build_tools() {
    let td = tempdir().expect("tempdir");

    opencopilot_cmd()
        .current_dir(td.path())
        .env("OPENCOPILOT_CONFIG", td.path().join("nonexistent.toml"))
        .env("OPENCOPILOT_LM_PLANNER_API_KEY", "sk-planner")
        .env("OPENCOPILOT_LM_EXECUTOR_API_KEY", "sk-executor")
        .arg("doctor")
        .assert()
        .success()
        .stdout(contains("dotnet"))
        .stdout(contains("cargo"))
        .stdout(contains("go"));
}

#[test]
fn given_file_backed_store_when_running_doctor_then_reports_the_state_directory() {
    let td = tempdir().expect("tempdir");
    let state_dir = td.path().join("state");

    opencopilot_cmd()
        .current_dir(td.path())
        .env("OPENCOPILOT_CONFIG", td.path().join("nonexistent.toml"))
        .env("OPENCOPILOT_LM_PLANNER_API_KEY", "sk-planner")
        .env("OPENCOPILOT_LM_EXECUTOR_API_KEY", "sk-executor")
        .env("OPENCOPILOT_DATABASE_CONNECTION", &state_dir)
        .arg("doctor")
        .assert()
        .success()
        .stdout(contains("file-backed at"));
}
