//! Smoke tests -- verify the binary runs and its subcommands answer.

use assert_cmd::Command;
use predicates::prelude::*;

fn testflow() -> Command {
    let mut cmd = Command::cargo_bin("testflow").unwrap();
    cmd.env_remove("TESTFLOW_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    testflow()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("API test execution engine"));
}

#[test]
fn test_cli_version() {
    testflow()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("testflow"));
}

#[test]
fn test_serve_subcommand_exists() {
    testflow().args(["serve", "--help"]).assert().success();
}

#[test]
fn test_config_prints_effective_toml() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("testflow.toml");
    std::fs::write(&path, "[server]\nbind = \"127.0.0.1:9123\"\n").unwrap();

    testflow()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicates::str::contains("127.0.0.1:9123"))
        .stdout(predicates::str::contains("[queues.test_execution]"));
}

#[test]
fn test_keygen_then_token() {
    let output = testflow().arg("keygen").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let signing = stdout
        .lines()
        .find(|l| l.starts_with("signing_key"))
        .and_then(|l| l.split('"').nth(1))
        .unwrap()
        .to_string();

    testflow()
        .args(["token", "--user", "u1", "--org", "org-1", "--signing-key", &signing])
        .assert()
        .success()
        .stdout(predicates::str::contains("."));
}

#[test]
fn test_run_unreachable_target_reports_error_records() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("test.json");
    std::fs::write(
        &path,
        r#"{
            "id": "t-smoke",
            "project_id": "p1",
            "name": "unreachable",
            "request": { "url": "http://127.0.0.1:1/", "timeout_ms": 2000 },
            "assertions": [{ "type": "status", "operator": "equals", "value": 200 }]
        }"#,
    )
    .unwrap();

    testflow()
        .args(["run", "--region", "eu-west-1", "--file"])
        .arg(&path)
        .assert()
        .code(1)
        .stdout(predicates::str::contains("\"status\": \"error\""))
        .stdout(predicates::str::contains("eu-west-1"));
}

#[test]
fn test_run_rejects_unknown_region() {
    testflow()
        .args(["run", "--file", "missing.json", "--region", "mars-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown region"));
}
