//! Argument parsing, exit codes and offline command paths.

#![allow(clippy::expect_used)]

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Variables that would otherwise leak from the developer's shell.
const CONFIG_VARS: &[&str] = &[
    "HETZNER_TOKEN",
    "BUILD_SOURCE_DIR",
    "BUILD_REPO_URL",
    "KEEP_SERVER_ON_FAILURE",
    "SERVER_STATE_FILE",
    "HETZNER_SSH_PORT",
    "RELEASE_TAG",
    "GITHUB_ACTIONS",
];

fn burnbox() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("burnbox"));
    cmd.env("NO_COLOR", "1");
    for var in CONFIG_VARS {
        cmd.env_remove(var);
    }
    cmd
}

// --- Help and version ---

#[test]
fn test_cli_no_args_shows_help_and_exits_two() {
    burnbox()
        .assert()
        .code(2)
        .stderr(predicate::str::contains("disposable cloud server"));
}

#[test]
fn test_cli_help_lists_commands() {
    burnbox()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("cleanup"))
        .stdout(predicate::str::contains("HETZNER_TOKEN"));
}

#[test]
fn test_cli_version_flag_shows_version() {
    burnbox()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("burnbox"));
}

#[test]
fn test_unknown_subcommand_is_rejected() {
    burnbox()
        .arg("deploy")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

// --- run ---

#[test]
fn test_run_without_token_is_a_config_error() {
    let dir = TempDir::new().expect("tempdir");
    burnbox()
        .arg("run")
        .env("BUILD_SOURCE_DIR", dir.path())
        .env("SERVER_STATE_FILE", dir.path().join("state.json"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("HETZNER_TOKEN"));
}

#[test]
fn test_run_with_both_sources_is_a_config_error() {
    let dir = TempDir::new().expect("tempdir");
    burnbox()
        .arg("run")
        .env("HETZNER_TOKEN", "tok-test")
        .env("BUILD_SOURCE_DIR", dir.path())
        .env("BUILD_REPO_URL", "https://github.com/acme/firmware")
        .env("SERVER_STATE_FILE", dir.path().join("state.json"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("exactly one"));
}

#[test]
fn test_run_with_invalid_port_is_a_config_error() {
    let dir = TempDir::new().expect("tempdir");
    burnbox()
        .arg("run")
        .env("HETZNER_TOKEN", "tok-test")
        .env("BUILD_SOURCE_DIR", dir.path())
        .env("HETZNER_SSH_PORT", "0")
        .env("SERVER_STATE_FILE", dir.path().join("state.json"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("HETZNER_SSH_PORT"));
}

// --- cleanup ---

#[test]
fn test_cleanup_without_state_is_a_no_op() {
    let dir = TempDir::new().expect("tempdir");
    burnbox()
        .arg("cleanup")
        .env("SERVER_STATE_FILE", dir.path().join("state.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to cleanup"));
}

#[test]
fn test_cleanup_quiet_prints_nothing() {
    let dir = TempDir::new().expect("tempdir");
    burnbox()
        .args(["--quiet", "cleanup"])
        .env("SERVER_STATE_FILE", dir.path().join("state.json"))
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_cleanup_with_corrupt_state_fails() {
    let dir = TempDir::new().expect("tempdir");
    let state = dir.path().join("state.json");
    std::fs::write(&state, "{not json").expect("write");
    burnbox()
        .arg("cleanup")
        .env("SERVER_STATE_FILE", &state)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Error:"));
    assert!(state.exists(), "corrupt state must be left for inspection");
}

#[test]
fn test_cleanup_refuses_when_keep_flag_is_set() {
    let dir = TempDir::new().expect("tempdir");
    let state = dir.path().join("state.json");
    std::fs::write(
        &state,
        r#"{"server_id": 4711, "server_name": "burnbox-builder-1a2b3c4d",
            "server_ip": "203.0.113.7", "ssh_port": 22, "ssh_key_id": 101,
            "created_at": "2026-02-17T14:30:00Z", "provider_token": "tok-test"}"#,
    )
    .expect("write");
    burnbox()
        .arg("cleanup")
        .env("SERVER_STATE_FILE", &state)
        .env("KEEP_SERVER_ON_FAILURE", "true")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("KEEP_SERVER_ON_FAILURE"));
    assert!(state.exists());
}

// --- NO_COLOR ---

#[test]
fn test_no_color_accepts_any_value() {
    for value in ["1", "true", "yes", "anything"] {
        let dir = TempDir::new().expect("tempdir");
        burnbox()
            .arg("cleanup")
            .env("NO_COLOR", value)
            .env("SERVER_STATE_FILE", dir.path().join("state.json"))
            .assert()
            .success()
            .stdout(predicate::str::contains("nothing to cleanup"));
    }
}

#[test]
fn test_no_color_falsey_and_empty_values_are_accepted() {
    for value in ["", "0", "false"] {
        let dir = TempDir::new().expect("tempdir");
        burnbox()
            .arg("cleanup")
            .env("NO_COLOR", value)
            .env("SERVER_STATE_FILE", dir.path().join("state.json"))
            .assert()
            .success();
    }
}

#[test]
fn test_no_color_flag_takes_no_value() {
    let dir = TempDir::new().expect("tempdir");
    burnbox()
        .args(["--no-color", "cleanup"])
        .env_remove("NO_COLOR")
        .env("SERVER_STATE_FILE", dir.path().join("state.json"))
        .assert()
        .success();
}
