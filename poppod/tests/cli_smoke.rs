//! Smoke tests for the daemon-control binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn poppod() -> Command {
    Command::cargo_bin("poppod").unwrap()
}

#[test]
fn test_help_lists_daemon_commands() {
    poppod()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn test_hidden_run_daemon_not_in_help() {
    poppod()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run-daemon").not());
}

#[test]
fn test_version_flag() {
    poppod()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_no_args_prints_banner() {
    let temp = TempDir::new().unwrap();
    poppod()
        .env("POPPO_CONFIG_DIR", temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("config root"));
}

#[test]
fn test_status_without_daemon() {
    let temp = TempDir::new().unwrap();
    poppod()
        .env("POPPO_CONFIG_DIR", temp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("not running"));
}

#[test]
fn test_status_json_without_daemon() {
    let temp = TempDir::new().unwrap();
    poppod()
        .env("POPPO_CONFIG_DIR", temp.path())
        .args(["status", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""running":false"#));
}

#[test]
fn test_stop_without_daemon_fails() {
    let temp = TempDir::new().unwrap();
    poppod()
        .env("POPPO_CONFIG_DIR", temp.path())
        .arg("stop")
        .assert()
        .failure();
}

#[test]
fn test_unknown_subcommand_fails_usage() {
    poppod().arg("frobnicate").assert().failure();
}
