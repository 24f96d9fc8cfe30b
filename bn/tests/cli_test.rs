//! CLI smoke tests for the `bn` binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("beacon.yml");
    let storage = dir.path().join("storage");
    std::fs::write(
        &path,
        format!(
            "project-id: cli-test\nsampling-rate: 0.5\nsession-timeout-ms: 60000\nmode: qa\nstorage-dir: {}\n",
            storage.display()
        ),
    )
    .expect("write config");
    path
}

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("bn")
        .expect("binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("track"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("session"));
}

#[test]
fn test_config_shows_resolved_values() {
    let dir = TempDir::new().expect("temp dir");
    let config = write_config(&dir);

    Command::cargo_bin("bn")
        .expect("binary")
        .args(["--config", config.to_str().expect("utf8 path"), "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cli-test"))
        .stdout(predicate::str::contains("0.5"));
}

#[test]
fn test_track_in_qa_mode_needs_no_backend() {
    let dir = TempDir::new().expect("temp dir");
    let config = write_config(&dir);

    Command::cargo_bin("bn")
        .expect("binary")
        .args(["--config", config.to_str().expect("utf8 path"), "track", "smoke", "--qa"])
        .assert()
        .success()
        .stdout(predicate::str::contains("queued"));
}

#[test]
fn test_session_reports_missing_session() {
    let dir = TempDir::new().expect("temp dir");
    let config = write_config(&dir);

    Command::cargo_bin("bn")
        .expect("binary")
        .args(["--config", config.to_str().expect("utf8 path"), "session"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No persisted session"));
}
