//! Smoke tests -- verify the binary runs and its subcommands work end to end.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Write a config that keeps the database and logs inside `dir`.
fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("opsrunner.toml");
    let body = format!(
        "[storage]\ndb_path = \"{}\"\n\n[executor]\nbase_dir = \"{}\"\n\n[logging]\nlevel = \"warn\"\n",
        dir.join("ops.db").display(),
        dir.display()
    );
    std::fs::write(&path, body).unwrap();
    path
}

fn opsrunner(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("opsrunner").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("OPSRUNNER_CONFIG")
        .arg("--config")
        .arg(config);
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("opsrunner")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Run, track, and schedule automation jobs"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("opsrunner")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("opsrunner"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        &["serve", "--help"][..],
        &["exec", "--help"],
        &["history", "list", "--help"],
        &["history", "stats", "--help"],
        &["schedule", "dry-run", "--help"],
    ] {
        Command::cargo_bin("opsrunner")
            .unwrap()
            .args(args)
            .assert()
            .success();
    }
}

#[test]
fn test_missing_config_file_fails() {
    Command::cargo_bin("opsrunner")
        .unwrap()
        .args(["--config", "/nonexistent/opsrunner.toml", "history", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[cfg(unix)]
#[test]
fn test_exec_records_history() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    opsrunner(&config)
        .args(["exec", "--", "echo", "hello from exec"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello from exec"));

    opsrunner(&config)
        .args(["history", "list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"success\""))
        .stdout(predicate::str::contains("hello from exec"));

    opsrunner(&config)
        .args(["history", "stats", "--period", "hour"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Total:        1"));
}

#[cfg(unix)]
#[test]
fn test_exec_failure_sets_exit_status() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    opsrunner(&config)
        .args(["exec", "--", "sh", "-c", "echo nope; exit 3"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("nope"))
        .stderr(predicate::str::contains("finished with status failed"));
}

#[test]
fn test_history_rejects_unknown_period() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    opsrunner(&config)
        .args(["history", "stats", "--period", "year"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown period"));
}

#[test]
fn test_schedule_add_list_remove() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    opsrunner(&config)
        .args(["schedule", "add", "--name", "bad", "--cron", "invalid", "--", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid cron expression"));

    let output = opsrunner(&config)
        .args(["schedule", "add", "--name", "nightly", "--cron", "0 2 * * *", "--", "true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Schedule 'nightly' added"))
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8(output).unwrap();
    let id = stdout
        .trim()
        .rsplit_once('(')
        .and_then(|(_, rest)| rest.strip_suffix(")."))
        .unwrap()
        .to_string();

    opsrunner(&config)
        .args(["schedule", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nightly"))
        .stdout(predicate::str::contains("0 2 * * *"));

    opsrunner(&config)
        .args(["schedule", "dry-run", "--hours", "48"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nightly"));

    opsrunner(&config)
        .args(["schedule", "dry-run", "--hours", "10000000000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("exceeds"));

    opsrunner(&config)
        .args(["schedule", "remove", &id])
        .assert()
        .success();

    opsrunner(&config)
        .args(["schedule", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No schedules found."));
}
