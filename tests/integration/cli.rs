use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

fn servebench() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("servebench"))
}

#[test]
fn help_lists_subcommands() {
    servebench()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("compare")
                .and(predicate::str::contains("bench"))
                .and(predicate::str::contains("eval"))
                .and(predicate::str::contains("profile"))
                .and(predicate::str::contains("logs")),
        );
}

#[test]
fn logs_prints_channel_tail() {
    let temp = tempdir().expect("failed to create tempdir");
    let log_dir = temp.path().join("logs");
    fs::create_dir_all(&log_dir).expect("failed to create log dir");
    fs::write(
        log_dir.join("server.log"),
        "line one\nline two\nline three\n",
    )
    .expect("failed to write log");

    servebench()
        .arg("logs")
        .arg("--log-dir")
        .arg(&log_dir)
        .arg("-n")
        .arg("2")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("line two")
                .and(predicate::str::contains("line three"))
                .and(predicate::str::contains("line one").not()),
        );
}

#[test]
fn logs_of_missing_channel_prints_nothing() {
    let temp = tempdir().expect("failed to create tempdir");

    servebench()
        .arg("logs")
        .arg("bench")
        .arg("--log-dir")
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn compare_requires_pr_ref() {
    let temp = tempdir().expect("failed to create tempdir");

    servebench()
        .current_dir(temp.path())
        .arg("compare")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--pr-ref"));
}

#[test]
fn compare_rejects_unknown_which() {
    servebench()
        .args(["compare", "--pr-ref", "feature", "--which", "neither"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn missing_config_file_is_reported() {
    let temp = tempdir().expect("failed to create tempdir");
    let missing = temp.path().join("nope.yaml");

    servebench()
        .current_dir(temp.path())
        .arg("bench")
        .arg("--config")
        .arg(&missing)
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope.yaml"));
}

#[test]
fn invalid_rates_are_rejected() {
    let temp = tempdir().expect("failed to create tempdir");

    servebench()
        .current_dir(temp.path())
        .args(["bench", "--rates", "1,fast"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("fast"));
}
