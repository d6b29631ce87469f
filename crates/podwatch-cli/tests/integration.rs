#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const EXPERIMENT: &str = "20240401_run1/sub/20240401_1200_devA_fcB_expC";

fn podwatch(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("podwatch").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("PODWATCH_CONFIG")
        .env_remove("PODWATCH_PATH");
    cmd
}

/// A root holding one finished experiment for 2024-04-01.
fn finished_run(dir: &TempDir) -> PathBuf {
    let exp = dir.path().join(EXPERIMENT);
    std::fs::create_dir_all(exp.join("pod5")).unwrap();
    std::fs::write(exp.join("final_summary_x.txt"), "").unwrap();
    exp
}

fn write_config(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("podwatch.yaml");
    std::fs::write(&path, body).unwrap();
    path
}

fn root_arg(dir: &TempDir) -> &Path {
    dir.path()
}

// ---------------------------------------------------------------------------
// podwatch resolve
// ---------------------------------------------------------------------------

#[test]
fn resolve_prints_experiment_directory() {
    let dir = TempDir::new().unwrap();
    let exp = finished_run(&dir);
    std::fs::create_dir_all(dir.path().join("20240402_other")).unwrap();

    podwatch(&dir)
        .args(["resolve", "--date", "20240401", "--path"])
        .arg(root_arg(&dir))
        .assert()
        .success()
        .stdout(predicate::str::contains(exp.display().to_string()))
        .stdout(predicate::str::contains("flow cell:  fcB"));
}

#[test]
fn resolve_json_output() {
    let dir = TempDir::new().unwrap();
    finished_run(&dir);

    let output = podwatch(&dir)
        .args(["resolve", "--json", "--date", "20240401", "--path"])
        .arg(root_arg(&dir))
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["device_id"], "devA");
    assert_eq!(value["experiment_id"], "expC");
    assert!(value["discarded"].as_array().unwrap().is_empty());
}

#[test]
fn resolve_missing_experiment_fails() {
    let dir = TempDir::new().unwrap();
    finished_run(&dir);

    podwatch(&dir)
        .args(["resolve", "--date", "20240505", "--path"])
        .arg(root_arg(&dir))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("error:"))
        .stderr(predicate::str::contains("no experiment directory"));
}

#[test]
fn resolve_reads_date_from_config_file() {
    let dir = TempDir::new().unwrap();
    let exp = finished_run(&dir);
    let config = write_config(
        &dir,
        &format!("path: {}\ndate: 20240401\n", dir.path().display()),
    );

    podwatch(&dir)
        .arg("--config")
        .arg(&config)
        .arg("resolve")
        .assert()
        .success()
        .stdout(predicate::str::contains(exp.display().to_string()));
}

// ---------------------------------------------------------------------------
// podwatch config validate
// ---------------------------------------------------------------------------

#[test]
fn validate_accepts_complete_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        &format!(
            "path: {}\ndate: \"20240401\"\nbasecalling_method: simplex\nemail_recipients:\n  - lab@example.org\nmail:\n  enabled: false\n",
            dir.path().display()
        ),
    );

    podwatch(&dir)
        .arg("--config")
        .arg(&config)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration ok"))
        .stdout(predicate::str::contains("simplex sup"))
        .stdout(predicate::str::contains("mail:       disabled"));
}

#[test]
fn flags_override_config_file() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        &format!(
            "path: {}\ndate: \"20240401\"\nmodel: hac\nemail_recipients: [lab@example.org]\n",
            dir.path().display()
        ),
    );

    let output = podwatch(&dir)
        .arg("--config")
        .arg(&config)
        .args(["config", "validate", "--json", "--model", "fast", "--in-memory-index"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["request"]["basecalling"]["model"], "fast");
    assert_eq!(value["index"]["type"], "in_memory");
}

#[test]
fn validate_reports_every_problem() {
    let dir = TempDir::new().unwrap();

    podwatch(&dir)
        .args(["config", "validate", "--date", "20240231", "--path"])
        .arg(root_arg(&dir))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("20240231"))
        .stderr(predicate::str::contains("at least one email recipient"));
}

#[test]
fn unknown_config_keys_are_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "path: /data\nbasecaling_method: duplex\n");

    podwatch(&dir)
        .arg("--config")
        .arg(&config)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("basecaling_method"));
}

// ---------------------------------------------------------------------------
// podwatch watch
// ---------------------------------------------------------------------------

#[test]
fn watch_refuses_invalid_configuration() {
    let dir = TempDir::new().unwrap();
    finished_run(&dir);

    podwatch(&dir)
        .args(["watch", "--date", "20240401", "--email", "not-an-address", "--path"])
        .arg(root_arg(&dir))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("not-an-address"));

    // nothing was claimed
    assert!(!dir.path().join(".podwatch").exists());
}

#[test]
fn watch_requires_a_root() {
    let dir = TempDir::new().unwrap();

    podwatch(&dir)
        .args(["watch", "--date", "20240401", "--email", "lab@example.org"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("path is required"));
}

// ---------------------------------------------------------------------------
// podwatch status
// ---------------------------------------------------------------------------

#[test]
fn status_without_index_is_empty() {
    let dir = TempDir::new().unwrap();

    podwatch(&dir)
        .args(["status", "--path"])
        .arg(root_arg(&dir))
        .assert()
        .success()
        .stdout(predicate::str::contains("no markers recorded"));

    podwatch(&dir)
        .args(["status", "--json", "--path"])
        .arg(root_arg(&dir))
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[]"));
}

#[test]
fn status_needs_a_location() {
    let dir = TempDir::new().unwrap();

    podwatch(&dir)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--index or --path"));
}
