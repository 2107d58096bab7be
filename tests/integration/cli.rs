//! Tests for the `app-updater` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use std::path::Path;
use tempfile::TempDir;

fn updater(config_path: &Path) -> Command {
    let mut cmd = Command::cargo_bin("app-updater").unwrap();
    cmd.arg("--config").arg(config_path).arg("--no-progress").env_remove("UPDATER_CONFIG_PATH");
    cmd
}

/// Config with only directories set, so nothing is written outside `root`.
fn write_partial_config(root: &Path) -> std::path::PathBuf {
    let path = root.join("config.toml");
    let content = format!(
        "work_dir = {:?}\nlog_dir = {:?}\n",
        root.join("work").to_string_lossy(),
        root.join("logs").to_string_lossy()
    );
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("app-updater")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("update"))
        .stdout(predicate::str::contains("latest"));
}

#[test]
fn test_verbose_and_quiet_are_exclusive() {
    let temp = TempDir::new().unwrap();
    updater(&temp.path().join("config.toml")).args(["-v", "-q", "check"]).assert().failure();
}

#[test]
#[serial]
fn test_check_without_server_is_a_configuration_error() {
    let temp = TempDir::new().unwrap();
    let config = write_partial_config(temp.path());

    updater(&config)
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("server_url is not set"));
}

#[test]
#[serial]
fn test_update_without_server_fails() {
    let temp = TempDir::new().unwrap();
    let config = write_partial_config(temp.path());

    updater(&config).args(["update", "--force"]).assert().failure();
    assert!(!temp.path().join("install").exists());
}

#[test]
fn test_config_set_show_and_path() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("nested").join("config.toml");

    updater(&config)
        .args(["config", "set", "server_url", "updates.example.com"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Updated"));
    updater(&config).args(["config", "set", "app_name", "demo"]).assert().success();

    let saved = std::fs::read_to_string(&config).unwrap();
    assert!(saved.contains("server_url = \"http://updates.example.com\""));
    assert!(saved.contains("app_name = \"demo\""));

    updater(&config)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("updates.example.com"))
        .stdout(predicate::str::contains("install_path is not set"));

    updater(&config)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_config_set_rejects_unknown_key() {
    let temp = TempDir::new().unwrap();
    updater(&temp.path().join("config.toml"))
        .args(["config", "set", "colour", "blue"])
        .assert()
        .failure();
}
