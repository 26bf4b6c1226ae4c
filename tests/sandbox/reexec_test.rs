/*!
 * Re-entry Dispatch Tests
 * Starts the real binary under the sandbox entry name
 */

use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::process::{Command, Output};

const BINARY: &str = env!("CARGO_BIN_EXE_pluginbox");

fn run_as(arg0: &str, dir: &std::path::Path, network: bool) -> Output {
    let mut cmd = Command::new(BINARY);
    cmd.arg0(arg0).current_dir(dir).env_remove("RUST_LOG");
    if network {
        cmd.env("NETWORK", "1");
    } else {
        cmd.env_remove("NETWORK");
    }
    cmd.output().unwrap()
}

fn plugin_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let plugin = dir.path().join("plugin");
    fs::write(&plugin, format!("#!/bin/sh\ntouch {}\n", marker.display())).unwrap();
    fs::set_permissions(&plugin, fs::Permissions::from_mode(0o755)).unwrap();
    dir
}

#[test]
#[serial]
fn test_reentry_without_namespaces_is_setup_failure() {
    let dir = plugin_dir();

    let output = run_as("pluginNamespace", dir.path(), false);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert_eq!(output.status.code(), Some(125), "stderr: {}", stderr);
    assert!(!dir.path().join("ran").exists());
    // Host start-up never ran
    assert!(!stderr.contains("Configuration loaded"));
    assert!(!stderr.contains("Failed to read config file"));
}

#[test]
#[serial]
fn test_reentry_with_network_flag_is_setup_failure() {
    let dir = plugin_dir();

    let output = run_as("pluginNamespace", dir.path(), true);

    assert_eq!(output.status.code(), Some(125));
    assert!(!dir.path().join("ran").exists());
}

#[test]
#[serial]
fn test_entry_name_must_match_exactly() {
    let dir = plugin_dir();

    // Falls through to host start-up, which fails on the missing config file
    let output = run_as("pluginNamespaceX", dir.path(), false);

    assert_eq!(output.status.code(), Some(1));
    assert!(!dir.path().join("ran").exists());
}

#[test]
#[serial]
fn test_host_with_missing_config_exits_one() {
    let dir = tempfile::tempdir().unwrap();

    let output = Command::new(BINARY)
        .arg("--config")
        .arg(dir.path().join("absent.yml"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("absent.yml"), "stderr: {}", stderr);
}
