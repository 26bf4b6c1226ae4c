/*!
 * Plugin Process Supervisor Tests
 * Runs stand-in plugin scripts outside of any namespace
 */

use pluginbox::sandbox::{PluginExit, PluginSupervisor, SandboxError, SupervisorConfig};
use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("plugin");
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn supervisor(binary: PathBuf) -> PluginSupervisor {
    PluginSupervisor::new(SupervisorConfig {
        binary,
        ..Default::default()
    })
}

#[test]
#[serial]
fn test_plugin_sees_control_socket_and_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), r#"[ "$UNIXSOCKET" = "/grpc.sock" ] || exit 3"#);

    let exit = supervisor(binary).run().unwrap();

    assert_eq!(exit, PluginExit::Exited(0));
    assert_eq!(exit.exit_code(), 0);
}

#[test]
#[serial]
fn test_plugin_exit_code_is_propagated() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "exit 7");

    let exit = supervisor(binary).run().unwrap();

    assert_eq!(exit, PluginExit::Exited(7));
    assert_eq!(exit.exit_code(), 7);
}

#[test]
#[serial]
fn test_plugin_killed_by_signal() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "kill -TERM $$");

    let exit = supervisor(binary).run().unwrap();

    assert_eq!(exit, PluginExit::Signaled(15));
    assert_eq!(exit.exit_code(), 128 + 15);
}

#[test]
#[serial]
fn test_environment_is_inherited() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("seen");
    let binary = write_script(
        dir.path(),
        &format!(r#"printf '%s' "$PATH" > {}"#, marker.display()),
    );

    supervisor(binary).run().unwrap();

    let seen = fs::read_to_string(&marker).unwrap();
    assert_eq!(seen, std::env::var("PATH").unwrap_or_default());
}

#[test]
#[serial]
fn test_non_executable_plugin_is_launch_failure() {
    let dir = tempfile::tempdir().unwrap();
    let binary = dir.path().join("plugin");
    fs::write(&binary, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&binary, fs::Permissions::from_mode(0o644)).unwrap();

    let err = supervisor(binary).run().unwrap_err();

    assert!(matches!(err, SandboxError::Launch { .. }));
    assert_eq!(err.exit_code(), 126);
}

#[test]
fn test_missing_plugin_is_not_found() {
    let dir = tempfile::tempdir().unwrap();

    let err = supervisor(dir.path().join("plugin")).run().unwrap_err();

    assert_eq!(err.exit_code(), 127);
}
