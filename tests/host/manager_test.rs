/*!
 * Plugin Manager Tests
 * Lifecycle against a stand-in launcher script instead of the sandbox re-entry
 */

use pluginbox::plugin::{
    LauncherSettings, PluginDescriptor, PluginError, PluginFailure, PluginManager, PluginState,
};
use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixListener;

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    launcher: PathBuf,
}

/// Plugin root plus a launcher script running `body` inside it
fn fixture(body: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    fs::create_dir(&root).unwrap();
    fs::write(root.join("plugin"), b"#!/bin/sh\n").unwrap();

    let launcher = dir.path().join("launcher");
    fs::write(&launcher, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&launcher, fs::Permissions::from_mode(0o755)).unwrap();

    Fixture {
        _dir: dir,
        root,
        launcher,
    }
}

fn manager(launcher: &Path) -> PluginManager {
    PluginManager::new(LauncherSettings {
        program: launcher.to_path_buf(),
        entry: "launcher".to_string(),
        unshare: false,
        shutdown_grace: Duration::from_millis(500),
        ..Default::default()
    })
}

#[tokio::test]
#[serial]
async fn test_plugin_becomes_ready_and_is_stopped_on_close() {
    let fx = fixture(r#"[ -f plugin ] || exit 8
[ -z "$NETWORK" ] || exit 9
exec sleep 30"#);
    let manager = manager(&fx.launcher);
    let descriptor = PluginDescriptor::new("storage", &fx.root, false);
    let socket = descriptor.socket_path.clone();

    let pid = manager.start(descriptor).await.unwrap();
    assert!(pid > 0);
    assert_eq!(manager.state("storage"), Some(PluginState::Starting));

    let _listener = UnixListener::bind(&socket).unwrap();
    manager
        .wait_ready("storage", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(manager.state("storage"), Some(PluginState::Running));

    let _stream = manager.connect("storage").await.unwrap();

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].name, "storage");
    assert_eq!(snapshot[0].pid, pid);

    manager.close().await;
    assert_eq!(manager.state("storage"), Some(PluginState::Stopped));

    // Idempotent
    manager.close().await;
    assert_eq!(manager.state("storage"), Some(PluginState::Stopped));
}

#[tokio::test]
#[serial]
async fn test_plugin_exiting_before_ready_is_failed_start() {
    let fx = fixture("exit 7");
    let manager = manager(&fx.launcher);

    manager
        .start(PluginDescriptor::new("thumbs", &fx.root, false))
        .await
        .unwrap();
    let err = manager
        .wait_ready("thumbs", Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PluginError::StartFailed {
            failure: PluginFailure::Exited(7),
            ..
        }
    ));
    assert_eq!(manager.state("thumbs"), Some(PluginState::Exited(7)));
    manager.close().await;
}

#[tokio::test]
#[serial]
async fn test_setup_failure_is_classified() {
    let fx = fixture("exit 125");
    let manager = manager(&fx.launcher);

    manager
        .start(PluginDescriptor::new("storage", &fx.root, false))
        .await
        .unwrap();
    let err = manager
        .wait_ready("storage", Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PluginError::StartFailed {
            failure: PluginFailure::Setup,
            ..
        }
    ));
    assert_eq!(
        manager.state("storage"),
        Some(PluginState::Failed(PluginFailure::Setup))
    );
}

#[tokio::test]
#[serial]
async fn test_ready_timeout() {
    let fx = fixture("exec sleep 30");
    let manager = manager(&fx.launcher);

    manager
        .start(PluginDescriptor::new("storage", &fx.root, false))
        .await
        .unwrap();
    let err = manager
        .wait_ready("storage", Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, PluginError::ReadyTimeout { .. }));
    assert_eq!(manager.state("storage"), Some(PluginState::Starting));

    manager.close().await;
    assert_eq!(manager.state("storage"), Some(PluginState::Stopped));
}

#[tokio::test]
#[serial]
async fn test_term_resistant_plugin_is_killed() {
    let fx = fixture("trap '' TERM\nwhile :; do sleep 1; done");
    let manager = manager(&fx.launcher);

    manager
        .start(PluginDescriptor::new("stubborn", &fx.root, false))
        .await
        .unwrap();
    // Give the shell time to install its trap
    tokio::time::sleep(Duration::from_millis(100)).await;

    manager.close().await;
    assert_eq!(manager.state("stubborn"), Some(PluginState::Stopped));
}

#[tokio::test]
#[serial]
async fn test_duplicate_start_and_stale_socket() {
    let fx = fixture("exec sleep 30");
    let manager = manager(&fx.launcher);
    let descriptor = PluginDescriptor::new("storage", &fx.root, false);
    fs::write(&descriptor.socket_path, b"stale").unwrap();

    manager.start(descriptor.clone()).await.unwrap();
    assert!(!descriptor.socket_path.exists());

    let err = manager.start(descriptor).await.unwrap_err();
    assert!(matches!(err, PluginError::AlreadyStarted(name) if name == "storage"));

    manager.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_concurrent_starts_spawn_one_sandbox() {
    let fx = fixture("exec sleep 30");
    let manager = manager(&fx.launcher);
    let descriptor = PluginDescriptor::new("storage", &fx.root, false);

    let first = tokio::spawn({
        let manager = manager.clone();
        let descriptor = descriptor.clone();
        async move { manager.start(descriptor).await }
    });
    let second = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start(descriptor).await }
    });
    let results = [first.await.unwrap(), second.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(PluginError::AlreadyStarted(name)) if name == "storage")));
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.len(), 1);

    // The surviving handle owns the only sandbox
    let pid = snapshot[0].pid;
    manager.close().await;
    assert_eq!(manager.state("storage"), Some(PluginState::Stopped));
    assert!(!Path::new(&format!("/proc/{}", pid)).exists());
}

#[tokio::test]
async fn test_invalid_descriptor_spawns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(Path::new("/bin/false"));

    let err = manager
        .start(PluginDescriptor::new("empty", dir.path(), false))
        .await
        .unwrap_err();

    assert!(matches!(err, PluginError::InvalidDescriptor { .. }));
    assert!(manager.snapshot().is_empty());
}

#[tokio::test]
async fn test_missing_launcher_is_spawn_error() {
    let fx = fixture("exit 0");
    let manager = manager(&fx.root.join("no-such-launcher"));

    let err = manager
        .start(PluginDescriptor::new("storage", &fx.root, false))
        .await
        .unwrap_err();

    assert!(matches!(err, PluginError::Spawn { .. }));
    assert!(manager.state("storage").is_none());
}
