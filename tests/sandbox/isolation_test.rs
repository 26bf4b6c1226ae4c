/*!
 * Namespace Isolation Tests
 * Real re-entry with fresh namespaces, mounts and pivot_root
 *
 * These need root and a kernel that allows unshare(CLONE_NEWNS); elsewhere
 * they return early.
 */

use pluginbox::plugin::{
    LauncherSettings, PluginDescriptor, PluginError, PluginFailure, PluginManager, PluginState,
};
use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

const BINARY: &str = env!("CARGO_BIN_EXE_pluginbox");

fn namespaces_available() -> bool {
    nix::unistd::geteuid().is_root()
        && Command::new("unshare")
            .args(["-m", "true"])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
}

/// Locate a host tool under /bin or /usr/bin
fn host_tool(name: &str) -> String {
    ["/bin", "/usr/bin"]
        .iter()
        .map(|dir| format!("{}/{}", dir, name))
        .find(|path| Path::new(path).exists())
        .unwrap_or_else(|| panic!("{} not found", name))
}

fn copy_into(root: &Path, file: &str) {
    let dest = root.join(file.trim_start_matches('/'));
    fs::create_dir_all(dest.parent().unwrap()).unwrap();
    fs::copy(file, &dest).unwrap();
}

/// Copy `binary` and the shared objects it links against into `root`
fn install(root: &Path, binary: &str) {
    copy_into(root, binary);
    let ldd = Command::new("ldd").arg(binary).output().unwrap();
    for lib in String::from_utf8_lossy(&ldd.stdout)
        .split_whitespace()
        .filter(|token| token.starts_with('/'))
    {
        copy_into(root, lib);
    }
}

struct PluginRoot {
    _dir: tempfile::TempDir,
    root: PathBuf,
    sh: String,
    sleep: String,
}

/// Minimal root holding a shell, `sleep` and a `/plugin` script running `body`
fn plugin_root(body: &str) -> PluginRoot {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    fs::create_dir(&root).unwrap();

    let sh = host_tool("sh");
    let sleep = host_tool("sleep");
    install(&root, &sh);
    install(&root, &sleep);

    let plugin = root.join("plugin");
    fs::write(&plugin, format!("#!{}\n{}\n", sh, body)).unwrap();
    fs::set_permissions(&plugin, fs::Permissions::from_mode(0o755)).unwrap();

    PluginRoot {
        _dir: dir,
        root,
        sh,
        sleep,
    }
}

fn manager() -> PluginManager {
    PluginManager::new(LauncherSettings {
        program: PathBuf::from(BINARY),
        shutdown_grace: Duration::from_millis(500),
        ..Default::default()
    })
}

async fn wait_terminal(manager: &PluginManager, name: &str) -> PluginState {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let state = manager.state(name).unwrap();
        if state.is_terminal() || Instant::now() >= deadline {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Pid written by the plugin to `/pid`, read from the host side
async fn plugin_pid(root: &Path) -> i32 {
    let path = root.join("pid");
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(raw) = fs::read_to_string(&path) {
            if let Ok(pid) = raw.trim().parse() {
                return pid;
            }
        }
        assert!(Instant::now() < deadline, "plugin never wrote its pid");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Running, or anything but a zombie awaiting an absent reaper
fn alive(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

async fn wait_gone(pid: i32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
}

#[tokio::test]
#[serial]
async fn test_plugin_sees_only_its_root() {
    if !namespaces_available() {
        return;
    }
    let fx = plugin_root(
        r#"[ -e /etc/passwd ] && exit 3
[ -x /plugin ] || exit 4
[ "$UNIXSOCKET" = /grpc.sock ] || exit 5
[ -d /proc/self ] || exit 6
exit 0"#,
    );
    let manager = manager();

    manager
        .start(PluginDescriptor::new("storage", &fx.root, false))
        .await
        .unwrap();

    assert_eq!(wait_terminal(&manager, "storage").await, PluginState::Exited(0));
    // The host's view is untouched
    assert!(Path::new("/etc/passwd").exists());
    manager.close().await;
}

#[tokio::test]
#[serial]
async fn test_plugin_exit_code_fails_readiness() {
    if !namespaces_available() {
        return;
    }
    let fx = plugin_root("exit 7");
    let manager = manager();

    manager
        .start(PluginDescriptor::new("thumbs", &fx.root, false))
        .await
        .unwrap();
    let err = manager
        .wait_ready("thumbs", Duration::from_secs(10))
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
}

#[tokio::test]
#[serial]
async fn test_close_terminates_plugin() {
    if !namespaces_available() {
        return;
    }
    let fx = plugin_root("");
    fs::write(
        fx.root.join("plugin"),
        format!("#!{}\necho $$ > /pid\nexec {} 30\n", fx.sh, fx.sleep),
    )
    .unwrap();
    let manager = manager();

    manager
        .start(PluginDescriptor::new("storage", &fx.root, false))
        .await
        .unwrap();
    let pid = plugin_pid(&fx.root).await;
    assert!(alive(pid));

    manager.close().await;

    assert_eq!(manager.state("storage"), Some(PluginState::Stopped));
    assert!(wait_gone(pid).await, "plugin {} outlived its sandbox", pid);
}

#[tokio::test]
#[serial]
async fn test_close_kills_term_resistant_plugin() {
    if !namespaces_available() {
        return;
    }
    let fx = plugin_root("");
    fs::write(
        fx.root.join("plugin"),
        format!(
            "#!{}\ntrap '' TERM\necho $$ > /pid\nwhile :; do {} 1; done\n",
            fx.sh, fx.sleep
        ),
    )
    .unwrap();
    let manager = manager();

    manager
        .start(PluginDescriptor::new("stubborn", &fx.root, false))
        .await
        .unwrap();
    let pid = plugin_pid(&fx.root).await;

    manager.close().await;

    assert_eq!(manager.state("stubborn"), Some(PluginState::Stopped));
    assert!(wait_gone(pid).await, "plugin {} outlived its sandbox", pid);
}

#[test]
#[serial]
fn test_filesystem_root_is_rejected_as_target() {
    if !namespaces_available() {
        return;
    }
    let mut cmd = Command::new(BINARY);
    cmd.arg0("pluginNamespace")
        .current_dir("/")
        .env_remove("NETWORK");
    // SAFETY: unshare(2) only
    unsafe {
        cmd.pre_exec(|| {
            nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWNS).map_err(std::io::Error::from)
        });
    }

    let status = cmd.status().unwrap();

    assert_eq!(status.code(), Some(125));
}
