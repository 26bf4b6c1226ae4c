/*!
 * Plugin Manager
 * Spawns plugin sandboxes and tracks their lifecycle
 *
 * Each plugin runs in a re-entered copy of this binary with a fresh mount
 * namespace (and network namespace when requested). A watcher task per plugin
 * records the terminal state; readiness is the control socket accepting a
 * connection.
 */

use super::types::{
    PluginDescriptor, PluginError, PluginFailure, PluginResult, PluginState, PluginStatus,
    VethNames,
};
#[cfg(target_os = "linux")]
use super::veth::VethManager;
use crate::core::limits::{
    CONTROL_SOCKET_ENV, DEFAULT_SHUTDOWN_GRACE, NETWORK_ENV, PLUGIN_NAMESPACE_ENTRY,
    READY_POLL_INTERVAL, SANDBOX_ADDR_ENV, SANDBOX_GATEWAY_ENV, SANDBOX_NET_POLL_ENV,
    SANDBOX_NET_WAIT_ENV, SELF_EXE,
};
use crate::core::types::{ExitClass, Pid};
use crate::reexec;
use crate::sandbox::WaitPolicy;
use ahash::RandomState;
use dashmap::{DashMap, DashSet};
#[cfg(target_os = "linux")]
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How sandbox processes are launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherSettings {
    /// Executable to spawn
    pub program: PathBuf,
    /// argv[0] for the spawned process
    pub entry: String,
    /// Create the namespaces before exec
    pub unshare: bool,
    /// Forwarded to the sandbox's network wait
    pub network_wait: WaitPolicy,
    /// Time between SIGTERM and SIGKILL on close
    pub shutdown_grace: Duration,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from(SELF_EXE),
            entry: PLUGIN_NAMESPACE_ENTRY.to_string(),
            unshare: true,
            network_wait: WaitPolicy::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

struct PluginHandle {
    descriptor: PluginDescriptor,
    pid: Pid,
    state: Arc<watch::Sender<PluginState>>,
    stopping: Arc<AtomicBool>,
    veth: Option<VethNames>,
}

struct Reservation<'a> {
    starting: &'a DashSet<String, RandomState>,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.starting.remove(&self.name);
    }
}

/// Owner of every plugin sandbox started by this host
#[derive(Clone)]
pub struct PluginManager {
    settings: Arc<LauncherSettings>,
    plugins: Arc<DashMap<String, PluginHandle, RandomState>>,
    /// Names whose `start` is still in flight
    starting: Arc<DashSet<String, RandomState>>,
    #[cfg(target_os = "linux")]
    veth: Arc<tokio::sync::OnceCell<VethManager>>,
}

impl PluginManager {
    pub fn new(settings: LauncherSettings) -> Self {
        info!(
            program = %settings.program.display(),
            entry = %settings.entry,
            unshare = settings.unshare,
            "Plugin manager initialized"
        );
        Self {
            settings: Arc::new(settings),
            plugins: Arc::new(DashMap::with_hasher(RandomState::new())),
            starting: Arc::new(DashSet::with_hasher(RandomState::new())),
            #[cfg(target_os = "linux")]
            veth: Arc::new(tokio::sync::OnceCell::new()),
        }
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    /// Spawn the sandbox for `descriptor`
    ///
    /// Returns once the sandbox process exists and, for networked plugins, its
    /// veth peer has been handed over. Use [`wait_ready`](Self::wait_ready) to
    /// wait for the control socket.
    pub async fn start(&self, descriptor: PluginDescriptor) -> PluginResult<Pid> {
        descriptor.validate()?;
        let _reservation = self.reserve(&descriptor.name)?;

        remove_stale_socket(&descriptor)?;

        let mut child = self
            .command(&descriptor)
            .spawn()
            .map_err(|source| PluginError::Spawn {
                name: descriptor.name.clone(),
                source,
            })?;

        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                return Err(PluginError::StartFailed {
                    name: descriptor.name,
                    failure: PluginFailure::Lost("exited before it could be tracked".to_string()),
                })
            }
        };

        info!(
            plugin = %descriptor.name,
            pid,
            root = %descriptor.root.display(),
            network = descriptor.network,
            "Plugin sandbox spawned"
        );

        let veth = if descriptor.network {
            let names = VethNames::for_pid(pid);
            if let Err(e) = self.attach_network(&descriptor, &names, pid).await {
                error!(plugin = %descriptor.name, error = %e, "Network set-up failed, killing sandbox");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(e);
            }
            Some(names)
        } else {
            None
        };

        let (state, _) = watch::channel(PluginState::Starting);
        let state = Arc::new(state);
        let stopping = Arc::new(AtomicBool::new(false));

        tokio::spawn(watch_sandbox(
            descriptor.name.clone(),
            child,
            state.clone(),
            stopping.clone(),
        ));

        self.plugins.insert(
            descriptor.name.clone(),
            PluginHandle {
                descriptor,
                pid,
                state,
                stopping,
                veth,
            },
        );

        Ok(pid)
    }

    /// Wait until the plugin's control socket accepts a connection
    ///
    /// Fails as soon as the sandbox exits. A failed plugin is not restarted.
    pub async fn wait_ready(&self, name: &str, timeout: Duration) -> PluginResult<()> {
        let (socket, state) = {
            let handle = self
                .plugins
                .get(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            (handle.descriptor.socket_path.clone(), handle.state.clone())
        };

        let mut changes = state.subscribe();
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let current = changes.borrow_and_update().clone();
            match current {
                PluginState::Running => return Ok(()),
                PluginState::Starting => {}
                terminal => {
                    let failure = terminal
                        .failure()
                        .unwrap_or_else(|| PluginFailure::Lost(terminal.to_string()));
                    return Err(PluginError::StartFailed {
                        name: name.to_string(),
                        failure,
                    });
                }
            }

            if UnixStream::connect(&socket).await.is_ok() {
                state.send_if_modified(|s| {
                    if *s == PluginState::Starting {
                        *s = PluginState::Running;
                        true
                    } else {
                        false
                    }
                });
                // The sandbox may have exited between the probe and the update
                if *state.borrow() == PluginState::Running {
                    info!(
                        plugin = name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Plugin ready"
                    );
                    return Ok(());
                }
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PluginError::ReadyTimeout {
                    name: name.to_string(),
                    waited: now - started,
                });
            }

            let pause = READY_POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = changes.changed() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Open a new connection to a plugin's control socket
    pub async fn connect(&self, name: &str) -> PluginResult<UnixStream> {
        let socket = {
            let handle = self
                .plugins
                .get(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            handle.descriptor.socket_path.clone()
        };

        UnixStream::connect(&socket)
            .await
            .map_err(|source| PluginError::Connect {
                name: name.to_string(),
                source,
            })
    }

    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.plugins
            .get(name)
            .map(|handle| handle.state.borrow().clone())
    }

    pub fn descriptor(&self, name: &str) -> Option<PluginDescriptor> {
        self.plugins.get(name).map(|handle| handle.descriptor.clone())
    }

    /// Status of every plugin, ordered by name
    pub fn snapshot(&self) -> Vec<PluginStatus> {
        let mut statuses: Vec<PluginStatus> = self
            .plugins
            .iter()
            .map(|entry| PluginStatus {
                name: entry.key().clone(),
                pid: entry.pid,
                network: entry.descriptor.network,
                state: entry.state.borrow().clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Terminate one plugin: SIGTERM, then SIGKILL after the grace period
    pub async fn stop(&self, name: &str) -> PluginResult<()> {
        let (pid, state, stopping) = {
            let handle = self
                .plugins
                .get(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            (handle.pid, handle.state.clone(), handle.stopping.clone())
        };

        if !state.borrow().is_terminal() {
            stopping.store(true, Ordering::SeqCst);
            terminate(name, pid, &state, self.settings.shutdown_grace).await;
        }

        self.detach_network(name).await;
        Ok(())
    }

    /// Stop every plugin; calling it again is a no-op
    pub async fn close(&self) {
        let names: Vec<String> = self.plugins.iter().map(|e| e.key().clone()).collect();
        if names.is_empty() {
            return;
        }

        info!(plugins = names.len(), "Closing plugins");
        let stops = names.iter().map(|name| self.stop(name));
        for (name, result) in names.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                warn!(plugin = %name, error = %e, "Failed to stop plugin");
            }
        }
    }

    /// Claim `name` for one `start`; released when the guard drops
    fn reserve(&self, name: &str) -> PluginResult<Reservation<'_>> {
        if !self.starting.insert(name.to_string()) {
            return Err(PluginError::AlreadyStarted(name.to_string()));
        }
        let reservation = Reservation {
            starting: &self.starting,
            name: name.to_string(),
        };
        if self.plugins.contains_key(name) {
            return Err(PluginError::AlreadyStarted(name.to_string()));
        }
        Ok(reservation)
    }

    fn command(&self, descriptor: &PluginDescriptor) -> Command {
        let mut cmd = reexec::command_for(&self.settings.program, &self.settings.entry);
        cmd.current_dir(&descriptor.root)
            .env_remove(CONTROL_SOCKET_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);

        if descriptor.network {
            let wait = &self.settings.network_wait;
            cmd.env(NETWORK_ENV, "1")
                .env(SANDBOX_ADDR_ENV, descriptor.network_spec.sandbox_addr.to_string())
                .env(
                    SANDBOX_GATEWAY_ENV,
                    descriptor.network_spec.host_addr.ip().to_string(),
                )
                .env(SANDBOX_NET_WAIT_ENV, wait.max_wait.as_millis().to_string())
                .env(SANDBOX_NET_POLL_ENV, wait.poll_interval.as_millis().to_string());
        } else {
            cmd.env_remove(NETWORK_ENV);
        }

        if self.settings.unshare {
            unshare_before_exec(&mut cmd, descriptor.network);
        }
        kill_with_host(&mut cmd);

        cmd
    }

    #[cfg(target_os = "linux")]
    async fn attach_network(
        &self,
        descriptor: &PluginDescriptor,
        names: &VethNames,
        pid: Pid,
    ) -> PluginResult<()> {
        let veth = self
            .veth
            .get_or_try_init(|| async { VethManager::connect() })
            .await
            .map_err(|reason| PluginError::Network {
                name: descriptor.name.clone(),
                reason,
            })?;
        veth.attach(&descriptor.name, names, pid, descriptor.network_spec.host_addr)
            .await
    }

    #[cfg(not(target_os = "linux"))]
    async fn attach_network(
        &self,
        descriptor: &PluginDescriptor,
        _names: &VethNames,
        _pid: Pid,
    ) -> PluginResult<()> {
        Err(PluginError::Network {
            name: descriptor.name.clone(),
            reason: "veth pairs are only available on Linux".to_string(),
        })
    }

    async fn detach_network(&self, name: &str) {
        let names = match self.plugins.get_mut(name) {
            Some(mut handle) => handle.veth.take(),
            None => None,
        };
        if let Some(names) = names {
            self.delete_veth(name, &names).await;
        }
    }

    #[cfg(target_os = "linux")]
    async fn delete_veth(&self, name: &str, names: &VethNames) {
        let Some(veth) = self.veth.get() else {
            return;
        };
        match veth.delete_pair(&names.host).await {
            Ok(()) => debug!(plugin = name, iface = %names.host, "Host veth removed"),
            // The kernel drops the pair along with the sandbox's namespace
            Err(e) => debug!(plugin = name, iface = %names.host, error = %e, "Host veth already gone"),
        }
    }

    #[cfg(not(target_os = "linux"))]
    async fn delete_veth(&self, _name: &str, _names: &VethNames) {}
}

#[cfg(target_os = "linux")]
fn unshare_before_exec(cmd: &mut Command, network: bool) {
    let flags = namespace_flags(network);
    // SAFETY: unshare(2) is async-signal-safe and touches no allocator state
    unsafe {
        cmd.pre_exec(move || nix::sched::unshare(flags).map_err(io::Error::from));
    }
}

#[cfg(not(target_os = "linux"))]
fn unshare_before_exec(_cmd: &mut Command, _network: bool) {
    warn!("Namespaces are only available on Linux, spawning without unshare");
}

/// SIGKILL the sandbox if the spawning thread dies; runtime workers live as long as the host
#[cfg(target_os = "linux")]
fn kill_with_host(cmd: &mut Command) {
    // SAFETY: prctl(2) is async-signal-safe and allocates nothing
    unsafe {
        cmd.pre_exec(|| nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).map_err(io::Error::from));
    }
}

#[cfg(not(target_os = "linux"))]
fn kill_with_host(_cmd: &mut Command) {}

#[cfg(target_os = "linux")]
fn namespace_flags(network: bool) -> CloneFlags {
    if network {
        CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWNET
    } else {
        CloneFlags::CLONE_NEWNS
    }
}

fn remove_stale_socket(descriptor: &PluginDescriptor) -> PluginResult<()> {
    match std::fs::remove_file(&descriptor.socket_path) {
        Ok(()) => {
            debug!(
                plugin = %descriptor.name,
                socket = %descriptor.socket_path.display(),
                "Removed stale control socket"
            );
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PluginError::InvalidDescriptor {
            name: descriptor.name.clone(),
            reason: format!(
                "cannot remove stale socket {}: {}",
                descriptor.socket_path.display(),
                e
            ),
        }),
    }
}

/// Map the sandbox's exit status onto the exit-code contract
fn exit_class(status: ExitStatus) -> ExitClass {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitClass::from_code(code),
        (None, Some(signal)) => ExitClass::Signaled(signal),
        (None, None) => ExitClass::Plugin(-1),
    }
}

async fn watch_sandbox(
    name: String,
    mut child: Child,
    state: Arc<watch::Sender<PluginState>>,
    stopping: Arc<AtomicBool>,
) {
    let terminal = match child.wait().await {
        Ok(_) if stopping.load(Ordering::SeqCst) => PluginState::Stopped,
        Ok(status) => PluginState::from_exit(exit_class(status)),
        Err(e) => PluginState::Failed(PluginFailure::Lost(e.to_string())),
    };

    match &terminal {
        PluginState::Stopped | PluginState::Exited(0) => {
            info!(plugin = %name, state = %terminal, "Plugin sandbox finished")
        }
        _ => warn!(plugin = %name, state = %terminal, "Plugin sandbox finished"),
    }
    state.send_replace(terminal);
}

async fn terminate(
    name: &str,
    pid: Pid,
    state: &watch::Sender<PluginState>,
    grace: Duration,
) {
    let target = nix::unistd::Pid::from_raw(pid as i32);
    let mut changes = state.subscribe();

    debug!(plugin = name, pid, "Sending SIGTERM");
    if let Err(e) = kill(target, Signal::SIGTERM) {
        debug!(plugin = name, pid, error = %e, "SIGTERM not delivered");
    }

    if tokio::time::timeout(grace, changes.wait_for(PluginState::is_terminal))
        .await
        .is_ok()
    {
        return;
    }

    warn!(plugin = name, pid, grace_ms = grace.as_millis() as u64, "Grace period elapsed, sending SIGKILL");
    if let Err(e) = kill(target, Signal::SIGKILL) {
        debug!(plugin = name, pid, error = %e, "SIGKILL not delivered");
    }
    if tokio::time::timeout(grace, changes.wait_for(PluginState::is_terminal))
        .await
        .is_err()
    {
        error!(plugin = name, pid, "Sandbox did not exit after SIGKILL");
    }
}
