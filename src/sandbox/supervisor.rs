/*!
 * Plugin Process Supervisor
 * Runs the plugin binary with inherited stdio and the control socket location
 */

use super::types::{PluginExit, SandboxError, SandboxResult};
use crate::core::limits::{CONTROL_SOCKET_ENV, CONTROL_SOCKET_PATH, PLUGIN_BINARY_PATH};
use nix::sys::signal::{signal, SigHandler, Signal};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, info, warn};

/// Signals relayed from the sandbox process to the running plugin
const FORWARDED_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP];

/// Pid of the running plugin, read from the signal handler
static PLUGIN_PID: AtomicI32 = AtomicI32::new(0);

/// What to run once the sandbox is ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Plugin binary, resolved inside the pivoted root
    pub binary: PathBuf,
    /// Value injected as `UNIXSOCKET`
    pub socket_path: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(PLUGIN_BINARY_PATH),
            socket_path: PathBuf::from(CONTROL_SOCKET_PATH),
        }
    }
}

/// Launches and waits on the plugin binary
#[derive(Debug, Clone, Default)]
pub struct PluginSupervisor {
    config: SupervisorConfig,
}

impl PluginSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        // Full environment is inherited, only the socket location is added
        cmd.env(CONTROL_SOCKET_ENV, &self.config.socket_path)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        kill_with_parent(&mut cmd);
        cmd
    }

    /// Spawn the plugin and block until it exits
    pub fn run(&self) -> SandboxResult<PluginExit> {
        let binary = &self.config.binary;

        let mut child = self.command().spawn().map_err(|source| SandboxError::Launch {
            path: binary.clone(),
            source,
        })?;

        info!(
            binary = %binary.display(),
            pid = child.id(),
            socket = %self.config.socket_path.display(),
            "Plugin started"
        );

        forward_signals(child.id() as i32);
        let status = child.wait();
        restore_signals();
        let status = status.map_err(|source| SandboxError::Wait {
            path: binary.clone(),
            source,
        })?;

        let exit = PluginExit::from_status(status);
        if exit.success() {
            info!(binary = %binary.display(), "Plugin exited cleanly");
        } else {
            warn!(binary = %binary.display(), %exit, "Plugin failed");
        }
        Ok(exit)
    }
}

/// Kill the plugin when the sandbox process goes away
#[cfg(target_os = "linux")]
fn kill_with_parent(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: prctl(2) is async-signal-safe and allocates nothing
    unsafe {
        cmd.pre_exec(|| nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).map_err(std::io::Error::from));
    }
}

#[cfg(not(target_os = "linux"))]
fn kill_with_parent(_cmd: &mut Command) {}

extern "C" fn relay_signal(sig: nix::libc::c_int) {
    let pid = PLUGIN_PID.load(Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: kill(2) is async-signal-safe
        unsafe {
            nix::libc::kill(pid, sig);
        }
    }
}

/// Relay termination requests to the plugin while the sandbox waits on it
fn forward_signals(pid: i32) {
    PLUGIN_PID.store(pid, Ordering::SeqCst);
    for sig in FORWARDED_SIGNALS {
        // SAFETY: the handler only reads an atomic and calls kill(2)
        if let Err(e) = unsafe { signal(sig, SigHandler::Handler(relay_signal)) } {
            debug!(signal = %sig, error = %e, "Failed to install signal relay");
        }
    }
}

fn restore_signals() {
    for sig in FORWARDED_SIGNALS {
        // SAFETY: restoring the default disposition
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
    }
    PLUGIN_PID.store(0, Ordering::SeqCst);
}
