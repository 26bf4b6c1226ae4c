/*!
 * Sandbox Types
 * Errors, lifecycle states and environment of one sandbox process
 */

use crate::core::limits::{
    EXIT_LAUNCH_FAILURE, EXIT_PLUGIN_NOT_FOUND, EXIT_SETUP_FAILURE, EXIT_SIGNAL_BASE, NETWORK_ENV,
};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Sandbox operation result
///
/// # Must Use
/// Every sandbox error is fatal to the sandbox process and must reach the dispatcher
#[must_use = "sandbox operations can fail and must be handled"]
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Failure category, decides the sandbox exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Mount, pivot or network preparation
    Setup,
    /// Plugin binary missing or not executable
    Launch,
}

/// Errors raised while preparing or supervising a sandbox
#[derive(Error, Debug, Diagnostic)]
pub enum SandboxError {
    #[error("Invalid sandbox root {path}: {reason}")]
    #[diagnostic(
        code(sandbox::invalid_target),
        help("The plugin root must be an existing, writable directory.")
    )]
    InvalidTarget { path: PathBuf, reason: String },

    #[error("Sandbox shares its mount namespace with its parent")]
    #[diagnostic(
        code(sandbox::shared_mount_namespace),
        help("The re-entry must be spawned with a new mount namespace (CLONE_NEWNS).")
    )]
    SharedMountNamespace,

    #[error("Failed to inspect namespace link {path}")]
    #[diagnostic(code(sandbox::namespace_probe))]
    NamespaceProbe {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Mount operation '{operation}' on {target} failed")]
    #[diagnostic(
        code(sandbox::mount_failed),
        help("Mounting requires CAP_SYS_ADMIN in the sandbox's mount namespace.")
    )]
    Mount {
        operation: &'static str,
        target: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("pivot_root into {new_root} failed")]
    #[diagnostic(
        code(sandbox::pivot_failed),
        help("The new root must be a mount point and must not be on the same mount as the current root.")
    )]
    Pivot {
        new_root: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("Invalid value {value:?} for {var}: {reason}")]
    #[diagnostic(code(sandbox::invalid_setting))]
    Settings {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("No usable network interface after {waited:?}")]
    #[diagnostic(
        code(sandbox::network_timeout),
        help("The host side must move a veth peer into the sandbox network namespace.")
    )]
    NetworkTimeout { waited: Duration },

    #[error("Network operation failed: {0}")]
    #[diagnostic(code(sandbox::network))]
    Network(String),

    #[error("Failed to build network runtime")]
    #[diagnostic(code(sandbox::runtime))]
    Runtime(#[source] io::Error),

    #[error("Failed to launch plugin {path}")]
    #[diagnostic(
        code(sandbox::launch_failed),
        help("The plugin binary must exist inside the plugin root and be executable.")
    )]
    Launch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wait for plugin {path}")]
    #[diagnostic(code(sandbox::wait_failed))]
    Wait {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Platform not supported: {0}")]
    #[diagnostic(code(sandbox::platform))]
    PlatformNotSupported(String),
}

impl SandboxError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SandboxError::Launch { .. } | SandboxError::Wait { .. } => FailureKind::Launch,
            _ => FailureKind::Setup,
        }
    }

    /// Exit code the sandbox process terminates with
    pub fn exit_code(&self) -> i32 {
        match self {
            SandboxError::Launch { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                EXIT_PLUGIN_NOT_FOUND
            }
            SandboxError::Launch { .. } | SandboxError::Wait { .. } => EXIT_LAUNCH_FAILURE,
            _ => EXIT_SETUP_FAILURE,
        }
    }
}

/// How the plugin binary terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum PluginExit {
    Exited(i32),
    Signaled(i32),
}

impl PluginExit {
    pub fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => PluginExit::Exited(code),
            (None, Some(signal)) => PluginExit::Signaled(signal),
            // Neither code nor signal only happens for stopped children
            (None, None) => PluginExit::Exited(EXIT_LAUNCH_FAILURE),
        }
    }

    /// Exit code propagated by the sandbox process
    pub fn exit_code(&self) -> i32 {
        match *self {
            PluginExit::Exited(code) => code,
            PluginExit::Signaled(signal) => EXIT_SIGNAL_BASE + signal,
        }
    }

    #[inline]
    pub fn success(&self) -> bool {
        matches!(self, PluginExit::Exited(0))
    }
}

impl fmt::Display for PluginExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginExit::Exited(code) => write!(f, "exited with code {}", code),
            PluginExit::Signaled(signal) => write!(f, "killed by signal {}", signal),
        }
    }
}

/// Lifecycle of one sandbox process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Spawned,
    ProcMounted,
    RootPivoted,
    NetworkReady,
    PluginRunning,
    PluginExited(PluginExit),
    SetupFailed(FailureKind),
}

impl SandboxState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SandboxState::PluginExited(_) | SandboxState::SetupFailed(_)
        )
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxState::Spawned => f.write_str("spawned"),
            SandboxState::ProcMounted => f.write_str("proc_mounted"),
            SandboxState::RootPivoted => f.write_str("root_pivoted"),
            SandboxState::NetworkReady => f.write_str("network_ready"),
            SandboxState::PluginRunning => f.write_str("plugin_running"),
            SandboxState::PluginExited(exit) => write!(f, "plugin_exited({})", exit),
            SandboxState::SetupFailed(kind) => write!(f, "setup_failed({:?})", kind),
        }
    }
}

/// Inputs the sandbox process reads at start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEnv {
    /// Working directory at spawn time, becomes the new root
    pub root: PathBuf,
    /// Whether network bootstrap was requested
    pub network: bool,
}

impl SandboxEnv {
    pub fn from_env() -> SandboxResult<Self> {
        let root = std::env::current_dir().map_err(|e| SandboxError::InvalidTarget {
            path: PathBuf::from("."),
            reason: format!("cannot read working directory: {}", e),
        })?;
        let network = network_requested(std::env::var_os(NETWORK_ENV).as_deref());
        Ok(Self { root, network })
    }
}

/// `NETWORK` semantics: any non-empty value enables networking
pub fn network_requested(value: Option<&OsStr>) -> bool {
    value.map(|v| !v.is_empty()).unwrap_or(false)
}
