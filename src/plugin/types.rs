/*!
 * Plugin Types
 * Descriptors, lifecycle states and errors of the plugin manager
 */

use crate::core::limits::{CONTROL_SOCKET_NAME, MAX_IFACE_NAME_LEN, PLUGIN_BINARY_NAME};
use crate::core::types::{ExitClass, Pid};
use crate::sandbox::network::{default_host_addr, default_sandbox_addr};
use ipnetwork::IpNetwork;
use miette::Diagnostic;
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Plugin operation result
#[must_use = "plugin operations can fail and must be handled"]
pub type PluginResult<T> = Result<T, PluginError>;

/// Plugin manager errors
#[derive(Error, Debug, Diagnostic)]
pub enum PluginError {
    #[error("Invalid plugin {name}: {reason}")]
    #[diagnostic(
        code(plugin::invalid_descriptor),
        help("Each plugin needs a unique name and a root directory containing a `plugin` binary.")
    )]
    InvalidDescriptor { name: String, reason: String },

    #[error("Plugin {0} is already started")]
    #[diagnostic(code(plugin::already_started))]
    AlreadyStarted(String),

    #[error("Plugin {0} not found")]
    #[diagnostic(code(plugin::not_found))]
    NotFound(String),

    #[error("Failed to spawn sandbox for plugin {name}")]
    #[diagnostic(
        code(plugin::spawn_failed),
        help("Creating namespaces requires CAP_SYS_ADMIN (and CAP_NET_ADMIN for networked plugins).")
    )]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Plugin {name} failed to start: {failure}")]
    #[diagnostic(
        code(plugin::start_failed),
        help("Check the sandbox log lines above; setup failures exit with 125.")
    )]
    StartFailed { name: String, failure: PluginFailure },

    #[error("Plugin {name} control socket not ready after {waited:?}")]
    #[diagnostic(code(plugin::ready_timeout))]
    ReadyTimeout { name: String, waited: Duration },

    #[error("Network set-up for plugin {name} failed: {reason}")]
    #[diagnostic(code(plugin::network))]
    Network { name: String, reason: String },

    #[error("Failed to connect to plugin {name} control socket")]
    #[diagnostic(code(plugin::connect_failed))]
    Connect {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Addresses of the veth pair serving one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Host end, also the sandbox's default gateway
    #[serde(default = "default_host_addr")]
    pub host_addr: IpNetwork,
    /// Sandbox end
    #[serde(default = "default_sandbox_addr")]
    pub sandbox_addr: IpNetwork,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            host_addr: default_host_addr(),
            sandbox_addr: default_sandbox_addr(),
        }
    }
}

/// Identity and placement of one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    /// Directory that becomes the sandbox root
    pub root: PathBuf,
    /// Give the sandbox its own network namespace with a veth link
    pub network: bool,
    /// Host view of the control socket (`/grpc.sock` inside the sandbox)
    pub socket_path: PathBuf,
    pub network_spec: NetworkSpec,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, network: bool) -> Self {
        let root = root.into().clean();
        let socket_path = root.join(CONTROL_SOCKET_NAME);
        Self {
            name: name.into(),
            root,
            network,
            socket_path,
            network_spec: NetworkSpec::default(),
        }
    }

    pub fn with_network_spec(mut self, spec: NetworkSpec) -> Self {
        self.network_spec = spec;
        self
    }

    /// Host path of the plugin binary
    pub fn binary_path(&self) -> PathBuf {
        self.root.join(PLUGIN_BINARY_NAME)
    }

    /// Check the descriptor before anything is spawned
    pub fn validate(&self) -> PluginResult<()> {
        let invalid = |reason: String| PluginError::InvalidDescriptor {
            name: self.name.clone(),
            reason,
        };

        if !valid_name(&self.name) {
            return Err(invalid(
                "names use ASCII letters, digits, '-' and '_' only".to_string(),
            ));
        }
        if !self.root.is_absolute() {
            return Err(invalid(format!(
                "root {} must be absolute",
                self.root.display()
            )));
        }
        if !self.root.is_dir() {
            return Err(invalid(format!(
                "root {} is not a directory",
                self.root.display()
            )));
        }
        if !self.binary_path().is_file() {
            return Err(invalid(format!(
                "missing plugin binary {}",
                self.binary_path().display()
            )));
        }
        if self.network && self.network_spec.host_addr.ip() == self.network_spec.sandbox_addr.ip()
        {
            return Err(invalid(
                "host and sandbox addresses must differ".to_string(),
            ));
        }
        if self.network && !self.network_spec.host_addr.is_ipv4() {
            // The host address doubles as the sandbox's IPv4 default gateway
            return Err(invalid(format!(
                "host address {} must be IPv4",
                self.network_spec.host_addr
            )));
        }
        Ok(())
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Why a plugin did not reach or stay in the running state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum PluginFailure {
    /// Sandbox preparation failed (exit 125)
    Setup,
    /// Plugin binary could not be started (exit 126/127)
    Launch(i32),
    /// Plugin exited with this code
    Exited(i32),
    /// Plugin or sandbox was killed by this signal
    Signaled(i32),
    /// Stopped by the manager
    Stopped,
    /// The sandbox process could not be observed
    Lost(String),
}

impl fmt::Display for PluginFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginFailure::Setup => f.write_str("sandbox setup failed"),
            PluginFailure::Launch(code) => {
                write!(f, "plugin binary could not start (exit {})", code)
            }
            PluginFailure::Exited(code) => write!(f, "plugin exited with code {}", code),
            PluginFailure::Signaled(signal) => write!(f, "killed by signal {}", signal),
            PluginFailure::Stopped => f.write_str("stopped"),
            PluginFailure::Lost(reason) => write!(f, "sandbox lost: {}", reason),
        }
    }
}

/// Lifecycle of a plugin as seen by the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum PluginState {
    /// Sandbox spawned, control socket not yet accepting
    Starting,
    /// Control socket accepted a connection
    Running,
    /// Plugin ran and exited with this code
    Exited(i32),
    Failed(PluginFailure),
    /// Terminated by the manager
    Stopped,
}

impl PluginState {
    /// Terminal state for a sandbox that exited on its own
    pub fn from_exit(class: ExitClass) -> Self {
        match class {
            ExitClass::Success => PluginState::Exited(0),
            ExitClass::Plugin(code) => PluginState::Exited(code),
            ExitClass::Setup => PluginState::Failed(PluginFailure::Setup),
            ExitClass::Launch(code) => PluginState::Failed(PluginFailure::Launch(code)),
            ExitClass::Signaled(signal) => PluginState::Failed(PluginFailure::Signaled(signal)),
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PluginState::Exited(_) | PluginState::Failed(_) | PluginState::Stopped
        )
    }

    /// Why the plugin is unusable, `None` while it is starting or running
    pub fn failure(&self) -> Option<PluginFailure> {
        match self {
            PluginState::Exited(code) => Some(PluginFailure::Exited(*code)),
            PluginState::Failed(failure) => Some(failure.clone()),
            PluginState::Stopped => Some(PluginFailure::Stopped),
            PluginState::Starting | PluginState::Running => None,
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginState::Starting => f.write_str("starting"),
            PluginState::Running => f.write_str("running"),
            PluginState::Exited(code) => write!(f, "exited({})", code),
            PluginState::Failed(failure) => write!(f, "failed: {}", failure),
            PluginState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Snapshot entry served by the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStatus {
    pub name: String,
    pub pid: Pid,
    pub network: bool,
    pub state: PluginState,
}

/// Interface names of the veth pair for a sandbox pid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethNames {
    pub host: String,
    pub peer: String,
}

impl VethNames {
    pub fn for_pid(pid: Pid) -> Self {
        let names = Self {
            host: format!("pbh{}", pid),
            peer: format!("pbs{}", pid),
        };
        debug_assert!(names.host.len() <= MAX_IFACE_NAME_LEN);
        names
    }
}
