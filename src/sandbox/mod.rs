/*!
 * Plugin Sandbox
 * Everything that runs inside a re-entered sandbox process
 *
 * The plugin manager spawns this binary again with new mount (and optionally
 * network) namespaces. The re-entry then swaps its root to the plugin
 * directory, finishes network set-up when asked to, and supervises the
 * plugin binary until it exits.
 */

pub mod bootstrap;
pub mod mounts;
pub mod network;
pub mod supervisor;
pub mod traits;
pub mod types;

pub use bootstrap::{exit_code, plugin_namespace, LinuxPhases, SandboxProcess};
pub use network::{wait_for_network, LinkSnapshot, NetworkSettings, WaitPolicy};
pub use supervisor::{PluginSupervisor, SupervisorConfig};
pub use traits::SandboxPhases;
pub use types::*;
