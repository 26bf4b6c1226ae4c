/*!
 * Pluginbox Library
 * Plugin host and sandbox launcher exposed as a library
 */

pub mod core;
pub mod host;
pub mod monitoring;
pub mod plugin;
pub mod reexec;
pub mod sandbox;

// Re-exports
pub use crate::core::{ExitClass, HostError, HostResult, Pid};
pub use host::{HostConfig, StatusServer};
pub use monitoring::{init_tracing, TracingOptions};
pub use plugin::{LauncherSettings, PluginDescriptor, PluginManager, PluginState};
pub use sandbox::{plugin_namespace, SandboxError, SandboxResult};
