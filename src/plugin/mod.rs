/*!
 * Plugin Management
 * Host-side lifecycle of sandboxed plugins
 */

pub mod manager;
pub mod types;

#[cfg(target_os = "linux")]
pub mod veth;

pub use manager::{LauncherSettings, PluginManager};
pub use types::*;

#[cfg(target_os = "linux")]
pub use veth::VethManager;
