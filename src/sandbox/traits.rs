/*!
 * Sandbox Traits
 * The phases a sandbox process runs through, in order
 */

use super::types::{PluginExit, SandboxResult};
use std::path::Path;

/// Operations performed inside a freshly spawned sandbox process
///
/// Each phase is a precondition for the next; implementations may assume
/// they are called in declaration order and at most once.
#[cfg_attr(test, mockall::automock)]
pub trait SandboxPhases {
    /// Bind the host /proc into `root/proc`
    fn mount_proc(&mut self, root: &Path) -> SandboxResult<()>;

    /// Make `root` the filesystem root and discard the old one
    fn pivot_root(&mut self, root: &Path) -> SandboxResult<()>;

    /// Wait for and configure the namespace's network
    fn bootstrap_network(&mut self) -> SandboxResult<()>;

    /// Run the plugin binary to completion
    fn launch_plugin(&mut self) -> SandboxResult<PluginExit>;
}
