/*!
 * Core Types
 * Common types used across the host and sandbox
 */

use super::limits::{EXIT_LAUNCH_FAILURE, EXIT_PLUGIN_NOT_FOUND, EXIT_SETUP_FAILURE, EXIT_SIGNAL_BASE};
use serde::{Deserialize, Serialize};

/// OS process ID type
pub type Pid = u32;

/// How a sandbox process ended, as seen from its exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "code")]
pub enum ExitClass {
    /// Exit status 0
    Success,
    /// Namespace preparation or network bootstrap failed
    Setup,
    /// The plugin binary could not be started
    Launch(i32),
    /// The plugin was killed by a signal
    Signaled(i32),
    /// The plugin ran and exited non-zero
    Plugin(i32),
}

impl ExitClass {
    /// Classify a raw exit code produced by a sandbox process
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ExitClass::Success,
            EXIT_SETUP_FAILURE => ExitClass::Setup,
            EXIT_LAUNCH_FAILURE | EXIT_PLUGIN_NOT_FOUND => ExitClass::Launch(code),
            c if c > EXIT_SIGNAL_BASE && c < EXIT_SIGNAL_BASE + 65 => {
                ExitClass::Signaled(c - EXIT_SIGNAL_BASE)
            }
            c => ExitClass::Plugin(c),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, ExitClass::Success)
    }
}
