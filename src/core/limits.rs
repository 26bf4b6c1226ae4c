/*!
 * System Limits and Constants
 *
 * Centralized location for the fixed paths, environment contract, exit codes
 * and timeouts shared by the host and the sandbox processes it spawns.
 *
 * Values marked [CONTRACT] are part of the boundary between the plugin manager,
 * the re-entered sandbox process and the plugin binary; changing one side
 * without the other breaks running plugins.
 */

use std::time::Duration;

// =============================================================================
// RE-ENTRY
// =============================================================================

/// Registered re-entry name for the sandbox bootstrap
/// [CONTRACT] Passed as argv[0] when the manager re-executes this binary
pub const PLUGIN_NAMESPACE_ENTRY: &str = "pluginNamespace";

/// Path used to re-execute the running binary
pub const SELF_EXE: &str = "/proc/self/exe";

// =============================================================================
// SANDBOX FILESYSTEM
// =============================================================================

/// Plugin binary location inside the pivoted root
/// [CONTRACT]
pub const PLUGIN_BINARY_PATH: &str = "/plugin";

/// Plugin binary name relative to the plugin root on the host
pub const PLUGIN_BINARY_NAME: &str = "plugin";

/// Control socket location inside the pivoted root
/// [CONTRACT]
pub const CONTROL_SOCKET_PATH: &str = "/grpc.sock";

/// Control socket name relative to the plugin root on the host
pub const CONTROL_SOCKET_NAME: &str = "grpc.sock";

/// Mount point for the host /proc, relative to the new root
pub const PROC_DIR_NAME: &str = "proc";

/// Staging directory for the old root during pivot, relative to the new root
pub const OLD_ROOT_DIR_NAME: &str = ".pivot_root";

// =============================================================================
// ENVIRONMENT CONTRACT
// =============================================================================

/// Any non-empty value enables network bootstrap in the sandbox
/// [CONTRACT]
pub const NETWORK_ENV: &str = "NETWORK";

/// Injected into the plugin environment, points at the control socket
/// [CONTRACT]
pub const CONTROL_SOCKET_ENV: &str = "UNIXSOCKET";

/// Sandbox interface address in CIDR form
pub const SANDBOX_ADDR_ENV: &str = "SANDBOX_ADDR";

/// Default gateway for the sandbox (empty disables the default route)
pub const SANDBOX_GATEWAY_ENV: &str = "SANDBOX_GATEWAY";

/// Upper bound on the network wait, in milliseconds
pub const SANDBOX_NET_WAIT_ENV: &str = "SANDBOX_NET_WAIT_MS";

/// Interval between link probes, in milliseconds
pub const SANDBOX_NET_POLL_ENV: &str = "SANDBOX_NET_POLL_MS";

/// Enables JSON log output
pub const TRACE_JSON_ENV: &str = "PLUGINBOX_TRACE_JSON";

// =============================================================================
// NETWORK DEFAULTS
// =============================================================================

/// Default sandbox-side address
pub const DEFAULT_SANDBOX_ADDR: &str = "10.10.10.2/24";

/// Default host-side address (also the sandbox gateway)
pub const DEFAULT_HOST_ADDR: &str = "10.10.10.1/24";

/// Default maximum wait for a usable interface (10s)
/// [SECURITY] A misconfigured namespace must not hang the sandbox forever
pub const DEFAULT_NETWORK_WAIT: Duration = Duration::from_secs(10);

/// Default link probe interval (100ms)
pub const DEFAULT_NETWORK_POLL: Duration = Duration::from_millis(100);

/// Loopback interface name
pub const LOOPBACK_IFACE: &str = "lo";

/// Linux interface name limit (IFNAMSIZ - 1)
pub const MAX_IFACE_NAME_LEN: usize = 15;

// =============================================================================
// HOST LIFECYCLE
// =============================================================================

/// Default wait for a plugin control socket to accept connections (30s)
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between control socket readiness probes (50ms)
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default SIGTERM grace period before a sandbox is killed (5s)
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Default status server listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

// =============================================================================
// EXIT CODES
// =============================================================================

/// Sandbox preparation failed (mount, pivot, network)
/// [CONTRACT] Distinguishes misconfiguration from plugin failures
pub const EXIT_SETUP_FAILURE: i32 = 125;

/// Plugin binary exists but could not be executed
pub const EXIT_LAUNCH_FAILURE: i32 = 126;

/// Plugin binary not found
pub const EXIT_PLUGIN_NOT_FOUND: i32 = 127;

/// Offset added to the signal number when the plugin was killed
pub const EXIT_SIGNAL_BASE: i32 = 128;

/// Host startup failure
pub const EXIT_HOST_FAILURE: i32 = 1;
