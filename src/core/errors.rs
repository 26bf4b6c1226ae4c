/*!
 * Error Types
 * Host-level error aggregation with thiserror and miette
 */

use miette::Diagnostic;
use thiserror::Error;

// Re-export module errors
pub use crate::host::config::ConfigError;
pub use crate::plugin::types::PluginError;
pub use crate::sandbox::types::SandboxError;

/// Host operation result
#[must_use = "host operations can fail and must be handled"]
pub type HostResult<T> = Result<T, HostError>;

/// Errors that abort host startup or the serving loop
#[derive(Error, Debug, Diagnostic)]
pub enum HostError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Plugin(#[from] PluginError),

    #[error("Provider {role} could not be constructed: {reason}")]
    #[diagnostic(
        code(host::provider_unavailable),
        help("The plugin backing this provider must be configured and running.")
    )]
    Provider { role: &'static str, reason: String },

    #[error("Failed to bind status server on {addr}")]
    #[diagnostic(
        code(host::bind_failed),
        help("Check that the listen address is free and valid.")
    )]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    #[diagnostic(code(host::server))]
    Server(#[from] std::io::Error),
}
