/*!
 * Structured Tracing
 * Subscriber set-up shared by the host and the sandbox processes
 *
 * All output goes to stderr: a sandbox process shares its stdout with the
 * plugin binary and must not interleave log lines with plugin output.
 */

use crate::core::limits::TRACE_JSON_ENV;
use tracing::debug;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Tracing options derived from configuration and environment
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingOptions {
    /// Raise the default level to debug and report file/line
    pub debug: bool,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl TracingOptions {
    /// Options for the given debug flag, JSON taken from the environment
    pub fn from_env(debug: bool) -> Self {
        let json = std::env::var(TRACE_JSON_ENV)
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);
        Self { debug, json }
    }

    fn default_directive(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info, or debug when `options.debug`)
/// - PLUGINBOX_TRACE_JSON: Enable JSON output (default: false)
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(options: TracingOptions) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_directive()));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if options.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_line_number(options.debug)
                    .with_file(options.debug)
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_line_number(options.debug)
                    .with_file(options.debug)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
    };

    if result.is_ok() {
        debug!(json = options.json, debug = options.debug, "Structured tracing initialized");
    }
}
