/*!
 * Monitoring
 * Structured logging set-up
 */

mod tracer;

pub use tracer::{init_tracing, TracingOptions};
