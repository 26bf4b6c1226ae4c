/*!
 * Core Module
 * Constants, shared types and host-level errors
 */

pub mod errors;
pub mod limits;
pub mod types;

pub use errors::{HostError, HostResult};
pub use types::{ExitClass, Pid};
