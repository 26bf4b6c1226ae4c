/*!
 * Re-entry Dispatch
 * Lets one binary act as both the host server and the in-sandbox bootstrap
 *
 * A re-entry is this same executable started with argv[0] set to a
 * registered name. `main` consults the registry before doing anything else;
 * a match runs the entry function and exits with its code, so the re-entered
 * process never reaches host startup.
 */

use crate::core::limits::{PLUGIN_NAMESPACE_ENTRY, SELF_EXE};
use crate::sandbox::plugin_namespace;
use miette::Diagnostic;
use std::ffi::OsStr;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Entry function of a re-entry; the return value is the process exit code
pub type EntryFn = fn() -> i32;

#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum ReexecError {
    #[error("Re-entry name {0:?} is already registered")]
    #[diagnostic(code(reexec::duplicate))]
    Duplicate(&'static str),

    #[error("Re-entry name must not be empty")]
    #[diagnostic(code(reexec::empty_name))]
    EmptyName,
}

/// Table of re-entry names
#[derive(Debug, Default, Clone)]
pub struct Registry {
    entries: Vec<(&'static str, EntryFn)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, entry: EntryFn) -> Result<(), ReexecError> {
        if name.is_empty() {
            return Err(ReexecError::EmptyName);
        }
        if self.entries.iter().any(|(existing, _)| *existing == name) {
            return Err(ReexecError::Duplicate(name));
        }
        self.entries.push((name, entry));
        Ok(())
    }

    /// Entry registered under exactly `argv0`
    pub fn lookup(&self, argv0: &OsStr) -> Option<EntryFn> {
        self.entries
            .iter()
            .find(|(name, _)| OsStr::new(name) == argv0)
            .map(|(_, entry)| *entry)
    }

    /// Run the matching entry, `None` when this is a normal invocation
    pub fn dispatch(&self, argv0: Option<&OsStr>) -> Option<i32> {
        let entry = self.lookup(argv0?)?;
        Some(entry())
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(name, _)| *name)
    }
}

/// The process-wide registry
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    if let Err(e) = registry.register(PLUGIN_NAMESPACE_ENTRY, plugin_namespace) {
        unreachable!("static re-entry table is inconsistent: {}", e);
    }
    registry
}

/// Dispatch on this process's argv[0]
///
/// Must run before any other start-up logic. Returns the exit code when the
/// invocation was a re-entry.
pub fn init() -> Option<i32> {
    let argv0 = std::env::args_os().next();
    registry().dispatch(argv0.as_deref())
}

/// Command that re-executes this binary under `name`
pub fn command(name: &str) -> tokio::process::Command {
    command_for(Path::new(SELF_EXE), name)
}

/// Command that starts `program` with argv[0] set to `name`
pub fn command_for(program: &Path, name: &str) -> tokio::process::Command {
    debug!(program = %program.display(), entry = name, "Preparing re-entry command");
    let mut cmd = tokio::process::Command::new(program);
    cmd.arg0(name);
    cmd
}
