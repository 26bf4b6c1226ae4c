/*!
 * Sandbox Bootstrap
 * Runs the preparation phases in order and tracks the sandbox state machine
 *
 * Spawned → ProcMounted → RootPivoted → [NetworkReady] → PluginRunning
 *   → PluginExited(exit) | SetupFailed(kind)
 */

use super::mounts;
use super::network::{self, NetworkSettings};
use super::supervisor::PluginSupervisor;
use super::traits::SandboxPhases;
use super::types::{PluginExit, SandboxEnv, SandboxResult, SandboxState};
use crate::monitoring::{init_tracing, TracingOptions};
use std::path::Path;
use tracing::{debug, error, info, info_span};

/// One sandbox process driving its phases
pub struct SandboxProcess<P> {
    env: SandboxEnv,
    phases: P,
    state: SandboxState,
    history: Vec<SandboxState>,
}

impl<P: SandboxPhases> SandboxProcess<P> {
    pub fn new(env: SandboxEnv, phases: P) -> Self {
        Self {
            env,
            phases,
            state: SandboxState::Spawned,
            history: vec![SandboxState::Spawned],
        }
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Every state entered so far, oldest first
    pub fn history(&self) -> &[SandboxState] {
        &self.history
    }

    pub fn into_phases(self) -> P {
        self.phases
    }

    /// Run all phases; the first error ends the sequence
    pub fn run(&mut self) -> SandboxResult<PluginExit> {
        match self.advance() {
            Ok(exit) => {
                self.transition(SandboxState::PluginExited(exit));
                Ok(exit)
            }
            Err(e) => {
                self.transition(SandboxState::SetupFailed(e.kind()));
                Err(e)
            }
        }
    }

    fn advance(&mut self) -> SandboxResult<PluginExit> {
        let root = self.env.root.clone();

        self.phases.mount_proc(&root)?;
        self.transition(SandboxState::ProcMounted);

        self.phases.pivot_root(&root)?;
        self.transition(SandboxState::RootPivoted);

        if self.env.network {
            self.phases.bootstrap_network()?;
            self.transition(SandboxState::NetworkReady);
        } else {
            debug!("Network not requested, bootstrap skipped");
        }

        self.transition(SandboxState::PluginRunning);
        self.phases.launch_plugin()
    }

    fn transition(&mut self, next: SandboxState) {
        debug!(from = %self.state, to = %next, "Sandbox state transition");
        self.state = next;
        self.history.push(next);
    }
}

/// Exit code for the outcome of [`SandboxProcess::run`]
pub fn exit_code(result: &SandboxResult<PluginExit>) -> i32 {
    match result {
        Ok(exit) => exit.exit_code(),
        Err(e) => e.exit_code(),
    }
}

/// Phases backed by real mounts, netlink and process spawning
#[derive(Debug, Default)]
pub struct LinuxPhases {
    supervisor: PluginSupervisor,
}

impl LinuxPhases {
    pub fn new(supervisor: PluginSupervisor) -> Self {
        Self { supervisor }
    }
}

impl SandboxPhases for LinuxPhases {
    fn mount_proc(&mut self, root: &Path) -> SandboxResult<()> {
        mounts::ensure_private_mount_namespace()?;
        let root = mounts::validate_target(root)?;
        mounts::make_mounts_private()?;
        mounts::mount_proc(&root)
    }

    fn pivot_root(&mut self, root: &Path) -> SandboxResult<()> {
        let root = mounts::validate_target(root)?;
        mounts::pivot_root(&root)
    }

    fn bootstrap_network(&mut self) -> SandboxResult<()> {
        let settings = NetworkSettings::from_env()?;
        network::bootstrap(&settings).map(|_| ())
    }

    fn launch_plugin(&mut self) -> SandboxResult<PluginExit> {
        self.supervisor.run()
    }
}

/// Entry function registered under the plugin namespace re-entry name
pub fn plugin_namespace() -> i32 {
    init_tracing(TracingOptions::from_env(false));

    let env = match SandboxEnv::from_env() {
        Ok(env) => env,
        Err(e) => {
            error!(error = %e, "Cannot read sandbox environment");
            return e.exit_code();
        }
    };

    let span = info_span!(
        "sandbox",
        root = %env.root.display(),
        network = env.network,
        pid = std::process::id()
    );
    let _entered = span.enter();
    info!("Preparing plugin sandbox");

    let mut process = SandboxProcess::new(env, LinuxPhases::default());
    let result = process.run();
    let code = exit_code(&result);

    match &result {
        Ok(exit) => info!(%exit, code, "Sandbox finished"),
        Err(e) => error!(error = %e, state = %process.state(), code, "Sandbox failed"),
    }
    code
}
