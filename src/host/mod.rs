/*!
 * Plugin Host
 * Startup, serving and shutdown of the storage host
 *
 * Startup order: plugin manager → every plugin started and ready → providers
 * resolved → status server bound. Plugins are closed on every exit path once
 * the manager exists.
 */

pub mod config;
pub mod providers;
pub mod server;

pub use config::{ConfigError, HostConfig};
pub use providers::{ProviderBinding, Providers};
pub use server::{run_until_interrupt, StatusReport, StatusServer};

use crate::core::errors::HostResult;
use crate::plugin::PluginManager;
use tracing::info;

/// Run the host until interrupted
pub async fn run(config: HostConfig) -> HostResult<()> {
    info!("Initializing plugin manager");
    let manager = PluginManager::new(config.launcher_settings());

    let result = serve(&config, &manager).await;
    manager.close().await;
    result
}

async fn serve(config: &HostConfig, manager: &PluginManager) -> HostResult<()> {
    start_plugins(config, manager).await?;

    let providers = Providers::resolve(config, manager)?;

    info!("Initializing status server");
    let server = StatusServer::bind(config.listen_addr()?, manager.clone(), providers).await?;
    run_until_interrupt(server).await
}

/// Start every configured plugin, then wait for each control socket
pub async fn start_plugins(config: &HostConfig, manager: &PluginManager) -> HostResult<()> {
    let descriptors = config.descriptors();

    for descriptor in &descriptors {
        manager.start(descriptor.clone()).await?;
    }
    for descriptor in &descriptors {
        manager
            .wait_ready(&descriptor.name, config.ready_timeout())
            .await?;
    }

    info!(plugins = descriptors.len(), "All plugins ready");
    Ok(())
}
