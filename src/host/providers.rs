/*!
 * Provider Resolution
 * Binds the storage and file-info roles to running plugins
 */

use super::config::HostConfig;
use crate::core::errors::{HostError, HostResult};
use crate::plugin::{PluginError, PluginManager, PluginState};
use serde::Serialize;
use std::path::PathBuf;
use tokio::net::UnixStream;
use tracing::info;

/// A role served by one plugin's control socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderBinding {
    pub role: &'static str,
    pub plugin: String,
    pub socket: PathBuf,
}

impl ProviderBinding {
    pub async fn connect(&self, manager: &PluginManager) -> Result<UnixStream, PluginError> {
        manager.connect(&self.plugin).await
    }
}

/// Every provider the host serves with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Providers {
    pub storage: Option<ProviderBinding>,
    pub fileinfo: Vec<ProviderBinding>,
}

impl Providers {
    /// Bind the configured roles; each named plugin must be running
    pub fn resolve(config: &HostConfig, manager: &PluginManager) -> HostResult<Self> {
        let storage = match &config.storage {
            Some(storage) => {
                info!(provider = %storage.provider, "Initializing storage provider");
                Some(bind("storage", &storage.provider, manager)?)
            }
            None => None,
        };

        info!(count = config.fileinfo.providers.len(), "Initializing file info providers");
        let fileinfo = config
            .fileinfo
            .providers
            .iter()
            .map(|plugin| bind("fileinfo", plugin, manager))
            .collect::<HostResult<Vec<_>>>()?;

        Ok(Self { storage, fileinfo })
    }
}

fn bind(role: &'static str, plugin: &str, manager: &PluginManager) -> HostResult<ProviderBinding> {
    let descriptor = manager.descriptor(plugin).ok_or_else(|| HostError::Provider {
        role,
        reason: format!("plugin {} is not started", plugin),
    })?;

    match manager.state(plugin) {
        Some(PluginState::Running) => Ok(ProviderBinding {
            role,
            plugin: plugin.to_string(),
            socket: descriptor.socket_path,
        }),
        Some(state) => Err(HostError::Provider {
            role,
            reason: format!("plugin {} is {}", plugin, state),
        }),
        None => Err(HostError::Provider {
            role,
            reason: format!("plugin {} is not started", plugin),
        }),
    }
}
