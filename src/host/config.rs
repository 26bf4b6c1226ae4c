/*!
 * Host Configuration
 * YAML configuration file for the plugin host
 */

use crate::core::limits::{
    DEFAULT_LISTEN_ADDR, DEFAULT_NETWORK_POLL, DEFAULT_NETWORK_WAIT, DEFAULT_READY_TIMEOUT,
    DEFAULT_SHUTDOWN_GRACE,
};
use crate::plugin::{LauncherSettings, NetworkSpec, PluginDescriptor};
use crate::sandbox::WaitPolicy;
use ahash::AHashSet;
use ipnetwork::IpNetwork;
use miette::Diagnostic;
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    #[diagnostic(code(config::read), help("Pass the file location with --config."))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}")]
    #[diagnostic(code(config::parse))]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Plugin {0} is configured more than once")]
    #[diagnostic(code(config::duplicate_plugin))]
    DuplicatePlugin(String),

    #[error("{role} provider refers to unknown plugin {plugin}")]
    #[diagnostic(
        code(config::unknown_provider),
        help("Providers must name an entry of the `plugins` list.")
    )]
    UnknownProvider { role: &'static str, plugin: String },

    #[error("Plugins {first} and {second} share the network {network}")]
    #[diagnostic(
        code(config::overlapping_networks),
        help("Give each networked plugin its own subnet under `addresses`.")
    )]
    OverlappingNetworks {
        first: String,
        second: String,
        network: IpNetwork,
    },

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(config::invalid))]
    Invalid(String),
}

/// One plugin entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    /// Plugin directory; relative paths resolve against the config file
    pub root: PathBuf,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub addresses: Option<NetworkSpec>,
}

impl PluginConfig {
    pub fn descriptor(&self, base: &Path) -> PluginDescriptor {
        let root = if self.root.is_absolute() {
            self.root.clone()
        } else {
            base.join(&self.root).clean()
        };
        PluginDescriptor::new(&self.name, root, self.network)
            .with_network_spec(self.addresses.clone().unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub provider: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfoConfig {
    #[serde(default)]
    pub providers: Vec<String>,
}

/// Bounds forwarded to sandboxes that request networking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wait_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: DEFAULT_NETWORK_WAIT.as_millis() as u64,
            poll_interval_ms: DEFAULT_NETWORK_POLL.as_millis() as u64,
        }
    }
}

/// Top-level host configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub debug: bool,
    /// Status server address
    pub listen: String,
    pub plugins: Vec<PluginConfig>,
    pub storage: Option<StorageConfig>,
    pub fileinfo: FileInfoConfig,
    pub network: NetworkConfig,
    pub ready_timeout_ms: u64,
    pub shutdown_grace_ms: u64,

    /// Directory relative plugin roots resolve against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            debug: false,
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            plugins: Vec::new(),
            storage: None,
            fileinfo: FileInfoConfig::default(),
            network: NetworkConfig::default(),
            ready_timeout_ms: DEFAULT_READY_TIMEOUT.as_millis() as u64,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE.as_millis() as u64,
            base_dir: PathBuf::from("."),
        }
    }
}

impl HostConfig {
    /// Read, parse and validate the file at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        let mut names = AHashSet::with_capacity(self.plugins.len());
        for plugin in &self.plugins {
            if !names.insert(plugin.name.as_str()) {
                return Err(ConfigError::DuplicatePlugin(plugin.name.clone()));
            }
        }

        if let Some(storage) = &self.storage {
            if !names.contains(storage.provider.as_str()) {
                return Err(ConfigError::UnknownProvider {
                    role: "storage",
                    plugin: storage.provider.clone(),
                });
            }
        }
        for provider in &self.fileinfo.providers {
            if !names.contains(provider.as_str()) {
                return Err(ConfigError::UnknownProvider {
                    role: "fileinfo",
                    plugin: provider.clone(),
                });
            }
        }

        self.check_subnets()?;

        if self.network.wait_timeout_ms == 0 || self.network.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "network wait and poll intervals must be positive".to_string(),
            ));
        }
        if self.ready_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "ready_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Host veth ends install a connected route each; two equal routes shadow one another
    fn check_subnets(&self) -> Result<(), ConfigError> {
        let networked: Vec<(&str, IpNetwork)> = self
            .plugins
            .iter()
            .filter(|plugin| plugin.network)
            .map(|plugin| {
                let spec = plugin.addresses.clone().unwrap_or_default();
                (plugin.name.as_str(), spec.host_addr)
            })
            .collect();

        for (i, (first, a)) in networked.iter().enumerate() {
            for (second, b) in &networked[i + 1..] {
                if a.contains(b.network()) || b.contains(a.network()) {
                    return Err(ConfigError::OverlappingNetworks {
                        first: first.to_string(),
                        second: second.to_string(),
                        network: *a,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("listen address {:?}: {}", self.listen, e)))
    }

    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.plugins
            .iter()
            .map(|plugin| plugin.descriptor(&self.base_dir))
            .collect()
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Settings for spawning sandboxes through this binary's re-entry
    pub fn launcher_settings(&self) -> LauncherSettings {
        LauncherSettings {
            network_wait: WaitPolicy {
                max_wait: Duration::from_millis(self.network.wait_timeout_ms),
                poll_interval: Duration::from_millis(self.network.poll_interval_ms),
            },
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            ..LauncherSettings::default()
        }
    }
}
