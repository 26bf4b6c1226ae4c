/*!
 * Network Bootstrapper
 * Finishes network set-up from inside a sandbox's network namespace
 *
 * The host side creates a veth pair and moves one end into the namespace.
 * This side waits for that end to show up, then addresses it, brings it up
 * and installs the default route. Both steps are bounded and fatal on failure.
 */

#[cfg(target_os = "linux")]
mod netlink;

#[cfg(target_os = "linux")]
pub use netlink::NetlinkNetwork;

use super::types::{SandboxError, SandboxResult};
use crate::core::limits::{
    DEFAULT_HOST_ADDR, DEFAULT_NETWORK_POLL, DEFAULT_NETWORK_WAIT, DEFAULT_SANDBOX_ADDR,
    SANDBOX_ADDR_ENV, SANDBOX_GATEWAY_ENV, SANDBOX_NET_POLL_ENV, SANDBOX_NET_WAIT_ENV,
};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Bounds for the network wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicy {
    /// Give up after this long
    pub max_wait: Duration,
    /// Sleep between probes
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_NETWORK_WAIT,
            poll_interval: DEFAULT_NETWORK_POLL,
        }
    }
}

/// Addressing applied inside the namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    /// Address and prefix for the sandbox end of the veth pair
    pub address: IpNetwork,
    /// Default route, `None` to skip it
    pub gateway: Option<IpAddr>,
    pub wait: WaitPolicy,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            address: default_sandbox_addr(),
            gateway: Some(default_host_addr().ip()),
            wait: WaitPolicy::default(),
        }
    }
}

impl NetworkSettings {
    /// Read settings from the process environment
    pub fn from_env() -> SandboxResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, falling back to defaults for absent keys
    pub fn from_lookup<F>(lookup: F) -> SandboxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(value) = lookup(SANDBOX_ADDR_ENV) {
            settings.address = value.parse().map_err(|e: ipnetwork::IpNetworkError| {
                SandboxError::Settings {
                    var: SANDBOX_ADDR_ENV,
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        if let Some(value) = lookup(SANDBOX_GATEWAY_ENV) {
            settings.gateway = if value.is_empty() {
                None
            } else {
                let gateway: IpAddr = value.parse().map_err(|e: std::net::AddrParseError| {
                    SandboxError::Settings {
                        var: SANDBOX_GATEWAY_ENV,
                        value: value.clone(),
                        reason: e.to_string(),
                    }
                })?;
                if !gateway.is_ipv4() {
                    return Err(SandboxError::Settings {
                        var: SANDBOX_GATEWAY_ENV,
                        value,
                        reason: "only IPv4 default routes are supported".to_string(),
                    });
                }
                Some(gateway)
            };
        }

        if let Some(value) = lookup(SANDBOX_NET_WAIT_ENV) {
            settings.wait.max_wait = parse_millis(SANDBOX_NET_WAIT_ENV, &value)?;
        }

        if let Some(value) = lookup(SANDBOX_NET_POLL_ENV) {
            settings.wait.poll_interval = parse_millis(SANDBOX_NET_POLL_ENV, &value)?;
        }

        Ok(settings)
    }
}

fn parse_millis(var: &'static str, value: &str) -> SandboxResult<Duration> {
    let millis: u64 = value.parse().map_err(|e: std::num::ParseIntError| SandboxError::Settings {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if millis == 0 {
        return Err(SandboxError::Settings {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(millis))
}

pub(crate) fn default_sandbox_addr() -> IpNetwork {
    DEFAULT_SANDBOX_ADDR
        .parse()
        .unwrap_or_else(|_| unreachable!("DEFAULT_SANDBOX_ADDR is a valid CIDR"))
}

pub(crate) fn default_host_addr() -> IpNetwork {
    DEFAULT_HOST_ADDR
        .parse()
        .unwrap_or_else(|_| unreachable!("DEFAULT_HOST_ADDR is a valid CIDR"))
}

/// Point-in-time view of one interface in the namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub index: u32,
    pub name: String,
    pub loopback: bool,
    pub up: bool,
}

/// The interface the host handed over, if it has arrived yet
///
/// The veth end arrives down, so presence rather than link state is the signal.
pub fn select_usable_link(links: &[LinkSnapshot]) -> Option<&LinkSnapshot> {
    links.iter().find(|link| !link.loopback)
}

/// Poll `probe` until a usable interface appears or `policy.max_wait` elapses
///
/// Probe errors abort the wait immediately.
pub async fn wait_for_network<F, Fut>(policy: WaitPolicy, mut probe: F) -> SandboxResult<LinkSnapshot>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SandboxResult<Vec<LinkSnapshot>>>,
{
    let started = Instant::now();
    let deadline = started + policy.max_wait;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let links = probe().await?;

        if let Some(link) = select_usable_link(&links) {
            info!(
                iface = %link.name,
                index = link.index,
                up = link.up,
                attempts,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Network interface available"
            );
            return Ok(link.clone());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(SandboxError::NetworkTimeout {
                waited: now - started,
            });
        }

        debug!(attempts, links = links.len(), "No usable interface yet");
        tokio::time::sleep(policy.poll_interval.min(deadline - now)).await;
    }
}

/// Wait for the host-provided interface and configure it
#[cfg(target_os = "linux")]
pub fn bootstrap(settings: &NetworkSettings) -> SandboxResult<LinkSnapshot> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(SandboxError::Runtime)?;

    runtime.block_on(async {
        let network = NetlinkNetwork::connect()?;
        let network = &network;
        let link = wait_for_network(settings.wait, move || network.links()).await?;
        network.configure(settings, &link).await?;
        Ok(link)
    })
}

#[cfg(not(target_os = "linux"))]
pub fn bootstrap(_settings: &NetworkSettings) -> SandboxResult<LinkSnapshot> {
    Err(SandboxError::PlatformNotSupported(
        "network namespaces are only available on Linux".to_string(),
    ))
}
