/*!
 * Netlink Access
 * rtnetlink operations issued from inside the sandbox network namespace
 */

use super::{LinkSnapshot, NetworkSettings};
use crate::core::limits::LOOPBACK_IFACE;
use crate::sandbox::types::{SandboxError, SandboxResult};
use futures::stream::TryStreamExt;
use netlink_packet_route::link::{LinkAttribute, LinkFlag, LinkMessage};
use rtnetlink::{new_connection, Handle};
use std::net::IpAddr;
use tracing::{debug, info};

/// Netlink handle bound to the current network namespace
pub struct NetlinkNetwork {
    handle: Handle,
}

impl NetlinkNetwork {
    /// Open a netlink connection (must be called in async context)
    pub fn connect() -> SandboxResult<Self> {
        let (connection, handle, _) = new_connection().map_err(|e| {
            SandboxError::Network(format!("Failed to create netlink connection: {}", e))
        })?;

        // Spawn the connection in the background
        tokio::spawn(connection);

        debug!("Netlink connection established");
        Ok(Self { handle })
    }

    /// List every link visible in the namespace
    pub async fn links(&self) -> SandboxResult<Vec<LinkSnapshot>> {
        let mut stream = self.handle.link().get().execute();
        let mut links = Vec::new();

        while let Some(message) = stream
            .try_next()
            .await
            .map_err(|e| SandboxError::Network(format!("Failed to list links: {}", e)))?
        {
            links.push(snapshot(&message));
        }

        Ok(links)
    }

    /// Bring up loopback, address and raise `link`, install the default route
    pub async fn configure(
        &self,
        settings: &NetworkSettings,
        link: &LinkSnapshot,
    ) -> SandboxResult<()> {
        if let Some(lo) = self.find(LOOPBACK_IFACE).await? {
            self.set_up(&lo).await?;
        }

        let ip = settings.address.ip();
        let prefix = settings.address.prefix();
        self.handle
            .address()
            .add(link.index, ip, prefix)
            .execute()
            .await
            .map_err(|e| {
                SandboxError::Network(format!(
                    "Failed to set IP {}/{} on {}: {}",
                    ip, prefix, link.name, e
                ))
            })?;
        debug!(iface = %link.name, address = %settings.address, "Address assigned");

        self.set_up(link).await?;

        if let Some(gateway) = settings.gateway {
            self.add_default_route(gateway, link).await?;
        }

        info!(
            iface = %link.name,
            address = %settings.address,
            gateway = ?settings.gateway,
            "Sandbox network configured"
        );
        Ok(())
    }

    async fn find(&self, name: &str) -> SandboxResult<Option<LinkSnapshot>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();

        match links.try_next().await {
            Ok(found) => Ok(found.as_ref().map(snapshot)),
            // The kernel answers ENODEV for unknown names
            Err(rtnetlink::Error::NetlinkError(_)) => Ok(None),
            Err(e) => Err(SandboxError::Network(format!(
                "Failed to find interface {}: {}",
                name, e
            ))),
        }
    }

    async fn set_up(&self, link: &LinkSnapshot) -> SandboxResult<()> {
        self.handle
            .link()
            .set(link.index)
            .up()
            .execute()
            .await
            .map_err(|e| {
                SandboxError::Network(format!("Failed to set interface {} up: {}", link.name, e))
            })?;
        debug!(iface = %link.name, "Interface up");
        Ok(())
    }

    async fn add_default_route(&self, gateway: IpAddr, link: &LinkSnapshot) -> SandboxResult<()> {
        let IpAddr::V4(gateway) = gateway else {
            return Err(SandboxError::Network(format!(
                "Unsupported default gateway {}",
                gateway
            )));
        };

        self.handle
            .route()
            .add()
            .v4()
            .gateway(gateway)
            .output_interface(link.index)
            .execute()
            .await
            .map_err(|e| {
                SandboxError::Network(format!(
                    "Failed to add default route via {}: {}",
                    gateway, e
                ))
            })?;
        debug!(gateway = %gateway, iface = %link.name, "Default route installed");
        Ok(())
    }
}

fn snapshot(message: &LinkMessage) -> LinkSnapshot {
    let name = message
        .attributes
        .iter()
        .find_map(|attr| match attr {
            LinkAttribute::IfName(name) => Some(name.clone()),
            _ => None,
        })
        .unwrap_or_default();

    LinkSnapshot {
        index: message.header.index,
        name,
        loopback: message.header.flags.contains(&LinkFlag::Loopback),
        up: message.header.flags.contains(&LinkFlag::Up),
    }
}
