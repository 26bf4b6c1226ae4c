/*!
 * Virtual Ethernet (veth) Pair Management
 * Creates the host side of a networked plugin's link and hands the peer
 * end to the sandbox's network namespace
 */

use super::types::{PluginError, PluginResult, VethNames};
use crate::core::types::Pid;
use futures::stream::TryStreamExt;
use ipnetwork::IpNetwork;
use netlink_packet_route::link::LinkMessage;
use rtnetlink::{new_connection, Handle};
use tracing::{debug, info};

/// Veth pair manager bound to the host network namespace
pub struct VethManager {
    handle: Handle,
}

impl VethManager {
    /// Open the netlink connection (must be called in async context)
    pub fn connect() -> Result<Self, String> {
        let (connection, handle, _) = new_connection()
            .map_err(|e| format!("Failed to create netlink connection: {}", e))?;

        // Spawn the connection in the background
        tokio::spawn(connection);

        info!("VethManager initialized with netlink connection");
        Ok(Self { handle })
    }

    /// Create the pair, move the peer into `pid`'s namespace and raise the host end
    pub async fn attach(
        &self,
        plugin: &str,
        names: &VethNames,
        pid: Pid,
        host_addr: IpNetwork,
    ) -> PluginResult<()> {
        let fail = |reason: String| PluginError::Network {
            name: plugin.to_string(),
            reason,
        };

        self.create_pair(names).await.map_err(fail)?;

        let configured = async {
            self.move_to_namespace(&names.peer, pid).await?;
            self.set_ip(&names.host, host_addr).await?;
            self.set_up(&names.host).await
        }
        .await;

        if let Err(reason) = configured {
            // Deleting the host end removes the peer as well
            if let Err(e) = self.delete_pair(&names.host).await {
                debug!(iface = %names.host, error = %e, "Cleanup of partial veth pair failed");
            }
            return Err(fail(reason));
        }

        info!(
            plugin,
            host = %names.host,
            peer = %names.peer,
            pid,
            address = %host_addr,
            "Veth pair attached"
        );
        Ok(())
    }

    /// Create a veth pair in the host namespace
    pub async fn create_pair(&self, names: &VethNames) -> Result<(), String> {
        debug!(host = %names.host, peer = %names.peer, "Creating veth pair");

        self.handle
            .link()
            .add()
            .veth(names.host.clone(), names.peer.clone())
            .execute()
            .await
            .map_err(|e| {
                format!(
                    "Failed to create veth pair {}<->{}: {}",
                    names.host, names.peer, e
                )
            })
    }

    /// Move `iface` into the network namespace of process `pid`
    pub async fn move_to_namespace(&self, iface: &str, pid: Pid) -> Result<(), String> {
        let link = self.find(iface).await?;

        self.handle
            .link()
            .set(link.header.index)
            .setns_by_pid(pid)
            .execute()
            .await
            .map_err(|e| format!("Failed to move {} into namespace of {}: {}", iface, pid, e))?;

        debug!(iface, pid, "Interface moved into sandbox namespace");
        Ok(())
    }

    /// Configure an address on a host-side interface
    pub async fn set_ip(&self, iface: &str, address: IpNetwork) -> Result<(), String> {
        let link = self.find(iface).await?;

        self.handle
            .address()
            .add(link.header.index, address.ip(), address.prefix())
            .execute()
            .await
            .map_err(|e| format!("Failed to set IP {} on {}: {}", address, iface, e))?;

        debug!(iface, %address, "IP address configured");
        Ok(())
    }

    pub async fn set_up(&self, iface: &str) -> Result<(), String> {
        let link = self.find(iface).await?;

        self.handle
            .link()
            .set(link.header.index)
            .up()
            .execute()
            .await
            .map_err(|e| format!("Failed to set interface {} up: {}", iface, e))
    }

    /// Delete a veth pair by its host end
    pub async fn delete_pair(&self, host: &str) -> Result<(), String> {
        let link = self.find(host).await?;

        self.handle
            .link()
            .del(link.header.index)
            .execute()
            .await
            .map_err(|e| format!("Failed to delete veth pair {}: {}", host, e))?;

        debug!(iface = host, "Veth pair deleted");
        Ok(())
    }

    async fn find(&self, iface: &str) -> Result<LinkMessage, String> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(iface.to_string())
            .execute();

        links
            .try_next()
            .await
            .map_err(|e| format!("Failed to find interface {}: {}", iface, e))?
            .ok_or_else(|| format!("Interface {} not found", iface))
    }
}
