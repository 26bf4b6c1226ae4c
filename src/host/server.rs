/*!
 * Status Server
 * TCP endpoint reporting plugin and provider state as JSON
 */

use super::providers::Providers;
use crate::core::errors::{HostError, HostResult};
use crate::plugin::{PluginManager, PluginStatus};
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Body written to every status connection
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub plugins: Vec<PluginStatus>,
    pub providers: Providers,
}

pub struct StatusServer {
    listener: TcpListener,
    manager: PluginManager,
    providers: Providers,
}

impl StatusServer {
    pub async fn bind(addr: SocketAddr, manager: PluginManager, providers: Providers) -> HostResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HostError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        info!(addr = %listener.local_addr()?, "Status server bound");
        Ok(Self {
            listener,
            manager,
            providers,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            plugins: self.manager.snapshot(),
            providers: self.providers.clone(),
        }
    }

    /// Accept connections until `shutdown` turns true, then drain in-flight ones
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> HostResult<()> {
        let mut connections = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("Shutdown sender dropped");
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let report = self.report();
                        connections.spawn(async move {
                            if let Err(e) = send_report(stream, &report).await {
                                warn!(%peer, error = %e, "Status connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(in_flight = connections.len(), "Status server stopping");
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

async fn send_report(mut stream: TcpStream, report: &StatusReport) -> io::Result<()> {
    let mut body = serde_json::to_vec(report)?;
    body.push(b'\n');
    stream.write_all(&body).await?;
    stream.shutdown().await
}

/// Serve until Ctrl-C or SIGTERM
///
/// A single task listens for the signal and flips the shutdown watch.
pub async fn run_until_interrupt(server: StatusServer) -> HostResult<()> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Closing server");
        let _ = tx.send(true);
    });

    server.serve(rx).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}
