use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, error, info};

use crate::connection::{Connection, ConnectionSettings};
use crate::registry::ClusterRegistry;

/// Pause after a failed accept (fd exhaustion and the like).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts sockets and hands each one to its own [`Connection`] task.
pub struct Listener {
    inner: TcpListener,
    registry: ClusterRegistry,
    settings: ConnectionSettings,
}

impl Listener {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        registry: ClusterRegistry,
        settings: ConnectionSettings,
    ) -> Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .context("Failed to bind discovery listener")?;
        info!(addr = %inner.local_addr()?, "DiscoveryListener start");
        Ok(Self { inner, registry, settings })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// Boucle d'accept; ne sort jamais, même sur erreur
    pub async fn run(self) {
        loop {
            match self.inner.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "incoming connection");
                    Connection::spawn(stream, peer, self.registry.clone(), self.settings.clone());
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Serves until `shutdown` completes. Live connections keep running on
    /// their own tasks.
    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) {
        tokio::select! {
            _ = self.run() => {}
            _ = shutdown => info!("listener stopped"),
        }
    }
}
