/*!
Test Harness pour le listener de découverte

Facilite l'écriture de tests bout-en-bout avec:
- Listener réel sur 127.0.0.1, port éphémère
- Pairs bruts ([`MockPeer`]) et registrants pointés dessus
- Attente sur le statut cluster et le nombre de connexions
*/

use crate::mock_peer::MockPeer;
use anyhow::Result;
use discovery_listener::{ClusterRegistry, ConnectionSettings, Listener};
use discovery_protocol::Status;
use discovery_registrant::RegistrantSettings;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Listener en mémoire, arrêté quand le harness est droppé
pub struct TestHarness {
    addr: SocketAddr,
    registry: ClusterRegistry,
    task: JoinHandle<()>,
}

impl TestHarness {
    pub async fn start() -> Result<Self> {
        Self::with_settings(ConnectionSettings::default()).await
    }

    pub async fn with_settings(settings: ConnectionSettings) -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        let registry = ClusterRegistry::new();
        let listener = Listener::bind("127.0.0.1:0", registry.clone(), settings).await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(listener.run());
        log::info!("test listener on {addr}");

        Ok(Self { addr, registry, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    pub async fn peer(&self) -> Result<MockPeer> {
        MockPeer::connect(self.addr).await
    }

    /// Réglages registrant pointés sur ce listener, délais courts
    pub fn registrant_settings(&self) -> RegistrantSettings {
        RegistrantSettings {
            retry_interval: Duration::from_millis(100),
            close_grace: Duration::from_millis(50),
            register_timeout: Duration::from_secs(2),
            ..RegistrantSettings::new(self.addr.ip().to_string(), self.addr.port())
        }
    }

    pub async fn wait_for_status(&self, expected: Status, timeout: Duration) -> Result<()> {
        let mut rx = self.registry.watch_status();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|s| *s == expected))
            .await
            .map(|changed| changed.map(|_| ()));
        match reached {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => anyhow::bail!("registry dropped"),
            Err(_) => anyhow::bail!(
                "cluster still {} after {:?}, expected {}",
                self.registry.status(),
                timeout,
                expected
            ),
        }
    }

    /// Attend `count` connexions enregistrées
    pub async fn wait_for_registered(&self, count: usize, timeout: Duration) -> Result<()> {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if self.registry.registered_count() == count {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        anyhow::bail!(
            "expected {count} registered nodes, got {}",
            self.registry.registered_count()
        );
    }

    pub async fn wait_for_empty(&self, timeout: Duration) -> Result<()> {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if self.registry.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        anyhow::bail!("{} connections still live", self.registry.len());
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.task.abort();
    }
}
