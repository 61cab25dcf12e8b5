//! Discovery registrant binary
//!
//! Announces this node to the discovery listener and keeps it alive until
//! Ctrl-C. The connection is closed after the grace period, without UNREGISTER.

use anyhow::{Context, Result};
use discovery_registrant::{Registrant, RegistrantConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting discovery registrant v{}", env!("CARGO_PKG_VERSION"));

    let config = RegistrantConfig::load().await.context("loading registrant config")?;
    let store = config.build_store().context("building node info")?;
    info!(
        server = %format!("{}:{}", config.server.host, config.server.port),
        http_port = config.node.http_port,
        "Registering node"
    );

    let handle = Registrant::spawn(config.settings(), store);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown requested, closing in {}s", config.close_grace_secs);
    handle.shutdown().await;
    Ok(())
}
