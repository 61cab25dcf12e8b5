/**
 * DISCOVERY LISTENER - Point d'entrée du serveur de découverte
 *
 * RÔLE : Bootstrap : .env, config YAML, logging, bind TCP, rapport de santé.
 *
 * ARCHITECTURE : Une tâche d'accept + une tâche par connexion + un reporter health.
 * UTILITÉ : Point central où les nodes s'enregistrent et prouvent leur liveness.
 */

use anyhow::Result;
use discovery_listener::config::load_config;
use discovery_listener::{ClusterRegistry, HealthTracker, Listener};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;
    info!(?cfg, "configuration loaded");

    let registry = ClusterRegistry::new();
    let listener = Listener::bind(cfg.bind.as_str(), registry.clone(), cfg.connection_settings()).await?;
    info!("listening on tcp://{}", listener.local_addr()?);

    let health_tracker = HealthTracker::new();
    let reporter = health_tracker.spawn_health_reporter(registry.clone(), cfg.health_report_interval());

    listener
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;

    reporter.abort();
    let health = health_tracker.get_health(&registry);
    info!(status = %health.status, live = health.live_connections, "shutting down");
    Ok(())
}
