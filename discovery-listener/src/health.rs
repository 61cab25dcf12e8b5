use discovery_protocol::Status;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::registry::ClusterRegistry;

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub status: Status,
    pub live_connections: u32,
    pub registered_nodes: u32,
    pub uptime_seconds: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(&self, registry: &ClusterRegistry) -> ClusterHealth {
        ClusterHealth {
            status: registry.status(),
            live_connections: registry.len() as u32,
            registered_nodes: registry.registered_count() as u32,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            checked_at: OffsetDateTime::now_utc(),
        }
    }

    /// Démarre le rapport périodique du health cluster dans les logs
    pub fn spawn_health_reporter(&self, registry: ClusterRegistry, every: Duration) -> JoinHandle<()> {
        let tracker = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let health = tracker.get_health(&registry);
                match serde_json::to_string(&health) {
                    Ok(payload) => info!(
                        status = %health.status,
                        nodes = health.registered_nodes,
                        "cluster health {payload}"
                    ),
                    Err(e) => warn!(error = %e, "failed to serialize cluster health"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cluster_is_red() {
        let tracker = HealthTracker::new();
        let health = tracker.get_health(&ClusterRegistry::new());
        assert_eq!(health.status, Status::Red);
        assert_eq!(health.live_connections, 0);
        assert_eq!(health.registered_nodes, 0);

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "RED");
        assert!(json["checked_at"].is_string());
    }

    #[tokio::test]
    async fn test_reporter_can_be_aborted() {
        let tracker = HealthTracker::new();
        let handle = tracker.spawn_health_reporter(ClusterRegistry::new(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
