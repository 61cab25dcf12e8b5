use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

use crate::connection::ConnectionSettings;

pub const CONFIG_ENV: &str = "DISCOVERY_LISTENER_CONFIG";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind: String,
    /// Pour les registrants qui n'annoncent pas de heartbeat_timeout
    pub default_heartbeat_timeout_secs: f64,
    pub health_report_interval_secs: u64,
    pub max_frame_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            default_heartbeat_timeout_secs: 10.0,
            health_report_interval_secs: 30,
            max_frame_bytes: discovery_protocol::codec::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ListenerConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        let defaults = ConnectionSettings::default();
        ConnectionSettings {
            default_heartbeat_timeout: discovery_protocol::node::secs_to_duration(
                self.default_heartbeat_timeout_secs,
            )
            .unwrap_or(defaults.default_heartbeat_timeout),
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    pub fn health_report_interval(&self) -> Duration {
        Duration::from_secs(self.health_report_interval_secs.max(1))
    }
}

pub async fn load_config() -> ListenerConfig {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "listener.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from<P: AsRef<Path>>(path: P) -> ListenerConfig {
    let path = path.as_ref();
    if path.exists() {
        let txt = match fs::read_to_string(path).await {
            Ok(txt) => txt,
            Err(e) => {
                warn!("config illisible ({}): {e}", path.display());
                return ListenerConfig::default();
            }
        };
        if txt.trim().is_empty() {
            return ListenerConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            warn!("config invalide ({}): {e}", path.display());
            ListenerConfig::default()
        })
    } else {
        warn!("pas de {}, usage config par défaut", path.display());
        ListenerConfig::default()
    }
}
