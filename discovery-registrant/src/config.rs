//! Registrant configuration
//!
//! Handles:
//! - listener address
//! - node attributes announced in REGISTER / HEARTBEAT
//! - heartbeat and reconnect policy
//! - cross-platform storage (`<config_dir>/discovery-registrant/config.toml`)

use anyhow::{Context, Result};
use discovery_protocol::ConfigStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registrant::RegistrantSettings;

pub const CONFIG_ENV: &str = "DISCOVERY_REGISTRANT_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrantConfig {
    pub server: ServerConfig,
    pub node: NodeConfig,
    pub heartbeat: HeartbeatConfig,
    pub retry_interval_secs: u64,
    pub reconnect: bool,
    pub close_grace_secs: u64,
    pub register_timeout_secs: u64,
    /// Extra attributes sent as-is with the node info
    pub advertise: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub http_host: String,
    pub http_port: u16,
    /// Pinned id; otherwise the listener assigns one at first REGISTER
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: f64,
    pub timeout_secs: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8000 }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            http_host: discovery_protocol::node::UNSPECIFIED_HOST.to_string(),
            http_port: 8001,
            node_id: None,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_secs: 5.0, timeout_secs: 15.0 }
    }
}

impl Default for RegistrantConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            node: NodeConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            retry_interval_secs: 10,
            reconnect: true,
            close_grace_secs: 5,
            register_timeout_secs: 10,
            advertise: BTreeMap::new(),
        }
    }
}

impl RegistrantConfig {
    /// Load config from `$DISCOVERY_REGISTRANT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => Self::config_file_path()?,
        };
        Self::load_from(&path).await
    }

    /// Missing file means first run: defaults
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("discovery-registrant");
        path.push("config.toml");
        Ok(path)
    }

    pub fn settings(&self) -> RegistrantSettings {
        RegistrantSettings {
            retry_interval: Duration::from_secs(self.retry_interval_secs),
            reconnect: self.reconnect,
            close_grace: Duration::from_secs(self.close_grace_secs),
            register_timeout: Duration::from_secs(self.register_timeout_secs.max(1)),
            ..RegistrantSettings::new(self.server.host.clone(), self.server.port)
        }
    }

    /// Node info store shared with the registrant; it is what goes on the wire.
    pub fn build_store(&self) -> Result<ConfigStore> {
        let store = ConfigStore::new();
        for (key, value) in &self.advertise {
            store.set(key.clone(), value)?;
        }
        store.set("http_host", &self.node.http_host)?;
        store.set("http_port", self.node.http_port)?;
        store.set("heartbeat_interval", self.heartbeat.interval_secs)?;
        store.set("heartbeat_timeout", self.heartbeat.timeout_secs)?;
        if let Some(node_id) = &self.node.node_id {
            store.set("node_id", node_id)?;
        }
        if !store.has_key("hostname") {
            store.set("hostname", gethostname::gethostname().to_string_lossy())?;
        }
        Ok(store)
    }
}
