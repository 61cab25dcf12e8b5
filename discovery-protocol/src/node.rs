use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;
use std::time::Duration;

/// Host announced by a registrant that wants the listener to use the
/// address it observes on the socket instead.
pub const UNSPECIFIED_HOST: &str = "0.0.0.0";

/// Attributes carried by REGISTER and HEARTBEAT payloads.
///
/// Only `http_host`, `node_id` and `heartbeat_timeout` are inspected by the
/// listener. Everything else is kept as sent, whatever its JSON type, so a
/// registrant advertising `"http_port": "8001"` is still accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub http_host: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub http_port: Value,
    #[serde(default, deserialize_with = "lenient::node_id")]
    pub node_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::seconds", skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<f64>,
    #[serde(default, deserialize_with = "lenient::seconds", skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeInfo {
    pub fn new(http_host: impl Into<String>, http_port: u16) -> Self {
        Self {
            http_host: Value::String(http_host.into()),
            http_port: Value::from(http_port),
            node_id: None,
            heartbeat_interval: None,
            heartbeat_timeout: None,
            extra: Map::new(),
        }
    }

    /// Fails only when `value` is not a JSON object.
    pub fn from_value(value: &Value) -> serde_json::Result<Self> {
        Self::deserialize(value)
    }

    /// Remplace `0.0.0.0` par l'IP observée côté socket
    pub fn resolve_host(&mut self, peer_ip: IpAddr) -> bool {
        if self.http_host == UNSPECIFIED_HOST {
            self.http_host = Value::String(peer_ip.to_string());
            true
        } else {
            false
        }
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout.and_then(secs_to_duration)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval.and_then(secs_to_duration)
    }

    /// node_id for log lines, `None` when the registrant has not got one yet.
    pub fn display_id(&self) -> &str {
        self.node_id.as_deref().unwrap_or("None")
    }
}

mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Chaîne non vide ou nombre; le reste vaut « pas d'id »
    pub fn node_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn seconds<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }
}

/// Positive, finite seconds only.
pub fn secs_to_duration(secs: f64) -> Option<Duration> {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_with_extra_fields() {
        let info = NodeInfo::from_value(&json!({
            "http_host": "10.0.0.5",
            "http_port": 8001,
            "node_id": null,
            "heartbeat_timeout": 2,
            "role": "indexer",
        }))
        .unwrap();
        assert_eq!(info.node_id, None);
        assert_eq!(info.heartbeat_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(info.extra.get("role"), Some(&json!("indexer")));
    }

    #[test]
    fn test_only_non_objects_are_rejected() {
        assert!(NodeInfo::from_value(&json!("Client Unregister Service!")).is_err());
        assert!(NodeInfo::from_value(&json!([1, 2])).is_err());

        let info = NodeInfo::from_value(&json!({"http_port": 8001})).unwrap();
        assert!(info.http_host.is_null());
    }

    #[test]
    fn test_uninspected_fields_keep_any_type() {
        let info = NodeInfo::from_value(&json!({
            "http_host": "0.0.0.0",
            "http_port": "8001",
            "node_id": 42,
            "heartbeat_interval": "fast",
            "heartbeat_timeout": "1.5",
        }))
        .unwrap();
        assert_eq!(info.http_port, json!("8001"));
        assert_eq!(info.node_id.as_deref(), Some("42"));
        assert_eq!(info.heartbeat_interval, None);
        assert_eq!(info.heartbeat_timeout(), Some(Duration::from_millis(1500)));

        let back = serde_json::to_value(&info).unwrap();
        assert_eq!(back["http_port"], "8001");
        assert_eq!(back["node_id"], "42");
    }

    #[test]
    fn test_unusable_node_id_counts_as_absent() {
        for id in [json!(""), json!(true), json!({"a": 1}), json!(null)] {
            let info = NodeInfo::from_value(&json!({"http_host": "h", "node_id": id})).unwrap();
            assert_eq!(info.node_id, None);
        }
    }

    #[test]
    fn test_resolve_host() {
        let peer: IpAddr = "192.168.1.20".parse().unwrap();

        let mut info = NodeInfo::new(UNSPECIFIED_HOST, 8001);
        assert!(info.resolve_host(peer));
        assert_eq!(info.http_host, "192.168.1.20");

        let mut fixed = NodeInfo::new("node-a.lan", 8001);
        assert!(!fixed.resolve_host(peer));
        assert_eq!(fixed.http_host, "node-a.lan");
    }

    #[test]
    fn test_invalid_timeouts_are_ignored() {
        let mut info = NodeInfo::new("h", 1);
        info.heartbeat_timeout = Some(-1.0);
        assert_eq!(info.heartbeat_timeout(), None);
        info.heartbeat_timeout = Some(f64::NAN);
        assert_eq!(info.heartbeat_timeout(), None);
        info.heartbeat_timeout = Some(0.25);
        assert_eq!(info.heartbeat_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_serialize_keeps_null_node_id() {
        let value = serde_json::to_value(NodeInfo::new("0.0.0.0", 8001)).unwrap();
        assert_eq!(value, json!({"http_host": "0.0.0.0", "http_port": 8001, "node_id": null}));
    }
}
