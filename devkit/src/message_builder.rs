/*!
Builders pour les payloads REGISTER / HEARTBEAT

Évite de réécrire le JSON de node info dans chaque test.
*/

use discovery_protocol::{Command, Message};
use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub struct MessageBuilder {
    fields: Map<String, Value>,
}

impl MessageBuilder {
    /// Node info minimale : `http_host`, `http_port`, `node_id: null`
    pub fn node(http_host: &str, http_port: u16) -> Self {
        let mut fields = Map::new();
        fields.insert("http_host".into(), Value::from(http_host));
        fields.insert("http_port".into(), Value::from(http_port));
        fields.insert("node_id".into(), Value::Null);
        Self { fields }
    }

    pub fn node_id(self, node_id: &str) -> Self {
        self.field("node_id", node_id)
    }

    /// Intervalle et timeout de heartbeat, en secondes
    pub fn heartbeat(self, interval: f64, timeout: f64) -> Self {
        self.field("heartbeat_interval", interval)
            .field("heartbeat_timeout", timeout)
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn data(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn register(&self) -> Message {
        Message::new(Command::Register, self.data())
    }

    pub fn heartbeat_message(&self) -> Message {
        Message::new(Command::Heartbeat, self.data())
    }
}
