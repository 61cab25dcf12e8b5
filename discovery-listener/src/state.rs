use discovery_protocol::{NodeInfo, Status};
use parking_lot::Mutex;
use std::sync::Arc;
use time::OffsetDateTime;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Vue d'une connexion partagée entre sa tâche et le registry.
/// Seule la tâche de la connexion écrit dedans.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub status: Status,
    pub info: Option<NodeInfo>,
    pub connected_at: OffsetDateTime,
    pub last_heartbeat: Option<OffsetDateTime>,
}

impl ConnectionState {
    pub fn connected() -> Self {
        Self {
            status: Status::Connected,
            info: None,
            connected_at: OffsetDateTime::now_utc(),
            last_heartbeat: None,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        self.info.as_ref().and_then(|i| i.node_id.as_deref())
    }
}
