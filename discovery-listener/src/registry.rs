/**
 * CLUSTER REGISTRY - Ensemble des connexions vivantes du listener
 *
 * RÔLE : Membership des connexions (clé = identité de connexion, pas node_id)
 * et statut cluster dérivé : RED si vide, GREEN sinon.
 *
 * ARCHITECTURE : Le registry ne garde que des handles (id, peer, file sortante,
 * vue partagée). L'état d'une connexion appartient à sa tâche.
 * UTILITÉ : add/remove atomiques, éviction et fermeture peuvent se croiser sans
 * double suppression.
 */

use discovery_protocol::{Message, NodeInfo, Status};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::state::{ConnectionState, Shared};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the registry keeps for one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
    state: Shared<ConnectionState>,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<Message>,
        state: Shared<ConnectionState>,
    ) -> Self {
        Self { id, peer, outbound, state }
    }

    pub fn view(&self) -> ConnectionView {
        let state = self.state.lock();
        ConnectionView {
            id: self.id,
            peer: self.peer,
            status: state.status,
            node_id: state.node_id().map(str::to_string),
            info: state.info.clone(),
            connected_at: state.connected_at,
            last_heartbeat: state.last_heartbeat,
        }
    }

    fn is_registered(&self) -> bool {
        self.state.lock().status == Status::Registered
    }
}

/// Snapshot d'une connexion pour les opérateurs
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionView {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub status: Status,
    pub node_id: Option<String>,
    pub info: Option<NodeInfo>,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_heartbeat: Option<OffsetDateTime>,
}

struct Inner {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    status_tx: watch::Sender<Status>,
}

#[derive(Clone)]
pub struct ClusterRegistry {
    inner: Arc<Inner>,
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterRegistry {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(Status::Red);
        Self {
            inner: Arc::new(Inner {
                connections: RwLock::new(HashMap::new()),
                status_tx,
            }),
        }
    }

    pub fn add(&self, handle: ConnectionHandle) {
        let mut connections = self.inner.connections.write();
        debug!(id = %handle.id, peer = %handle.peer, "connection added");
        connections.insert(handle.id, handle);
        self.publish_status(connections.len());
    }

    /// Retire une connexion; `false` si elle était déjà partie
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut connections = self.inner.connections.write();
        let removed = connections.remove(&id).is_some();
        if removed {
            debug!(id = %id, "connection removed");
            self.publish_status(connections.len());
        }
        removed
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.connections.read().contains_key(&id)
    }

    pub fn status(&self) -> Status {
        derive_status(self.len())
    }

    /// Receiver notified on every RED/GREEN transition.
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.inner.status_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn registered_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .values()
            .filter(|h| h.is_registered())
            .count()
    }

    pub fn snapshot(&self) -> Vec<ConnectionView> {
        let mut views: Vec<ConnectionView> =
            self.inner.connections.read().values().map(|h| h.view()).collect();
        views.sort_by_key(|v| v.id);
        views
    }

    /// Queue `message` on every live connection. Fire-and-forget: returns how
    /// many connections accepted it, failures are only logged.
    pub fn broadcast(&self, message: &Message) -> usize {
        let connections = self.inner.connections.read();
        let mut queued = 0;
        for handle in connections.values() {
            match handle.outbound.send(message.clone()) {
                Ok(()) => queued += 1,
                Err(_) => warn!(id = %handle.id, peer = %handle.peer, "broadcast: connection already closing"),
            }
        }
        info!(command = %message.command, queued, "broadcast sent");
        queued
    }

    fn publish_status(&self, live: usize) {
        let status = derive_status(live);
        let previous = self.inner.status_tx.send_replace(status);
        if previous != status {
            info!(from = %previous, to = %status, live, "cluster status changed");
        }
    }
}

fn derive_status(live: usize) -> Status {
    if live == 0 {
        Status::Red
    } else {
        Status::Green
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::new_state;

    fn handle(port: u16) -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let handle = ConnectionHandle::new(ConnectionId::next(), peer, tx, new_state(ConnectionState::connected()));
        (handle, rx)
    }

    #[test]
    fn test_status_follows_membership() {
        let registry = ClusterRegistry::new();
        assert_eq!(registry.status(), Status::Red);

        let (a, _rx_a) = handle(5001);
        let (b, _rx_b) = handle(5002);
        let (id_a, id_b) = (a.id, b.id);
        registry.add(a);
        registry.add(b);
        assert_eq!(registry.status(), Status::Green);
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(id_a));
        assert_eq!(registry.status(), Status::Green);
        assert!(registry.remove(id_b));
        assert_eq!(registry.status(), Status::Red);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ClusterRegistry::new();
        let (a, _rx) = handle(5003);
        let id = a.id;
        registry.add(a);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(!registry.remove(ConnectionId::next()));
        assert_eq!(registry.status(), Status::Red);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_watch_status_sees_transitions() {
        let registry = ClusterRegistry::new();
        let rx = registry.watch_status();
        assert_eq!(*rx.borrow(), Status::Red);

        let (a, _rx_a) = handle(5004);
        let id = a.id;
        registry.add(a);
        assert_eq!(*rx.borrow(), Status::Green);

        registry.remove(id);
        assert_eq!(*rx.borrow(), Status::Red);
    }

    #[test]
    fn test_broadcast_reaches_every_connection() {
        let registry = ClusterRegistry::new();
        let (a, mut rx_a) = handle(5005);
        let (b, rx_b) = handle(5006);
        registry.add(a);
        registry.add(b);
        drop(rx_b);

        let msg = Message::reply(discovery_protocol::Command::Message, Status::Success, "hello");
        assert_eq!(registry.broadcast(&msg), 1);
        assert_eq!(rx_a.try_recv().unwrap(), msg);
    }

    #[test]
    fn test_snapshot_and_registered_count() {
        let registry = ClusterRegistry::new();
        let (a, _rx_a) = handle(5007);
        let (b, _rx_b) = handle(5008);
        {
            let mut st = a.state.lock();
            st.status = Status::Registered;
            st.info = Some(NodeInfo::new("10.0.0.1", 8001));
        }
        registry.add(a);
        registry.add(b);

        assert_eq!(registry.registered_count(), 1);
        let views = registry.snapshot();
        assert_eq!(views.len(), 2);
        assert!(views[0].id < views[1].id);
        assert!(views.iter().any(|v| v.status == Status::Registered));

        let json = serde_json::to_value(&views[0]).unwrap();
        assert!(json["connected_at"].is_string());
    }
}
