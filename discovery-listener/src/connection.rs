/**
 * CONNECTION - State machine côté serveur, une tâche par socket acceptée
 *
 * RÔLE : Lit les frames une par une, dans l'ordre d'arrivée, et répond :
 * REGISTER → node_id, HEARTBEAT → réarme le timer d'éviction, le reste → ERROR.
 *
 * FONCTIONNEMENT :
 * - CONNECTED (après accept) → REGISTERED (après REGISTER valide) → CLOSED
 * - HEARTBEAT avant REGISTER : FAILURE puis fermeture forcée
 * - Timer d'éviction expiré : retrait du registry + fermeture socket
 * - Les messages broadcast passent par la file sortante de la connexion
 *
 * Toutes les écritures sur la socket sont faites par cette tâche.
 */

use discovery_protocol::command::{Command, Message, Status};
use discovery_protocol::node::NodeInfo;
use discovery_protocol::{FrameReader, FrameWriter, ProtocolError};
use serde_json::Value;
use std::future::pending;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::registry::{ClusterRegistry, ConnectionHandle, ConnectionId};
use crate::state::{new_state, ConnectionState, Shared};

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Used when a registrant does not announce a usable `heartbeat_timeout`.
    pub default_heartbeat_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            default_heartbeat_timeout: Duration::from_secs(10),
            max_frame_bytes: discovery_protocol::codec::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Transport,
    /// HEARTBEAT received before REGISTER.
    Refused,
    Unregistered,
    HeartbeatTimeout,
}

/// Deadline after which a silent connection is evicted.
///
/// Arming replaces (and so cancels) any previous deadline.
#[derive(Default)]
pub struct EvictionTimer {
    deadline: Option<Pin<Box<Sleep>>>,
}

impl EvictionTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, timeout: Duration) {
        self.deadline = Some(Box::pin(sleep(timeout)));
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Completes when the armed deadline passes; pends forever when unarmed.
    pub async fn expired(&mut self) {
        match self.deadline.as_mut() {
            Some(deadline) => deadline.as_mut().await,
            None => pending().await,
        }
    }
}

enum Event {
    Inbound(discovery_protocol::Result<Option<discovery_protocol::Result<Message>>>),
    Outbound(Message),
    Expired,
}

enum Flow {
    Continue,
    Close(CloseReason),
}

pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    status: Status,
    info: Option<NodeInfo>,
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    outbound: mpsc::UnboundedReceiver<Message>,
    eviction: EvictionTimer,
    shared: Shared<ConnectionState>,
    registry: ClusterRegistry,
    settings: ConnectionSettings,
}

impl Connection {
    /// Wraps an accepted socket and adds it to the registry.
    pub fn accept(
        stream: TcpStream,
        peer: SocketAddr,
        registry: ClusterRegistry,
        settings: ConnectionSettings,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let shared = new_state(ConnectionState::connected());
        let id = ConnectionId::next();

        registry.add(ConnectionHandle::new(id, peer, outbound_tx, shared.clone()));
        info!(id = %id, peer = %peer, "client connected");

        Self {
            id,
            peer,
            status: Status::Connected,
            info: None,
            reader: FrameReader::with_limit(read_half, settings.max_frame_bytes),
            writer: FrameWriter::new(write_half),
            outbound,
            eviction: EvictionTimer::new(),
            shared,
            registry,
            settings,
        }
    }

    /// Accepte et lance la tâche de la connexion
    pub fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
        registry: ClusterRegistry,
        settings: ConnectionSettings,
    ) -> JoinHandle<CloseReason> {
        let connection = Self::accept(stream, peer, registry, settings);
        tokio::spawn(connection.run())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn run(mut self) -> CloseReason {
        let reason = loop {
            let event = tokio::select! {
                inbound = self.reader.next_message() => Event::Inbound(inbound),
                Some(message) = self.outbound.recv() => Event::Outbound(message),
                _ = self.eviction.expired() => Event::Expired,
            };

            let flow = match event {
                Event::Inbound(inbound) => self.on_inbound(inbound).await,
                Event::Outbound(message) => {
                    self.send(&message).await;
                    Flow::Continue
                }
                Event::Expired => Flow::Close(CloseReason::HeartbeatTimeout),
            };

            if let Flow::Close(reason) = flow {
                break reason;
            }
        };

        self.close(reason).await;
        reason
    }

    async fn on_inbound(
        &mut self,
        inbound: discovery_protocol::Result<Option<discovery_protocol::Result<Message>>>,
    ) -> Flow {
        match inbound {
            Ok(Some(Ok(message))) => self.on_message(message).await,
            Ok(Some(Err(e))) => {
                warn!(peer = %self.peer, error = %e, "received wrong message");
                self.send(&Message::wrong_message()).await;
                Flow::Continue
            }
            Ok(None) => Flow::Close(CloseReason::PeerClosed),
            Err(ProtocolError::FrameTooLarge { limit }) => {
                // le reste de la frame trop grosse arrive encore : on coupe
                warn!(peer = %self.peer, limit, "frame too large, dropping connection");
                Flow::Close(CloseReason::Transport)
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "read failed");
                Flow::Close(CloseReason::Transport)
            }
        }
    }

    async fn on_message(&mut self, message: Message) -> Flow {
        debug!(peer = %self.peer, command = %message.command, "received");
        match message.command {
            Command::Register => self.on_register(message.data).await,
            Command::Heartbeat => self.on_heartbeat(message.data).await,
            Command::Unregister => self.on_unregister().await,
            Command::Error | Command::Warning | Command::Message | Command::Unrecognized => {
                error!(peer = %self.peer, data = %message.data, "invalid message");
                self.send(&Message::unknown_command()).await;
                Flow::Continue
            }
        }
    }

    async fn on_register(&mut self, data: Value) -> Flow {
        let mut info = match NodeInfo::from_value(&data) {
            Ok(info) => info,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "REGISTER data is not an object");
                self.send(&Message::wrong_message()).await;
                return Flow::Continue;
            }
        };
        info.resolve_host(self.peer.ip());

        let node_id = match info.node_id.clone() {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                info.node_id = Some(id.clone());
                id
            }
        };

        self.status = Status::Registered;
        self.eviction.arm(self.heartbeat_timeout(&info));
        self.store_info(info, false);
        info!(peer = %self.peer, node_id = %node_id, "node registered");

        self.send(&Message::register_success(&node_id)).await;
        Flow::Continue
    }

    async fn on_heartbeat(&mut self, data: Value) -> Flow {
        let parsed = NodeInfo::from_value(&data);

        if self.status != Status::Registered {
            let node_id = parsed.as_ref().ok().map(NodeInfo::display_id).unwrap_or("None");
            let reply = Message::reply(
                Command::Heartbeat,
                Status::Failure,
                format!("invalid node_id: {node_id}"),
            );
            self.send(&reply).await;
            return Flow::Close(CloseReason::Refused);
        }

        let mut info = match parsed {
            Ok(info) => info,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "HEARTBEAT data is not an object");
                self.send(&Message::wrong_message()).await;
                return Flow::Continue;
            }
        };
        info.resolve_host(self.peer.ip());

        let timeout = self.heartbeat_timeout(&info);
        self.eviction.arm(timeout);
        debug!(peer = %self.peer, node_id = info.display_id(), ?timeout, "heartbeat");
        self.store_info(info, true);

        self.send(&Message::reply(Command::Heartbeat, Status::Success, Status::Success.to_string()))
            .await;
        Flow::Continue
    }

    async fn on_unregister(&mut self) -> Flow {
        if self.status != Status::Registered {
            self.send(&Message::reply(Command::Unregister, Status::Failure, "not registered"))
                .await;
            return Flow::Continue;
        }
        self.send(&Message::reply(Command::Unregister, Status::Success, Status::Success.to_string()))
            .await;
        Flow::Close(CloseReason::Unregistered)
    }

    fn heartbeat_timeout(&self, info: &NodeInfo) -> Duration {
        info.heartbeat_timeout()
            .unwrap_or(self.settings.default_heartbeat_timeout)
    }

    fn store_info(&mut self, info: NodeInfo, heartbeat: bool) {
        let mut shared = self.shared.lock();
        shared.status = self.status;
        shared.info = Some(info.clone());
        if heartbeat {
            shared.last_heartbeat = Some(OffsetDateTime::now_utc());
        }
        drop(shared);
        self.info = Some(info);
    }

    /// Best effort: a failed write surfaces on the next read as a closed stream.
    async fn send(&mut self, message: &Message) {
        if let Err(e) = self.writer.send(message).await {
            warn!(peer = %self.peer, command = %message.command, error = %e, "send failed");
        }
    }

    async fn close(&mut self, reason: CloseReason) {
        self.eviction.cancel();
        self.registry.remove(self.id);

        let node_id = self.info.as_ref().map(NodeInfo::display_id).unwrap_or("None");
        match reason {
            CloseReason::HeartbeatTimeout => {
                warn!(peer = %self.peer, node_id, "heartbeat timeout, connection evicted")
            }
            CloseReason::Refused => warn!(peer = %self.peer, node_id, "connection refused"),
            CloseReason::Unregistered => info!(peer = %self.peer, node_id, "node unregistered"),
            CloseReason::PeerClosed | CloseReason::Transport => {
                info!(peer = %self.peer, node_id, "client closed")
            }
        }

        if let Err(e) = self.writer.shutdown().await {
            debug!(peer = %self.peer, error = %e, "shutdown after close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use discovery_protocol::codec::{encode, SEP, END};
    use serde_json::json;
    use tokio::net::TcpListener;

    struct Peer {
        reader: FrameReader<OwnedReadHalf>,
        writer: FrameWriter<OwnedWriteHalf>,
    }

    impl Peer {
        async fn send(&mut self, command: Command, data: Value) {
            self.writer.send(&Message::new(command, data)).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Message> {
            tokio::time::timeout(Duration::from_secs(2), self.reader.next_message())
                .await
                .expect("no reply in time")
                .ok()
                .flatten()
                .map(|m| m.unwrap())
        }
    }

    async fn setup(settings: ConnectionSettings) -> (Peer, ClusterRegistry, JoinHandle<CloseReason>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let registry = ClusterRegistry::new();
        let task = Connection::spawn(stream, peer, registry.clone(), settings);

        let (r, w) = client.into_split();
        let peer = Peer { reader: FrameReader::new(r), writer: FrameWriter::new(w) };
        (peer, registry, task)
    }

    fn register_data(node_id: Option<&str>, timeout: f64) -> Value {
        json!({"http_host": "0.0.0.0", "http_port": 8001, "node_id": node_id, "heartbeat_timeout": timeout})
    }

    #[tokio::test]
    async fn test_register_without_id_generates_one() {
        let (mut peer, registry, _task) = setup(ConnectionSettings::default()).await;

        peer.send(Command::Register, register_data(None, 5.0)).await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.command, Command::Register);
        let reply = reply.as_reply().unwrap();
        assert_eq!(reply.status, Status::Success);
        let node_id = reply.node_id.unwrap();
        assert!(Uuid::parse_str(&node_id).is_ok());

        let views = registry.snapshot();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].status, Status::Registered);
        assert_eq!(views[0].node_id.as_deref(), Some(node_id.as_str()));
        // 0.0.0.0 remplacé par l'IP vue sur la socket
        assert_eq!(views[0].info.as_ref().unwrap().http_host, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_register_with_id_is_echoed() {
        let (mut peer, _registry, _task) = setup(ConnectionSettings::default()).await;

        peer.send(Command::Register, register_data(Some("node-42"), 5.0)).await;
        let reply = peer.recv().await.unwrap().as_reply().unwrap();
        assert_eq!(reply.node_id.as_deref(), Some("node-42"));
    }

    #[tokio::test]
    async fn test_heartbeat_before_register_is_refused() {
        let (mut peer, registry, task) = setup(ConnectionSettings::default()).await;
        assert_eq!(registry.len(), 1);

        peer.send(Command::Heartbeat, register_data(Some("ghost"), 5.0)).await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.command, Command::Heartbeat);
        let reply = reply.as_reply().unwrap();
        assert_eq!(reply.status, Status::Failure);
        assert_eq!(reply.message, "invalid node_id: ghost");

        assert!(peer.recv().await.is_none(), "server should close the socket");
        assert_eq!(task.await.unwrap(), CloseReason::Refused);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_after_register_keeps_connection() {
        let (mut peer, registry, task) = setup(ConnectionSettings::default()).await;

        peer.send(Command::Register, register_data(Some("n1"), 5.0)).await;
        peer.recv().await.unwrap();

        peer.send(Command::Heartbeat, register_data(Some("n1"), 5.0)).await;
        let reply = peer.recv().await.unwrap().as_reply().unwrap();
        assert_eq!(reply.status, Status::Success);

        assert_eq!(registry.len(), 1);
        assert!(registry.snapshot()[0].last_heartbeat.is_some());
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_register_with_loosely_typed_fields() {
        let (mut peer, registry, _task) = setup(ConnectionSettings::default()).await;

        peer.send(
            Command::Register,
            json!({"http_host": "0.0.0.0", "http_port": "8001", "node_id": 7}),
        )
        .await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.command, Command::Register);
        let reply = reply.as_reply().unwrap();
        assert_eq!(reply.status, Status::Success);
        assert_eq!(reply.node_id.as_deref(), Some("7"));

        assert_eq!(registry.registered_count(), 1);
        let info = registry.snapshot()[0].info.clone().unwrap();
        assert_eq!(info.http_port, json!("8001"));
        assert_eq!(info.http_host, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_heartbeat_with_string_port_rearms() {
        let (mut peer, registry, task) = setup(ConnectionSettings::default()).await;

        peer.send(Command::Register, register_data(Some("n1"), 0.5)).await;
        peer.recv().await.unwrap();

        // 1s au total, bien au-delà du timeout de 0.5s
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            peer.send(
                Command::Heartbeat,
                json!({"http_host": "0.0.0.0", "http_port": "1", "node_id": "n1", "heartbeat_timeout": 0.5}),
            )
            .await;
            let reply = peer.recv().await.unwrap();
            assert_eq!(reply.command, Command::Heartbeat);
            assert_eq!(reply.as_reply().unwrap().status, Status::Success);
        }

        assert!(!task.is_finished());
        assert_eq!(registry.registered_count(), 1);
    }

    #[tokio::test]
    async fn test_register_with_non_object_data() {
        let (mut peer, registry, task) = setup(ConnectionSettings::default()).await;

        peer.send(Command::Register, json!("not a node")).await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.command, Command::Error);
        assert_eq!(reply.as_reply().unwrap().message, "Server received wrong message!");

        assert_eq!(registry.registered_count(), 0);
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_corrupted_frame_gets_error_and_stays_open() {
        let (mut peer, registry, _task) = setup(ConnectionSettings::default()).await;

        let mut frame = br#"{"command":"REGISTER","data":{}}"#.to_vec();
        frame.extend_from_slice(SEP);
        frame.extend_from_slice(b"DEADBEEF");
        frame.extend_from_slice(END);
        peer.writer.send_raw(&frame).await.unwrap();

        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.command, Command::Error);
        assert_eq!(reply.as_reply().unwrap().message, "Server received wrong message!");

        // toujours utilisable
        peer.writer.send_raw(&encode(b"[1,2")).await.unwrap();
        assert_eq!(peer.recv().await.unwrap().command, Command::Error);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (mut peer, registry, _task) = setup(ConnectionSettings::default()).await;

        peer.writer
            .send_raw(&encode(br#"{"command":"PING","data":{}}"#))
            .await
            .unwrap();
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.command, Command::Error);
        assert_eq!(reply.as_reply().unwrap().message, "Unknown Command!");

        peer.send(Command::Message, json!({"text": "hi"})).await;
        assert_eq!(peer.recv().await.unwrap().as_reply().unwrap().message, "Unknown Command!");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_silent_node_is_evicted() {
        let (mut peer, registry, task) = setup(ConnectionSettings::default()).await;

        peer.send(Command::Register, register_data(None, 0.3)).await;
        peer.recv().await.unwrap();
        assert_eq!(registry.status(), Status::Green);

        assert_eq!(task.await.unwrap(), CloseReason::HeartbeatTimeout);
        assert!(registry.is_empty());
        assert_eq!(registry.status(), Status::Red);
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeats_rearm_the_deadline() {
        let (mut peer, registry, task) = setup(ConnectionSettings::default()).await;

        peer.send(Command::Register, register_data(Some("n1"), 0.4)).await;
        peer.recv().await.unwrap();

        // 8 × 150ms = 1.2s, bien au-delà d'un seul timeout de 400ms
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            peer.send(Command::Heartbeat, register_data(Some("n1"), 0.4)).await;
            assert_eq!(peer.recv().await.unwrap().as_reply().unwrap().status, Status::Success);
        }
        assert_eq!(registry.len(), 1);
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_default_timeout_when_not_announced() {
        let settings = ConnectionSettings {
            default_heartbeat_timeout: Duration::from_millis(200),
            ..ConnectionSettings::default()
        };
        let (mut peer, registry, task) = setup(settings).await;

        peer.send(Command::Register, json!({"http_host": "10.1.1.1", "http_port": 80})).await;
        peer.recv().await.unwrap();

        assert_eq!(task.await.unwrap(), CloseReason::HeartbeatTimeout);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unregister() {
        let (mut peer, registry, task) = setup(ConnectionSettings::default()).await;

        peer.writer.send(&Message::unregister()).await.unwrap();
        let reply = peer.recv().await.unwrap().as_reply().unwrap();
        assert_eq!(reply.status, Status::Failure);

        peer.send(Command::Register, register_data(Some("n1"), 5.0)).await;
        peer.recv().await.unwrap();
        peer.writer.send(&Message::unregister()).await.unwrap();
        let reply = peer.recv().await.unwrap().as_reply().unwrap();
        assert_eq!(reply.status, Status::Success);

        assert_eq!(task.await.unwrap(), CloseReason::Unregistered);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_removes_connection() {
        let (peer, registry, task) = setup(ConnectionSettings::default()).await;
        assert_eq!(registry.len(), 1);

        drop(peer);
        assert_eq!(task.await.unwrap(), CloseReason::PeerClosed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_is_delivered() {
        let (mut peer, registry, _task) = setup(ConnectionSettings::default()).await;

        let msg = Message::new(Command::Message, json!({"text": "reindex"}));
        assert_eq!(registry.broadcast(&msg), 1);
        assert_eq!(peer.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_eviction_timer() {
        let mut timer = EvictionTimer::new();
        assert!(!timer.is_armed());
        assert!(tokio::time::timeout(Duration::from_millis(30), timer.expired()).await.is_err());

        timer.arm(Duration::from_millis(10));
        assert!(timer.is_armed());
        tokio::time::timeout(Duration::from_millis(500), timer.expired()).await.unwrap();

        timer.arm(Duration::from_millis(10));
        timer.cancel();
        assert!(tokio::time::timeout(Duration::from_millis(50), timer.expired()).await.is_err());
    }
}
