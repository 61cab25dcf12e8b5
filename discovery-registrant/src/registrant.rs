//! Client side of the discovery protocol.
//!
//! A [`Registrant`] runs as a supervisor task:
//! - dials the listener and sends REGISTER with the node info from the store
//! - keeps the server-assigned node_id and reuses it on every reconnect
//! - sends HEARTBEAT every `heartbeat_interval` while registered
//! - on close, waits `retry_interval` and starts over while `reconnect` holds
//!
//! The owner drives it through a [`RegistrantHandle`].

use chrono::{DateTime, Utc};
use discovery_protocol::node::secs_to_duration;
use discovery_protocol::{Command, ConfigStore, Message, NodeInfo, Reply, Status};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RegistrantError, Result};
use crate::link::{log_unsolicited, Link};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrantState {
    Disconnected,
    Connecting,
    ConnectedUnregistered,
    Registered,
    Reconnecting,
}

impl fmt::Display for RegistrantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistrantState::Disconnected => "DISCONNECTED",
            RegistrantState::Connecting => "CONNECTING",
            RegistrantState::ConnectedUnregistered => "CONNECTED_UNREGISTERED",
            RegistrantState::Registered => "REGISTERED",
            RegistrantState::Reconnecting => "RECONNECTING",
        };
        f.write_str(s)
    }
}

/// Where to register and how to behave on failures.
#[derive(Debug, Clone)]
pub struct RegistrantSettings {
    pub host: String,
    pub port: u16,
    /// Constant delay between two connection attempts.
    pub retry_interval: Duration,
    pub reconnect: bool,
    /// Delay between `shutdown()` and the actual close of the stream.
    pub close_grace: Duration,
    pub register_timeout: Duration,
}

impl RegistrantSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            retry_interval: Duration::from_secs(10),
            reconnect: true,
            close_grace: Duration::from_secs(5),
            register_timeout: Duration::from_secs(10),
        }
    }
}

struct Control {
    reconnect: AtomicBool,
    attempts: AtomicU64,
    shutdown: CancellationToken,
}

enum Request {
    Unregister(oneshot::Sender<Result<Reply>>),
}

enum Outcome {
    Closed,
    ShutDown,
}

enum Event {
    Tick,
    Inbound(discovery_protocol::Result<Option<discovery_protocol::Result<Message>>>),
    Request(Request),
    Shutdown,
}

pub struct Registrant {
    settings: RegistrantSettings,
    store: ConfigStore,
    control: Arc<Control>,
    state: watch::Sender<RegistrantState>,
    requests: mpsc::UnboundedReceiver<Request>,
    shutdown: CancellationToken,
    registered_at: Option<DateTime<Utc>>,
}

/// Owner side of a running [`Registrant`].
pub struct RegistrantHandle {
    control: Arc<Control>,
    state: watch::Receiver<RegistrantState>,
    requests: mpsc::UnboundedSender<Request>,
    store: ConfigStore,
    register_timeout: Duration,
    task: JoinHandle<()>,
}

impl Registrant {
    /// Starts the supervisor task; the first connection attempt happens
    /// right away.
    pub fn spawn(settings: RegistrantSettings, store: ConfigStore) -> RegistrantHandle {
        let shutdown = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(RegistrantState::Disconnected);
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let control = Arc::new(Control {
            reconnect: AtomicBool::new(settings.reconnect),
            attempts: AtomicU64::new(0),
            shutdown: shutdown.clone(),
        });
        let register_timeout = settings.register_timeout;

        let registrant = Registrant {
            settings,
            store: store.clone(),
            control: control.clone(),
            state: state_tx,
            requests,
            shutdown,
            registered_at: None,
        };
        let task = tokio::spawn(registrant.supervise());

        RegistrantHandle {
            control,
            state: state_rx,
            requests: requests_tx,
            store,
            register_timeout,
            task,
        }
    }

    async fn supervise(mut self) {
        loop {
            match self.connect().await {
                Ok(link) => {
                    if let Outcome::ShutDown = self.drive(link).await {
                        break;
                    }
                    self.on_close();
                }
                Err(RegistrantError::ShutDown) => break,
                Err(e) => warn!(error = %e, "Connect to Server failed"),
            }

            if !self.reconnect() {
                info!("Close Client!");
                break;
            }
            self.set_state(RegistrantState::Reconnecting);
            info!(retry_in = ?self.settings.retry_interval, "Reconnect to Server ...");
            if !self.wait_retry().await || !self.reconnect() {
                break;
            }
        }
        self.set_state(RegistrantState::Disconnected);
    }

    /// Dial, then REGISTER. Gives up early when shutdown is requested.
    async fn connect(&mut self) -> Result<Link> {
        let cancel = self.shutdown.clone();
        tokio::select! {
            result = self.establish() => result,
            _ = cancel.cancelled() => Err(RegistrantError::ShutDown),
        }
    }

    async fn establish(&mut self) -> Result<Link> {
        self.set_state(RegistrantState::Connecting);
        let attempt = self.control.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(attempt, host = %self.settings.host, port = self.settings.port, "connecting");

        let mut link = Link::dial(&self.settings.host, self.settings.port).await?;
        self.set_state(RegistrantState::ConnectedUnregistered);

        let reply = match self.register(&mut link).await {
            Ok(reply) => reply,
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };
        info!(node_id = reply.node_id.as_deref().unwrap_or("None"), "Client Register Received Message");
        self.registered_at = Some(Utc::now());
        self.set_state(RegistrantState::Registered);
        Ok(link)
    }

    async fn register(&mut self, link: &mut Link) -> Result<Reply> {
        let info = self.node_info()?;
        link.send(&Message::new(Command::Register, serde_json::to_value(&info)?))
            .await?;

        let timeout = self.settings.register_timeout;
        let reply = tokio::time::timeout(timeout, link.recv_reply(Command::Register))
            .await
            .map_err(|_| RegistrantError::Timeout(timeout))??;

        if reply.status != Status::Success {
            return Err(RegistrantError::Rejected(reply.message));
        }
        let Some(node_id) = reply.node_id.clone() else {
            return Err(RegistrantError::Rejected("REGISTER reply without node_id".into()));
        };
        if info.node_id.is_none() {
            self.store.set("node_id", &node_id)?;
            info!(node_id = %node_id, "Received new node_id");
        }
        Ok(reply)
    }

    /// Heartbeat loop on a registered link, until it closes or shutdown.
    async fn drive(&mut self, mut link: Link) -> Outcome {
        let period = self.heartbeat_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let link_cancel = self.shutdown.child_token();
        let mut pending_unregister: Option<oneshot::Sender<Result<Reply>>> = None;

        loop {
            let event = tokio::select! {
                _ = ticker.tick() => Event::Tick,
                inbound = link.reader.next_message() => Event::Inbound(inbound),
                Some(request) = self.requests.recv() => Event::Request(request),
                _ = link_cancel.cancelled() => Event::Shutdown,
            };

            match event {
                Event::Tick => {
                    if let Err(e) = self.heartbeat(&mut link).await {
                        // la fermeture remonte au prochain read
                        error!(error = %e, "heartbeat send failed");
                    }
                }
                Event::Inbound(Ok(Some(Ok(message)))) => {
                    self.on_message(message, &mut pending_unregister);
                }
                Event::Inbound(Ok(Some(Err(e)))) => {
                    error!(error = %e, "Client received wrong message!");
                }
                Event::Inbound(Ok(None)) => return Outcome::Closed,
                Event::Inbound(Err(e)) => {
                    debug!(error = %e, "read failed");
                    return Outcome::Closed;
                }
                Event::Request(Request::Unregister(reply_to)) => {
                    match link.send(&Message::unregister()).await {
                        Ok(()) => pending_unregister = Some(reply_to),
                        Err(e) => {
                            let _ = reply_to.send(Err(e));
                        }
                    }
                }
                Event::Shutdown => {
                    drop(ticker);
                    tokio::time::sleep(self.settings.close_grace).await;
                    link.close().await;
                    return Outcome::ShutDown;
                }
            }
        }
    }

    async fn heartbeat(&mut self, link: &mut Link) -> Result<()> {
        let info = self.node_info()?;
        link.send(&Message::new(Command::Heartbeat, serde_json::to_value(&info)?))
            .await
    }

    fn on_message(&self, message: Message, pending_unregister: &mut Option<oneshot::Sender<Result<Reply>>>) {
        match message.command {
            Command::Heartbeat => match message.as_reply() {
                Ok(reply) if reply.status == Status::Success => {
                    debug!(message = %reply.message, "Client Received Heartbeat Message")
                }
                Ok(reply) => error!(message = %reply.message, "Client Received Heartbeat Message"),
                Err(e) => error!(error = %e, "malformed heartbeat reply"),
            },
            Command::Unregister => {
                let reply = message.as_reply().map_err(RegistrantError::from);
                info!(data = %message.data, "Client Received Message");
                if let Some(reply_to) = pending_unregister.take() {
                    let _ = reply_to.send(reply);
                }
            }
            Command::Register => debug!(data = %message.data, "late REGISTER reply"),
            _ => log_unsolicited(&message),
        }
    }

    fn on_close(&mut self) {
        let registered_for = self
            .registered_at
            .take()
            .map(|at| (Utc::now() - at).num_seconds())
            .unwrap_or_default();
        info!(registered_for_secs = registered_for, "Client closed by Server!");
    }

    /// Sleeps `retry_interval`; `false` if shutdown was requested meanwhile.
    async fn wait_retry(&mut self) -> bool {
        // aucune connexion : les requêtes en attente échouent tout de suite
        while let Ok(Request::Unregister(reply_to)) = self.requests.try_recv() {
            let _ = reply_to.send(Err(RegistrantError::Closed));
        }
        let cancel = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.settings.retry_interval) => true,
            _ = cancel.cancelled() => false,
        }
    }

    fn node_info(&self) -> Result<NodeInfo> {
        Ok(NodeInfo::from_value(&Value::Object(self.store.to_dict()))?)
    }

    fn heartbeat_interval(&self) -> Duration {
        self.store
            .get_as::<f64>("heartbeat_interval")
            .and_then(secs_to_duration)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL)
    }

    fn reconnect(&self) -> bool {
        self.control.reconnect.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: RegistrantState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "registrant state");
        }
    }
}

impl RegistrantHandle {
    pub fn state(&self) -> RegistrantState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RegistrantState> {
        self.state.clone()
    }

    /// node_id assigned by the server, once registered at least once.
    pub fn node_id(&self) -> Option<String> {
        self.store.get_as::<String>("node_id")
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Number of connection attempts made so far.
    pub fn connect_attempts(&self) -> u64 {
        self.control.attempts.load(Ordering::SeqCst)
    }

    pub fn reconnect(&self) -> bool {
        self.control.reconnect.load(Ordering::SeqCst)
    }

    /// Pris en compte à la prochaine fermeture ou au prochain retry
    pub fn set_reconnect(&self, reconnect: bool) {
        self.control.reconnect.store(reconnect, Ordering::SeqCst);
    }

    /// Sends UNREGISTER and waits for the acknowledgment. The listener closes
    /// the connection afterwards, so with `reconnect` still on the registrant
    /// registers again after `retry_interval`.
    pub async fn unregister(&self) -> Result<Reply> {
        let (reply_to, reply) = oneshot::channel();
        self.requests
            .send(Request::Unregister(reply_to))
            .map_err(|_| RegistrantError::ShutDown)?;
        match tokio::time::timeout(self.register_timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RegistrantError::Closed),
            Err(_) => Err(RegistrantError::Timeout(self.register_timeout)),
        }
    }

    /// Stops reconnecting and heartbeating, closes the stream after the
    /// grace period. No UNREGISTER is sent.
    pub async fn shutdown(self) {
        self.set_reconnect(false);
        self.control.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "registrant task failed");
        }
        info!("Close Client!");
    }
}
