/*!
Pair TCP brut pour tester le listener sans registrant

Parle le protocole trame par trame et garde la trace de tout ce qu'il reçoit.
Peut aussi envoyer des octets arbitraires (trames corrompues, fragments).
*/

use anyhow::{Context, Result};
use discovery_protocol::{codec, Command, FrameReader, FrameWriter, Message, Reply};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

pub struct MockPeer {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    local: SocketAddr,
    received: Arc<Mutex<Vec<Message>>>,
}

impl MockPeer {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        let local = stream.local_addr()?;
        let (r, w) = stream.into_split();
        log::debug!("[MOCK] connected {local} -> {addr}");
        Ok(Self {
            reader: FrameReader::new(r),
            writer: FrameWriter::new(w),
            local,
            received: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        self.writer.send(message).await?;
        log::debug!("[MOCK] sent {}", message.command);
        Ok(())
    }

    /// Octets bruts, sans framing
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.send_raw(bytes).await?;
        Ok(())
    }

    /// Trame bien formée dont le checksum ne correspond pas au payload
    pub async fn send_corrupted(&mut self, message: &Message) -> Result<()> {
        let mut frame = codec::encode(&message.to_payload()?);
        // premier octet du payload : toujours '{'
        frame[0] ^= 0x01;
        self.send_raw(&frame).await
    }

    /// Prochain message, `None` si le serveur a fermé ou si rien n'arrive
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        self.recv_within(RECV_TIMEOUT).await
    }

    pub async fn recv_within(&mut self, wait: Duration) -> Result<Option<Message>> {
        let next = match tokio::time::timeout(wait, self.reader.next_message()).await {
            Ok(next) => next?,
            Err(_) => return Ok(None),
        };
        match next {
            Some(Ok(message)) => {
                self.received.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.push(message.clone());
                Ok(Some(message))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Attend une réponse à `command` et la décode
    pub async fn expect_reply(&mut self, command: Command) -> Result<Reply> {
        let message = self
            .recv()
            .await?
            .with_context(|| format!("no {command} reply"))?;
        anyhow::ensure!(
            message.command == command,
            "expected {command} reply, got {} {}",
            message.command,
            message.data
        );
        Ok(message.as_reply()?)
    }

    /// Vrai si le serveur ferme le flux dans le délai
    pub async fn wait_closed(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return false;
            }
            match tokio::time::timeout(left, self.reader.next_message()).await {
                Err(_) => return false,
                Ok(Ok(None)) | Ok(Err(_)) => return true,
                Ok(Ok(Some(_))) => continue,
            }
        }
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }
}
