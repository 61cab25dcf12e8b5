//! One TCP connection from a registrant to the listener.

use discovery_protocol::{Command, FrameReader, FrameWriter, Message, Reply};
use std::net::SocketAddr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::error::{RegistrantError, Result};

pub struct Link {
    pub(crate) reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    peer: SocketAddr,
}

impl Link {
    pub async fn dial(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| RegistrantError::Dial { addr: format!("{host}:{port}"), source })?;
        let peer = stream.peer_addr().map_err(|source| RegistrantError::Dial {
            addr: format!("{host}:{port}"),
            source,
        })?;
        let (read_half, write_half) = stream.into_split();
        info!(peer = %peer, "Client on connect");
        Ok(Self {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        debug!(command = %message.command, "Send");
        self.writer.send(message).await?;
        Ok(())
    }

    /// Waits for the reply to `expected`, logging anything else the server
    /// pushes in between (broadcasts). An ERROR from the server while waiting
    /// means the request was not understood.
    pub async fn recv_reply(&mut self, expected: Command) -> Result<Reply> {
        loop {
            match self.reader.next_message().await? {
                None => return Err(RegistrantError::Closed),
                Some(Err(e)) => error!(error = %e, "Client received wrong message!"),
                Some(Ok(message)) if message.command == expected => return Ok(message.as_reply()?),
                Some(Ok(message)) if message.command == Command::Error => {
                    let reason = message
                        .as_reply()
                        .map(|reply| reply.message)
                        .unwrap_or_else(|_| message.data.to_string());
                    return Err(RegistrantError::Rejected(reason));
                }
                Some(Ok(message)) => log_unsolicited(&message),
            }
        }
    }

    pub async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "stream already closed");
        }
    }
}

pub(crate) fn log_unsolicited(message: &Message) {
    match message.command {
        Command::Error => error!(data = %message.data, "Client received error"),
        Command::Warning => warn!(data = %message.data, "Client received warning"),
        _ => info!(command = %message.command, data = %message.data, "Client received message"),
    }
}
