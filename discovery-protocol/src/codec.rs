//! Checksummed framing over a byte stream.
//!
//! Wire format: `PAYLOAD || SEP || CRC32_HEX || END` where `SEP` is
//! `\r\n\r\n`, `END` is `\r\n\r\n\r\n` and `CRC32_HEX` is the IEEE CRC-32 of
//! the raw payload as 8 upper-case hex digits.
//!
//! A reader stops at the first `END`, so a payload must never contain the
//! `END` sequence nor end with `\r\n`. Compact JSON satisfies both: CR and LF
//! inside strings are escaped and an object always ends with `}`. Nothing is
//! escaped on the wire; this is a protocol-level constraint.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use crate::command::Message;
use crate::error::{ProtocolError, Result};

pub const SEP: &[u8] = b"\r\n\r\n";
pub const END: &[u8] = b"\r\n\r\n\r\n";
pub const CHECKSUM_LEN: usize = 8;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

pub fn checksum(payload: &[u8]) -> String {
    format!("{:08X}", crc32fast::hash(payload))
}

pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + SEP.len() + CHECKSUM_LEN + END.len());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(SEP);
    frame.extend_from_slice(checksum(payload).as_bytes());
    frame.extend_from_slice(END);
    frame
}

/// Splits a frame into its payload and checks it against the transmitted
/// checksum.
///
/// The terminator is stripped first, then the remainder is split in two on
/// the last separator. A frame without terminator or separator comes back
/// whole with `valid == false`.
pub fn decode(frame: &[u8]) -> (&[u8], bool) {
    let Some(body) = frame.strip_suffix(END) else {
        return (frame, false);
    };
    let Some(split) = rfind(body, SEP) else {
        return (body, false);
    };
    let payload = &body[..split];
    let transmitted = &body[split + SEP.len()..];
    let valid = transmitted.len() == CHECKSUM_LEN && checksum(payload).as_bytes() == transmitted;
    (payload, valid)
}

/// Décode une frame complète en `Message` (checksum puis JSON)
pub fn parse_frame(frame: &[u8]) -> Result<Message> {
    match decode(frame) {
        (payload, true) => Message::from_payload(payload),
        (payload, false) => {
            debug!(frame_len = frame.len(), payload_len = payload.len(), "frame rejected: checksum mismatch");
            Err(ProtocolError::FrameIntegrity)
        }
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

/// Reads whole frames off a stream.
///
/// `next_frame` is cancel safe: bytes of a partially received frame stay
/// buffered in the reader, so it can sit in a `tokio::select!` arm.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_limit(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Next raw frame, `END` included. `Ok(None)` on a clean end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let buffered = self.buf.len();
                debug!(buffered, "stream ended inside a frame");
                self.buf.clear();
                return Err(ProtocolError::UnexpectedEof { buffered });
            }

            let (line_done, used) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (true, i + 1),
                None => (false, available.len()),
            };
            self.buf.extend_from_slice(&available[..used]);
            self.inner.consume(used);

            if line_done && self.buf.ends_with(END) {
                trace!(len = self.buf.len(), "frame received");
                return Ok(Some(std::mem::take(&mut self.buf)));
            }
            if self.buf.len() > self.max_frame_bytes {
                debug!(buffered = self.buf.len(), limit = self.max_frame_bytes, "frame over size limit");
                self.buf.clear();
                return Err(ProtocolError::FrameTooLarge { limit: self.max_frame_bytes });
            }
        }
    }

    /// Reads and parses the next frame. A frame that fails its checksum or
    /// is not JSON yields `Some(Err(..))` so the caller can answer it.
    pub async fn next_message(&mut self) -> Result<Option<Result<Message>>> {
        Ok(self.next_frame().await?.map(|frame| parse_frame(&frame)))
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let payload = message.to_payload()?;
        self.send_raw(&encode(&payload)).await
    }

    /// Writes bytes as-is, used for already encoded (or deliberately broken)
    /// frames.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
