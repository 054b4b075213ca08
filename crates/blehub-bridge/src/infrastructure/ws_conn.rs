//! WebSocket I/O over a byte stream: the opening handshake, an incremental
//! frame reader, and a frame writer.
//!
//! # Binary streaming protocol
//!
//! TCP is a *stream* protocol: a single `read()` call may return less than one
//! complete frame, or more than one.  [`FrameReader`] buffers incoming bytes
//! and uses [`blehub_core::decode_frame`] to extract complete frames from the
//! buffer one at a time.
//!
//! # Cancel safety
//!
//! [`FrameReader::next_inbound`] only mutates its buffer after a `read()`
//! has completed, so it can sit in a `tokio::select!` branch: if another
//! branch wins, no bytes are lost and the next call picks up where this one
//! left off.
//!
//! The reader and writer are generic over `AsyncRead` / `AsyncWrite`, so
//! tests drive them with `tokio::io::duplex` instead of a real socket.

use blehub_core::protocol::{classify, decode_frame, encode_frame, Inbound, Opcode};
use blehub_core::{FrameError, Handshake, HandshakeError, HandshakeState};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::domain::HubToClientMsg;

/// Longest handshake line accepted, in bytes.
pub const MAX_LINE_LEN: usize = 8 * 1024;

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

/// Errors on one WebSocket connection.
#[derive(Debug, Error)]
pub enum WsConnError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),

    /// The peer violated the framing rules; the connection cannot continue.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("handshake line longer than {0} bytes")]
    LineTooLong(usize),

    /// The peer closed the stream in the middle of a handshake or frame.
    #[error("peer closed the connection mid-{0}")]
    UnexpectedEof(&'static str),

    #[error("could not encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Reads the HTTP upgrade request line by line and answers it.
///
/// `reader` must be the buffered reader the frames are read from afterwards,
/// so bytes the client sent right behind the request are not lost.
///
/// On a malformed request a `400 Bad Request` is written (best effort) before
/// the error is returned.
pub async fn accept_handshake<R, W>(reader: &mut R, writer: &mut W) -> Result<Handshake, WsConnError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut handshake = Handshake::new();
    match read_request(reader, &mut handshake).await {
        Ok(response) => {
            writer.write_all(response.as_bytes()).await?;
            writer.flush().await?;
            debug!(
                "handshake complete for {}",
                handshake
                    .request_line()
                    .map(|r| r.target.as_str())
                    .unwrap_or("?")
            );
            Ok(handshake)
        }
        Err(e @ (WsConnError::Handshake(_) | WsConnError::LineTooLong(_))) => {
            let _ = writer.write_all(BAD_REQUEST).await;
            let _ = writer.flush().await;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

async fn read_request<R>(reader: &mut R, handshake: &mut Handshake) -> Result<String, WsConnError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        // One byte past the limit tells "too long" apart from "exactly full".
        let n = (&mut *reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_line(&mut line)
            .await?;
        if n == 0 {
            return Err(WsConnError::UnexpectedEof("handshake"));
        }
        if !line.ends_with('\n') {
            return Err(if line.len() > MAX_LINE_LEN {
                WsConnError::LineTooLong(MAX_LINE_LEN)
            } else {
                WsConnError::UnexpectedEof("handshake")
            });
        }
        if handshake.feed_line(&line)? == HandshakeState::Complete {
            return Ok(handshake.response()?);
        }
    }
}

// ── Frame reader ──────────────────────────────────────────────────────────────

/// Reads frames from the client, one [`Inbound`] at a time.
pub struct FrameReader<R> {
    inner: R,
    /// Streaming receive buffer; accumulates bytes across `read()` calls.
    recv_buf: Vec<u8>,
    max_payload: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_payload: usize) -> Self {
        Self {
            inner,
            recv_buf: Vec::with_capacity(4096),
            max_payload,
        }
    }

    /// Returns the next complete frame, classified.
    ///
    /// `Ok(None)` means the peer closed the stream cleanly between frames.
    ///
    /// # Errors
    ///
    /// - [`WsConnError::Frame`] for an invalid or oversized frame.
    /// - [`WsConnError::UnexpectedEof`] if the stream ends inside a frame.
    /// - [`WsConnError::Io`] if the read fails.
    pub async fn next_inbound(&mut self) -> Result<Option<Inbound>, WsConnError> {
        let mut chunk = [0u8; 4096];
        loop {
            match decode_frame(&self.recv_buf, self.max_payload) {
                Ok((frame, consumed)) => {
                    self.recv_buf.drain(..consumed);
                    return Ok(Some(classify(frame)));
                }
                // Normal: wait for more bytes.
                Err(FrameError::InsufficientData { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return if self.recv_buf.is_empty() {
                    Ok(None)
                } else {
                    Err(WsConnError::UnexpectedEof("frame"))
                };
            }
            self.recv_buf.extend_from_slice(&chunk[..n]);
        }
    }
}

// ── Frame writer ──────────────────────────────────────────────────────────────

/// Writes unmasked server frames.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Sends one complete frame.
    pub async fn send(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), WsConnError> {
        self.inner.write_all(&encode_frame(opcode, payload)).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), WsConnError> {
        self.send(Opcode::Text, text.as_bytes()).await
    }

    /// Sends `msg` as a JSON text frame.
    pub async fn send_message(&mut self, msg: &HubToClientMsg) -> Result<(), WsConnError> {
        let json = msg.to_json()?;
        self.send_text(&json).await
    }

    pub async fn shutdown(&mut self) -> Result<(), WsConnError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
