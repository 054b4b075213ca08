//! WebSocket server: accept loop and the per-session dispatch loop.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting one browser connection at a time.
//! 3. Completing the HTTP upgrade handshake (with a timeout).
//! 4. Creating a [`Bridge`] for the session and entering discovery.
//! 5. Running the dispatch loop until the browser leaves or shutdown is
//!    requested, then releasing every Bluetooth resource.
//!
//! # One session at a time
//!
//! The bridge serves a single browser.  The accept loop awaits the session
//! instead of spawning it, so a second browser waits in the listen backlog
//! until the first disconnects.
//!
//! # The dispatch loop
//!
//! ```text
//!            ┌── signals.recv()       (Bluetooth notifications)
//! select! ───┼── frames.next_inbound() (browser frames)
//!            └── ticker.tick()         (every 200 ms: shutdown flag)
//! ```
//!
//! Each branch only *receives*.  The chosen event is handled to completion
//! after the `select!`, including every write to the socket, so no write is
//! ever cancelled halfway through a frame.
//!
//! Shutdown is triggered by a shared `AtomicBool` that is set by a Ctrl+C
//! signal handler (see `main.rs`).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{anyhow, Context};
use blehub_core::protocol::{Inbound, Opcode};
use blehub_core::BusSignal;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::application::Bridge;
use crate::domain::{BridgeConfig, HubToClientMsg};
use crate::infrastructure::bluetooth::BluetoothService;
use crate::infrastructure::ws_conn::{accept_handshake, FrameReader, FrameWriter, WsConnError};

/// How often the accept loop and the session loop look at the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

// ── Public API ────────────────────────────────────────────────────────────────

/// Runs the accept loop until `running` is set to `false`.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot be bound (e.g., the port is
/// already in use or the process lacks permission to bind).
pub async fn run_server<S>(
    config: BridgeConfig,
    service: Arc<S>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()>
where
    S: BluetoothService + ?Sized,
{
    let listener = TcpListener::bind(config.ws_bind_addr)
        .await
        .with_context(|| {
            format!(
                "failed to bind WebSocket listener on {}",
                config.ws_bind_addr
            )
        })?;

    info!("WebSocket bridge listening on {}", config.ws_bind_addr);

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // Short timeout so the flag is checked even when nobody connects.
        match timeout(POLL_INTERVAL, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                info!("new browser connection from {peer_addr}");
                let session_id = peer_addr.to_string();
                match serve_connection(stream, &session_id, &config, Arc::clone(&service), &running)
                    .await
                {
                    Ok(()) => info!("session {session_id} closed normally"),
                    Err(e) => warn!("session {session_id} closed with error: {e:#}"),
                }
            }
            Ok(Err(e)) => {
                // Transient accept error (e.g., too many open file descriptors).
                error!("accept error: {e}");
            }
            Err(_) => {
                // Timeout; loop back to check the flag.
            }
        }
    }

    Ok(())
}

/// Runs one browser session on an already-accepted byte stream.
///
/// Generic over the stream so tests can drive it with `tokio::io::duplex`.
///
/// # Errors
///
/// Returns an error if the handshake fails or times out, if the Bluetooth
/// service is unreachable, or if the peer breaks the framing rules.  All
/// Bluetooth resources are released before returning, whatever the outcome.
pub async fn serve_connection<T, S>(
    stream: T,
    session_id: &str,
    config: &BridgeConfig,
    service: Arc<S>,
    running: &AtomicBool,
) -> anyhow::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: BluetoothService + ?Sized,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    // ── Step 1: WebSocket handshake ───────────────────────────────────────────
    timeout(
        config.handshake_timeout,
        accept_handshake(&mut reader, &mut write_half),
    )
    .await
    .map_err(|_| {
        anyhow!(
            "session {session_id}: handshake timed out after {:?}",
            config.handshake_timeout
        )
    })?
    .with_context(|| format!("session {session_id}: WebSocket handshake failed"))?;

    info!("WebSocket session established: {session_id}");

    let mut frames = FrameReader::new(reader, config.max_frame_len);
    let mut writer = FrameWriter::new(write_half);

    // ── Step 2: Enter discovery ───────────────────────────────────────────────
    let (mut bridge, mut signals) = Bridge::new(service, config);
    let announced = match bridge.start().await {
        Ok(announced) => announced,
        Err(e) => {
            bridge.shutdown().await;
            let _ = writer.send(Opcode::Close, &[]).await;
            return Err(e).with_context(|| format!("session {session_id}: cannot start discovery"));
        }
    };

    // ── Step 3: Dispatch until the session ends ───────────────────────────────
    let result = async {
        send_all(&mut writer, &announced).await?;
        dispatch(
            session_id,
            &mut bridge,
            &mut signals,
            &mut frames,
            &mut writer,
            running,
        )
        .await
    }
    .await;

    // ── Step 4: Release everything ────────────────────────────────────────────
    bridge.shutdown().await;
    let _ = writer.shutdown().await;

    result.with_context(|| format!("session {session_id}: connection failed"))
}

// ── Dispatch loop ─────────────────────────────────────────────────────────────

/// What woke the dispatch loop.
enum Wakeup {
    Signal(Option<BusSignal>),
    Frame(Result<Option<Inbound>, WsConnError>),
    Tick,
}

async fn dispatch<S, R, W>(
    session_id: &str,
    bridge: &mut Bridge<S>,
    signals: &mut tokio::sync::mpsc::UnboundedReceiver<BusSignal>,
    frames: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    running: &AtomicBool,
) -> Result<(), WsConnError>
where
    S: BluetoothService + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ticker = interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let wakeup = tokio::select! {
            signal = signals.recv() => Wakeup::Signal(signal),
            inbound = frames.next_inbound() => Wakeup::Frame(inbound),
            _ = ticker.tick() => Wakeup::Tick,
        };

        match wakeup {
            Wakeup::Signal(Some(signal)) => {
                let out = bridge.on_signal(signal).await;
                send_all(writer, &out).await?;
            }
            Wakeup::Signal(None) => {
                // The bridge owns a sender, so this only happens if the
                // backend dropped every sink.
                warn!("session {session_id}: signal channel closed");
                return Ok(());
            }
            Wakeup::Frame(Ok(Some(Inbound::Ping(payload)))) => {
                debug!("session {session_id}: ping ({} bytes)", payload.len());
                writer.send(Opcode::Pong, &payload).await?;
            }
            Wakeup::Frame(Ok(Some(Inbound::Pong))) => {
                debug!("session {session_id}: pong received");
            }
            Wakeup::Frame(Ok(Some(Inbound::Close(payload)))) => {
                debug!("session {session_id}: close frame received");
                let _ = writer.send(Opcode::Close, &payload).await;
                return Ok(());
            }
            Wakeup::Frame(Ok(Some(Inbound::Message { opcode, payload }))) => {
                let text = match String::from_utf8(payload) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("session {session_id}: {opcode:?} frame is not UTF-8 (ignored)");
                        continue;
                    }
                };
                // One bad command never closes the session.
                match bridge.on_client_text(&text).await {
                    Ok(out) => send_all(writer, &out).await?,
                    Err(e) => warn!("session {session_id}: command rejected: {e}"),
                }
            }
            Wakeup::Frame(Ok(None)) => {
                debug!("session {session_id}: browser closed the connection");
                return Ok(());
            }
            Wakeup::Frame(Err(e)) => return Err(e),
            Wakeup::Tick => {
                if !running.load(Ordering::Relaxed) {
                    info!("session {session_id}: shutting down");
                    let _ = writer.send(Opcode::Close, &[]).await;
                    return Ok(());
                }
            }
        }
    }
}

async fn send_all<W>(writer: &mut FrameWriter<W>, messages: &[HubToClientMsg]) -> Result<(), WsConnError>
where
    W: AsyncWrite + Unpin,
{
    for msg in messages {
        writer.send_message(msg).await?;
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::MockBluetoothService;
    use blehub_core::protocol::{decode_frame, encode_masked_frame, Frame, FrameError};
    use tokio::io::{
        AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf,
    };

    const KEY: [u8; 4] = [1, 2, 3, 4];

    const REQUEST: &str = "GET / HTTP/1.1\r\n\
                           Host: localhost\r\n\
                           Upgrade: websocket\r\n\
                           Connection: Upgrade\r\n\
                           Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                           \r\n";

    /// Browser side of a duplex connection.
    struct Client {
        read: BufReader<ReadHalf<DuplexStream>>,
        write: WriteHalf<DuplexStream>,
        recv_buf: Vec<u8>,
    }

    impl Client {
        async fn connect(stream: DuplexStream) -> Self {
            let (read, mut write) = tokio::io::split(stream);
            write.write_all(REQUEST.as_bytes()).await.unwrap();
            let mut read = BufReader::new(read);
            let mut line = String::new();
            loop {
                line.clear();
                read.read_line(&mut line).await.unwrap();
                if line == "\r\n" {
                    break;
                }
            }
            Self {
                read,
                write,
                recv_buf: Vec::new(),
            }
        }

        async fn send(&mut self, opcode: Opcode, payload: &[u8]) {
            self.write
                .write_all(&encode_masked_frame(opcode, payload, KEY))
                .await
                .unwrap();
        }

        /// Next raw frame from the server, or `None` at end of stream.
        async fn recv(&mut self) -> Option<Frame> {
            loop {
                match decode_frame(&self.recv_buf, 1 << 16) {
                    Ok((frame, consumed)) => {
                        self.recv_buf.drain(..consumed);
                        return Some(frame);
                    }
                    Err(FrameError::InsufficientData { .. }) => {}
                    Err(e) => panic!("server sent a bad frame: {e}"),
                }
                let mut chunk = [0u8; 1024];
                let n = self.read.read(&mut chunk).await.unwrap();
                if n == 0 {
                    return None;
                }
                self.recv_buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    #[tokio::test]
    async fn test_ping_gets_pong_and_close_is_echoed() {
        // Arrange
        let mock = MockBluetoothService::new();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let running = AtomicBool::new(true);
        let config = BridgeConfig::default();

        // Act
        let server = serve_connection(server_io, "test", &config, Arc::new(mock.clone()), &running);
        let client = async {
            let mut client = Client::connect(client_io).await;
            client.send(Opcode::Ping, b"are you there").await;
            let pong = client.recv().await;
            client.send(Opcode::Close, &[0x03, 0xE8]).await;
            let close = client.recv().await;
            (pong, close)
        };
        let (served, (pong, close)) = tokio::join!(server, client);

        // Assert
        assert!(served.is_ok());
        let pong = pong.expect("pong frame");
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"are you there");
        let close = close.expect("close frame");
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(close.payload, vec![0x03, 0xE8]);
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_bad_handshake_fails_session_before_discovery() {
        // Arrange
        let mock = MockBluetoothService::new();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let running = AtomicBool::new(true);
        let config = BridgeConfig::default();

        // Act: no Sec-WebSocket-Key
        let server = serve_connection(server_io, "test", &config, Arc::new(mock.clone()), &running);
        let client = async {
            let (mut read, mut write) = tokio::io::split(client_io);
            write
                .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
            let mut response = Vec::new();
            read.read_to_end(&mut response).await.unwrap();
            response
        };
        let (served, response) = tokio::join!(server, client);

        // Assert
        assert!(served.is_err());
        assert!(response.starts_with(b"HTTP/1.1 400"));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_command_keeps_session_open() {
        let mock = MockBluetoothService::new();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let running = AtomicBool::new(true);
        let config = BridgeConfig::default();

        let server = serve_connection(server_io, "test", &config, Arc::new(mock.clone()), &running);
        let client = async {
            let mut client = Client::connect(client_io).await;
            client.send(Opcode::Text, b"{not json").await;
            client.send(Opcode::Ping, b"still here").await;
            let reply = client.recv().await;
            client.send(Opcode::Close, &[]).await;
            reply
        };
        let (served, reply) = tokio::join!(server, client);

        assert!(served.is_ok());
        assert_eq!(reply.map(|f| f.opcode), Some(Opcode::Pong));
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_session_with_error() {
        let mock = MockBluetoothService::new();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let running = AtomicBool::new(true);
        let config = BridgeConfig {
            max_frame_len: 16,
            ..BridgeConfig::default()
        };

        let server = serve_connection(server_io, "test", &config, Arc::new(mock.clone()), &running);
        let client = async {
            let mut client = Client::connect(client_io).await;
            client.send(Opcode::Text, &[b'x'; 64]).await;
            client.recv().await
        };
        let (served, _) = tokio::join!(server, client);

        assert!(served.is_err());
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_flag_closes_session() {
        let mock = MockBluetoothService::new();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let running = AtomicBool::new(true);
        let config = BridgeConfig::default();

        let server = serve_connection(server_io, "test", &config, Arc::new(mock.clone()), &running);
        let client = async {
            let mut client = Client::connect(client_io).await;
            running.store(false, Ordering::Relaxed);
            client.recv().await
        };
        let (served, close) = tokio::join!(server, client);

        assert!(served.is_ok());
        assert_eq!(close.map(|f| f.opcode), Some(Opcode::Close));
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_run_server_returns_when_flag_is_clear() {
        let config = BridgeConfig {
            ws_bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..BridgeConfig::default()
        };
        let running = Arc::new(AtomicBool::new(false));

        let result = run_server(config, Arc::new(MockBluetoothService::new()), running).await;

        assert!(result.is_ok());
    }
}
