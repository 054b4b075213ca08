//! Server side of the WebSocket opening handshake (RFC 6455 §4.2).
//!
//! A browser opens a WebSocket by sending an ordinary HTTP/1.1 `GET` request
//! carrying a random `Sec-WebSocket-Key`.  The server proves it understood the
//! upgrade by hashing that key together with a fixed GUID and returning the
//! result in a `101 Switching Protocols` response.
//!
//! [`Handshake`] is a line-driven state machine with no I/O of its own: the
//! infrastructure layer reads lines from the socket and feeds them in one at a
//! time, then writes [`Handshake::response`] back.
//!
//! ```text
//! AwaitingRequestLine ──request line──► ReadingHeaders ──blank line──► Complete
//! ```
//!
//! There is no transition back.  Any error leaves the handshake unusable and
//! the caller must drop the connection.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Fixed GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on header lines accepted before the blank line.
pub const MAX_HEADERS: usize = 64;

/// Header carrying the client's nonce.
const KEY_HEADER: &str = "Sec-WebSocket-Key";

/// Errors that terminate a handshake attempt.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The first line was not `METHOD TARGET HTTP/x.y`.
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    /// A header line had no colon or an empty name.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// The client sent more than [`MAX_HEADERS`] header lines.
    #[error("too many header lines (limit {limit})")]
    TooManyHeaders { limit: usize },

    /// A header the server requires was absent or empty.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    /// A line was fed after the terminating blank line.
    #[error("handshake already complete")]
    AlreadyComplete,

    /// The response was requested before the blank line arrived.
    #[error("handshake is not complete yet")]
    Incomplete,
}

/// Position of a [`Handshake`] in the request it is parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing received yet.
    AwaitingRequestLine,
    /// Request line accepted; collecting `name: value` lines.
    ReadingHeaders,
    /// Blank line received; the response can be produced.
    Complete,
}

/// The parsed HTTP request line.  Validated, otherwise unused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

/// Incremental parser for the client's upgrade request.
///
/// # Example
///
/// ```rust
/// use blehub_core::protocol::{Handshake, HandshakeState};
///
/// let mut hs = Handshake::new();
/// hs.feed_line("GET /chat HTTP/1.1\r\n").unwrap();
/// hs.feed_line("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n").unwrap();
/// assert_eq!(hs.feed_line("\r\n").unwrap(), HandshakeState::Complete);
/// assert!(hs.response().unwrap().contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
/// ```
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    request_line: Option<RequestLine>,
    /// Header values keyed by lower-cased name (HTTP names are case-insensitive).
    headers: HashMap<String, String>,
    /// Header lines fed so far, repeats included.
    header_lines: usize,
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::AwaitingRequestLine,
            request_line: None,
            headers: HashMap::new(),
            header_lines: 0,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn request_line(&self) -> Option<&RequestLine> {
        self.request_line.as_ref()
    }

    /// Returns the value of header `name`, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Feeds one line (with or without its trailing CRLF) into the parser and
    /// returns the state reached.
    ///
    /// # Errors
    ///
    /// Returns a [`HandshakeError`] when the line is malformed, the header
    /// limit is exceeded, or the handshake was already complete.
    pub fn feed_line(&mut self, line: &str) -> Result<HandshakeState, HandshakeError> {
        let line = line.trim_end_matches(['\r', '\n']);

        match self.state {
            HandshakeState::AwaitingRequestLine => {
                self.request_line = Some(parse_request_line(line)?);
                self.state = HandshakeState::ReadingHeaders;
            }
            HandshakeState::ReadingHeaders => {
                if line.is_empty() {
                    self.state = HandshakeState::Complete;
                } else {
                    if self.header_lines >= MAX_HEADERS {
                        return Err(HandshakeError::TooManyHeaders { limit: MAX_HEADERS });
                    }
                    self.header_lines += 1;
                    let (name, value) = parse_header(line)?;
                    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
                }
            }
            HandshakeState::Complete => return Err(HandshakeError::AlreadyComplete),
        }

        Ok(self.state)
    }

    /// Builds the `101 Switching Protocols` response for a completed request.
    ///
    /// # Errors
    ///
    /// - [`HandshakeError::Incomplete`] if the blank line has not been fed.
    /// - [`HandshakeError::MissingHeader`] if `Sec-WebSocket-Key` is absent
    ///   or empty.
    pub fn response(&self) -> Result<String, HandshakeError> {
        if self.state != HandshakeState::Complete {
            return Err(HandshakeError::Incomplete);
        }

        let key = self
            .header(KEY_HEADER)
            .filter(|k| !k.is_empty())
            .ok_or(HandshakeError::MissingHeader(KEY_HEADER))?;

        Ok(format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             \r\n",
            accept_key(key)
        ))
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes `base64(SHA1(key + GUID))`, the `Sec-WebSocket-Accept` value.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

fn parse_request_line(line: &str) -> Result<RequestLine, HandshakeError> {
    let malformed = || HandshakeError::MalformedRequestLine(line.to_string());

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };

    if !version.starts_with("HTTP/") {
        return Err(malformed());
    }

    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
    })
}

fn parse_header(line: &str) -> Result<(&str, &str), HandshakeError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| HandshakeError::MalformedHeader(line.to_string()))?;

    let name = name.trim();
    if name.is_empty() {
        return Err(HandshakeError::MalformedHeader(line.to_string()));
    }

    Ok((name, value.trim()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
