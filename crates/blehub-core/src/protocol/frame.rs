//! WebSocket frame codec (RFC 6455 §5).
//!
//! Wire format:
//! ```text
//! [FIN|RSV|opcode:1][MASK|len7:1][ext len:0/2/8][mask key:0/4][payload:N]
//! ```
//!
//! `len7` ≤ 125 is the payload length itself.  126 means a 2-byte big-endian
//! length follows, 127 an 8-byte big-endian length (most significant bit
//! must be zero).  Frames from a browser are masked; frames from the server
//! never are.
//!
//! Decoding is incremental in the same way as any stream codec: if the buffer
//! does not yet hold a whole frame, [`decode_frame`] returns
//! [`FrameError::InsufficientData`] and the caller reads more bytes.

use thiserror::Error;

/// Largest payload length that fits in the 7-bit length field.
pub const MAX_SHORT_LEN: usize = 125;

const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Frame opcode (low four bits of the first header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Any of the opcodes RFC 6455 leaves reserved.
    Reserved(u8),
}

impl Opcode {
    /// Maps the low four bits of `bits` to an opcode.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(bits) => bits & 0x0F,
        }
    }
}

/// One decoded frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer ends before the frame does.  Not fatal: read more bytes.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// A 64-bit length with its most significant bit set.
    #[error("invalid 64-bit payload length: {0:#x}")]
    InvalidLength(u64),

    /// The declared payload exceeds the configured limit.
    #[error("payload of {declared} bytes exceeds limit of {limit}")]
    PayloadTooLarge { declared: u64, limit: usize },
}

/// What the session layer should do with a received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Text, binary, or any other data opcode: one application message.
    Message { opcode: Opcode, payload: Vec<u8> },
    /// Answer with a pong carrying this payload; nothing for the application.
    Ping(Vec<u8>),
    /// Unsolicited or answering pong; ignored.
    Pong,
    /// The peer started the closing handshake.
    Close(Vec<u8>),
}

/// Sorts a decoded frame into the action the session must take.
pub fn classify(frame: Frame) -> Inbound {
    match frame.opcode {
        Opcode::Ping => Inbound::Ping(frame.payload),
        Opcode::Pong => Inbound::Pong,
        Opcode::Close => Inbound::Close(frame.payload),
        opcode => Inbound::Message {
            opcode,
            payload: frame.payload,
        },
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encodes a single unmasked server frame with FIN set.
///
/// # Examples
///
/// ```rust
/// use blehub_core::protocol::{encode_frame, Opcode};
///
/// let bytes = encode_frame(Opcode::Text, b"hi");
/// assert_eq!(bytes, vec![0x81, 0x02, b'h', b'i']);
/// ```
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header_len(payload.len(), false) + payload.len());
    write_header(&mut buf, opcode, payload.len(), None);
    buf.extend_from_slice(payload);
    buf
}

/// Encodes a single masked frame with FIN set, as a client would send it.
pub fn encode_masked_frame(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header_len(payload.len(), true) + payload.len());
    write_header(&mut buf, opcode, payload.len(), Some(key));
    let start = buf.len();
    buf.extend_from_slice(payload);
    apply_mask(&mut buf[start..], key);
    buf
}

/// XORs `payload` in place with the repeating 4-byte `key`.  Self-inverse.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

fn header_len(payload_len: usize, masked: bool) -> usize {
    let ext = match payload_len {
        0..=MAX_SHORT_LEN => 0,
        126..=0xFFFF => 2,
        _ => 8,
    };
    2 + ext + if masked { 4 } else { 0 }
}

fn write_header(buf: &mut Vec<u8>, opcode: Opcode, payload_len: usize, mask: Option<[u8; 4]>) {
    buf.push(0x80 | opcode.bits());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    match payload_len {
        0..=MAX_SHORT_LEN => buf.push(mask_bit | payload_len as u8),
        126..=0xFFFF => {
            buf.push(mask_bit | LEN_16);
            buf.extend_from_slice(&(payload_len as u16).to_be_bytes());
        }
        _ => {
            buf.push(mask_bit | LEN_64);
            buf.extend_from_slice(&(payload_len as u64).to_be_bytes());
        }
    }

    if let Some(key) = mask {
        buf.extend_from_slice(&key);
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes consumed so the caller can drain
/// its receive buffer.  Payloads longer than `max_payload` are rejected before
/// any of their bytes are buffered.
///
/// # Errors
///
/// - [`FrameError::InsufficientData`] when more bytes are needed.
/// - [`FrameError::InvalidLength`] / [`FrameError::PayloadTooLarge`] for
///   lengths the session must not accept; these are fatal to the connection.
pub fn decode_frame(bytes: &[u8], max_payload: usize) -> Result<(Frame, usize), FrameError> {
    require(bytes, 2)?;

    let fin = bytes[0] & 0x80 != 0;
    let opcode = Opcode::from_bits(bytes[0]);
    let masked = bytes[1] & 0x80 != 0;

    let mut offset = 2;
    let declared: u64 = match bytes[1] & 0x7F {
        LEN_16 => {
            require(bytes, offset + 2)?;
            let len = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            offset += 2;
            u64::from(len)
        }
        LEN_64 => {
            require(bytes, offset + 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[offset..offset + 8]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(FrameError::InvalidLength(len));
            }
            offset += 8;
            len
        }
        short => u64::from(short),
    };

    if declared > max_payload as u64 {
        return Err(FrameError::PayloadTooLarge {
            declared,
            limit: max_payload,
        });
    }
    let payload_len = declared as usize;

    let mask = if masked {
        require(bytes, offset + 4)?;
        let key = [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let end = offset + payload_len;
    require(bytes, end)?;

    let mut payload = bytes[offset..end].to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok((
        Frame {
            fin,
            opcode,
            payload,
        },
        end,
    ))
}

fn require(bytes: &[u8], needed: usize) -> Result<(), FrameError> {
    if bytes.len() < needed {
        Err(FrameError::InsufficientData {
            needed,
            available: bytes.len(),
        })
    } else {
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
