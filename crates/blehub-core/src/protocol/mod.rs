//! WebSocket protocol: opening handshake and frame codec.

pub mod frame;
pub mod handshake;

pub use frame::{
    apply_mask, classify, decode_frame, encode_frame, encode_masked_frame, Frame, FrameError,
    Inbound, Opcode,
};
pub use handshake::{accept_key, Handshake, HandshakeError, HandshakeState, RequestLine};
