//! # blehub-core
//!
//! Shared library for blehub containing the WebSocket wire codec, the BLE
//! object model exchanged with the local Bluetooth management service, and the
//! GATT interest table with its payload decoders.
//!
//! This crate has zero dependencies on OS APIs, async runtimes, or sockets.
//!
//! # Architecture overview (for beginners)
//!
//! blehub bridges Bluetooth Low Energy peripherals to a browser.  The browser
//! speaks JSON over a WebSocket; the peripherals speak GATT through the
//! operating system's Bluetooth service.  This crate is the shared foundation:
//!
//! - **`protocol`** – How bytes travel between the bridge and the browser.
//!   The HTTP upgrade handshake and the RFC 6455 frame format, implemented as
//!   pure functions over byte slices and text lines.
//!
//! - **`domain`** – The vocabulary of the Bluetooth side: object paths,
//!   adapters, devices, GATT services and characteristics, the signals the
//!   Bluetooth service emits, and the *interest table* that says which
//!   characteristics the bridge forwards and how to decode their values.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `blehub_core::ObjectPath` instead of `blehub_core::domain::object::ObjectPath`.
pub use domain::decoder::{DecodeError, DecodedValue, PayloadDecoder};
pub use domain::interest::{HandlerId, InterestEntry, InterestTable};
pub use domain::object::{BusSignal, InterfaceKind, ManagedObject, ObjectPath, PropertyChange};
pub use protocol::frame::{decode_frame, encode_frame, Frame, FrameError, Opcode};
pub use protocol::handshake::{accept_key, Handshake, HandshakeError, HandshakeState};
