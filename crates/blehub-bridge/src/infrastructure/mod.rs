//! Infrastructure layer for blehub-bridge.
//!
//! The infrastructure layer handles all I/O: the TCP listener for the
//! browser, the WebSocket handshake and framing on that socket, the
//! Bluetooth backends, and the interest table file.
//!
//! # Responsibilities
//!
//! - Binding a TCP listener and accepting one browser at a time
//! - Performing the HTTP upgrade handshake and reading/writing frames
//! - Running the per-session dispatch loop
//! - Implementing [`bluetooth::BluetoothService`] for BlueZ and for tests
//! - Loading the interest table from TOML
//!
//! # What does NOT belong here?
//!
//! - Interest matching, session and monitor lifecycles (application layer)
//! - Message type definitions (domain layer)
//! - Command-line parsing (that is done in `main.rs`)

pub mod bluetooth;
pub mod interest_file;
pub mod ws_conn;
pub mod ws_server;

// Re-export the primary entry points so `main.rs` can call them concisely.
pub use interest_file::load_interest_file;
pub use ws_server::run_server;
