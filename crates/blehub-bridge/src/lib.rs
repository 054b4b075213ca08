//! blehub-bridge library crate.
//!
//! Bridges Bluetooth Low Energy GATT peripherals to a single browser client
//! over a WebSocket.  Peripherals advertising a service from the interest
//! table are announced to the browser; on request the bridge connects,
//! subscribes to the characteristics of interest, decodes their notifications
//! and forwards the values as JSON.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Browser (JSON over WebSocket)
//!         ↕
//! [blehub-bridge]
//!   ├── domain/           Pure types: JSON messages, BLE events, BridgeConfig
//!   ├── application/      Discovery manager, device sessions, monitors,
//!   │                     and the bridge orchestrator
//!   └── infrastructure/
//!         ├── bluetooth/  BluetoothService trait + mock and BlueZ backends
//!         ├── ws_conn/    Handshake and frame I/O over a byte stream
//!         ├── ws_server/  Accept loop and per-session dispatch loop
//!         └── interest_file/ TOML interest table loader
//!         ↕
//! Local Bluetooth management service (BlueZ over D-Bus)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` talks to Bluetooth only through the
//!   [`infrastructure::bluetooth::BluetoothService`] trait, so it runs
//!   unchanged against the in-memory mock in tests.
//! - `infrastructure` owns sockets, timers for the accept loop, and backends.
//!
//! # For beginners: two state machines, one loop
//!
//! The Bluetooth side and the WebSocket side change independently and both
//! notify asynchronously.  Instead of sharing state behind locks, a single
//! `tokio::select!` loop per session owns every table and processes one event
//! at a time to completion.  That loop is the only writer, so the tables can
//! never disagree with each other mid-update.

/// Domain layer: pure types (no I/O).
pub mod domain;

/// Application layer: BLE state machine and bridge orchestration.
pub mod application;

/// Infrastructure layer: Bluetooth backends, WebSocket I/O, config files.
pub mod infrastructure;
