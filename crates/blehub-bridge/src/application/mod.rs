//! Application layer for blehub-bridge.
//!
//! The application layer decides *what* happens on the Bluetooth side and
//! what the browser is told about it.  It reaches Bluetooth only through the
//! [`BluetoothService`](crate::infrastructure::bluetooth::BluetoothService)
//! trait.
//!
//! # Responsibilities
//!
//! - Tracking adapters and devices, connecting and disconnecting
//!   ([`discovery`])
//! - Resolving a connected device's services and characteristics
//!   ([`session`])
//! - Enabling and forwarding characteristic notifications ([`monitor`])
//! - Bounding every Bluetooth call with a timeout and retrying transient
//!   failures ([`retry`])
//! - Applying the interest table and translating to JSON messages
//!   ([`orchestrator`])
//!
//! # What does NOT belong here?
//!
//! - Sockets, WebSocket framing, the accept loop (infrastructure)
//! - D-Bus details (the BlueZ backend in infrastructure)
//! - Message type definitions (domain)

pub mod discovery;
pub mod monitor;
pub mod orchestrator;
pub mod retry;
pub mod session;

pub use discovery::{DeviceRecord, DeviceState, DiscoveryManager, ManagerError};
pub use monitor::CharacteristicMonitor;
pub use orchestrator::{Bridge, BridgeError, RegistryEntry};
pub use retry::CallPolicy;
pub use session::{CharacteristicRecord, DeviceSession, ServiceRecord, SessionUpdate, WatchState};
