//! Domain layer for blehub-bridge.
//!
//! Pure types with no dependencies on I/O, sockets, or the Bluetooth
//! backend:
//!
//! - the JSON "language" spoken with the browser,
//! - the typed events the discovery manager hands to the orchestrator,
//! - the runtime configuration.
//!
//! Anything that could block or fail due to external state lives in the
//! infrastructure layer instead.

pub mod config;
pub mod events;
pub mod messages;

pub use config::BridgeConfig;
pub use events::BleEvent;
pub use messages::{ClientToHubMsg, HubToClientMsg};
