//! The interest table: which GATT characteristics the bridge forwards.
//!
//! Each entry pairs a service UUID with one characteristic UUID under it and
//! names the decoder that turns that characteristic's notifications into a
//! value for the browser.  A device is *interesting* when any of its
//! advertised service UUIDs appears in the table.
//!
//! The table is built once at startup (from defaults or a config file) and is
//! read-only afterwards.  UUIDs are compared as parsed [`Uuid`] values, so the
//! textual case used in configuration does not matter.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use super::decoder::{PayloadDecoder, UartPacketDecoder};

/// Nordic UART Service.
pub const NORDIC_UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Nordic UART TX characteristic (peripheral → central notifications).
pub const NORDIC_UART_TX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Identifies the forwarding handler of one interest entry.  It is the
/// entry's index in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub usize);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// One forwarded characteristic.
#[derive(Clone)]
pub struct InterestEntry {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub decoder: Arc<dyn PayloadDecoder>,
}

impl fmt::Debug for InterestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterestEntry")
            .field("service_uuid", &self.service_uuid)
            .field("characteristic_uuid", &self.characteristic_uuid)
            .field("decoder", &self.decoder.name())
            .finish()
    }
}

/// Read-only list of [`InterestEntry`] values.
#[derive(Debug, Clone, Default)]
pub struct InterestTable {
    entries: Vec<InterestEntry>,
}

impl InterestTable {
    pub fn new(entries: Vec<InterestEntry>) -> Self {
        Self { entries }
    }

    /// The built-in table: Nordic UART TX decoded as a `uart_packet`.
    pub fn nordic_uart() -> Self {
        Self::new(vec![InterestEntry {
            service_uuid: NORDIC_UART_SERVICE,
            characteristic_uuid: NORDIC_UART_TX,
            decoder: Arc::new(UartPacketDecoder),
        }])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if any advertised UUID is a service in the table.
    pub fn matches_any(&self, advertised: &[Uuid]) -> bool {
        advertised
            .iter()
            .any(|uuid| self.entries.iter().any(|e| e.service_uuid == *uuid))
    }

    /// All entries for `service_uuid`, with their handler ids.
    pub fn entries_for_service(
        &self,
        service_uuid: Uuid,
    ) -> impl Iterator<Item = (HandlerId, &InterestEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.service_uuid == service_uuid)
            .map(|(i, e)| (HandlerId(i), e))
    }

    pub fn entry(&self, handler: HandlerId) -> Option<&InterestEntry> {
        self.entries.get(handler.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (HandlerId, &InterestEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (HandlerId(i), e))
    }
}
