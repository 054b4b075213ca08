//! Typed events produced by the discovery manager for the orchestrator.

use std::collections::BTreeMap;

use blehub_core::{HandlerId, ObjectPath};
use uuid::Uuid;

/// Something the Bluetooth side reported that the orchestrator may forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    /// A device was discovered, or a known device was re-announced.
    DeviceFound {
        device: ObjectPath,
        address: String,
        alias: String,
        uuids: Vec<Uuid>,
    },

    /// A device disappeared.  All its monitors are already released.
    DeviceRemoved { device: ObjectPath },

    /// One resolved GATT service of a connected device, with its
    /// characteristics (path → UUID).
    ServiceFound {
        device: ObjectPath,
        service: ObjectPath,
        uuid: Uuid,
        characteristics: BTreeMap<ObjectPath, Uuid>,
    },

    /// A watched characteristic changed.  `value` is the raw payload.
    ValueChanged {
        device: ObjectPath,
        characteristic: ObjectPath,
        handler: HandlerId,
        value: Vec<u8>,
    },
}
