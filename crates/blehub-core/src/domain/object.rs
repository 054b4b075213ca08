//! The BLE object model as exposed by the local Bluetooth management service.
//!
//! The service publishes a tree of objects, each identified by an
//! [`ObjectPath`] and implementing one or more interfaces:
//!
//! ```text
//! /org/bluez/hci0                                   Adapter
//! /org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF             Device
//! /org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c GattService   (Device = …dev_AA…)
//! /org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c/char000d
//!                                                   GattCharacteristic (Service = …service000c)
//! ```
//!
//! Parent links are carried as explicit properties (`device` on a service,
//! `service` on a characteristic).  Nothing in the bridge infers ownership
//! from the shape of a path.

use std::fmt;

use uuid::Uuid;

/// Identifier of one object in the Bluetooth service's tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectPath {
    fn from(path: &str) -> Self {
        Self(path.to_string())
    }
}

impl From<String> for ObjectPath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

/// The interfaces the bridge cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    Adapter,
    Device,
    GattService,
    GattCharacteristic,
}

/// Properties of a local radio.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdapterProperties {
    pub address: String,
}

/// Properties of a discovered peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceProperties {
    /// MAC address in `AA:BB:CC:DD:EE:FF` form.
    pub address: String,
    /// Human-readable name; falls back to the address when the peripheral
    /// advertises none.
    pub alias: String,
    /// Service UUIDs from the advertisement.
    pub uuids: Vec<Uuid>,
    pub connected: bool,
    pub services_resolved: bool,
}

/// Properties of a GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProperties {
    pub uuid: Uuid,
    /// Owning device.
    pub device: ObjectPath,
}

/// Properties of a GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub uuid: Uuid,
    /// Owning service.
    pub service: ObjectPath,
    /// Last cached value, if the service has one.
    pub value: Option<Vec<u8>>,
}

/// Interface property sets implemented by one object.  `None` means the
/// object does not implement that interface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Interfaces {
    pub adapter: Option<AdapterProperties>,
    pub device: Option<DeviceProperties>,
    pub gatt_service: Option<ServiceProperties>,
    pub gatt_characteristic: Option<CharacteristicProperties>,
}

impl Interfaces {
    /// Returns `true` if the object implements `kind`.
    pub fn has(&self, kind: InterfaceKind) -> bool {
        match kind {
            InterfaceKind::Adapter => self.adapter.is_some(),
            InterfaceKind::Device => self.device.is_some(),
            InterfaceKind::GattService => self.gatt_service.is_some(),
            InterfaceKind::GattCharacteristic => self.gatt_characteristic.is_some(),
        }
    }

    /// Lists the implemented interfaces.
    pub fn kinds(&self) -> Vec<InterfaceKind> {
        [
            InterfaceKind::Adapter,
            InterfaceKind::Device,
            InterfaceKind::GattService,
            InterfaceKind::GattCharacteristic,
        ]
        .into_iter()
        .filter(|k| self.has(*k))
        .collect()
    }
}

/// One entry of the object enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedObject {
    pub path: ObjectPath,
    pub interfaces: Interfaces,
}

impl ManagedObject {
    pub fn adapter(path: impl Into<ObjectPath>, address: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            interfaces: Interfaces {
                adapter: Some(AdapterProperties {
                    address: address.into(),
                }),
                ..Interfaces::default()
            },
        }
    }

    pub fn device(path: impl Into<ObjectPath>, props: DeviceProperties) -> Self {
        Self {
            path: path.into(),
            interfaces: Interfaces {
                device: Some(props),
                ..Interfaces::default()
            },
        }
    }

    pub fn gatt_service(path: impl Into<ObjectPath>, uuid: Uuid, device: ObjectPath) -> Self {
        Self {
            path: path.into(),
            interfaces: Interfaces {
                gatt_service: Some(ServiceProperties { uuid, device }),
                ..Interfaces::default()
            },
        }
    }

    pub fn gatt_characteristic(
        path: impl Into<ObjectPath>,
        uuid: Uuid,
        service: ObjectPath,
    ) -> Self {
        Self {
            path: path.into(),
            interfaces: Interfaces {
                gatt_characteristic: Some(CharacteristicProperties {
                    uuid,
                    service,
                    value: None,
                }),
                ..Interfaces::default()
            },
        }
    }
}

/// A single property change reported for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyChange {
    /// Device `Connected`.
    Connected(bool),
    /// Device `ServicesResolved`.
    ServicesResolved(bool),
    /// Characteristic `Value`.
    Value(Vec<u8>),
}

/// Notifications delivered by the Bluetooth service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusSignal {
    /// An object appeared, or gained interfaces.
    InterfacesAdded(ManagedObject),
    /// An object lost the listed interfaces.
    InterfacesRemoved {
        path: ObjectPath,
        interfaces: Vec<InterfaceKind>,
    },
    /// Properties of `path` changed.
    PropertiesChanged {
        path: ObjectPath,
        changes: Vec<PropertyChange>,
    },
}

impl BusSignal {
    /// The object the signal is about.
    pub fn path(&self) -> &ObjectPath {
        match self {
            BusSignal::InterfacesAdded(obj) => &obj.path,
            BusSignal::InterfacesRemoved { path, .. } => path,
            BusSignal::PropertiesChanged { path, .. } => path,
        }
    }
}
