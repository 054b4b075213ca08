//! Device session: one connected peripheral's service-resolution lifecycle.
//!
//! A session exists from `connect` until the device is disconnected or
//! removed.  It holds the property-change subscription on the device and the
//! Service and Characteristic records found by the last resolution.
//!
//! Resolution walks the object enumeration through explicit parent links: a
//! service belongs to this device when its `device` property names it, and a
//! characteristic belongs to one of those services when its `service`
//! property does.

use std::collections::{BTreeMap, BTreeSet};

use blehub_core::{ManagedObject, ObjectPath, PropertyChange};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::BleEvent;
use crate::infrastructure::bluetooth::{BluetoothError, BluetoothService, SignalSink, Subscription};

use super::retry::CallPolicy;

/// A GATT service under the session's device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub path: ObjectPath,
    pub uuid: Uuid,
    pub device: ObjectPath,
}

/// Whether a characteristic has an active monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Unwatched,
    Watched,
}

/// A GATT characteristic under one of the session's services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRecord {
    pub path: ObjectPath,
    pub uuid: Uuid,
    pub service: ObjectPath,
    pub watch: WatchState,
    pub value: Option<Vec<u8>>,
}

/// What a batch of device property changes means for the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpdate {
    Connected,
    Disconnected,
    ServicesResolved,
}

/// Tracks the services of one connected device.
#[derive(Debug)]
pub struct DeviceSession {
    device: ObjectPath,
    subscription: Option<Subscription>,
    services: BTreeMap<ObjectPath, ServiceRecord>,
    characteristics: BTreeMap<ObjectPath, CharacteristicRecord>,
}

impl DeviceSession {
    /// Subscribes to property changes of `device`.
    pub async fn open<S>(
        service: &S,
        policy: &CallPolicy,
        device: ObjectPath,
        sink: SignalSink,
    ) -> Result<Self, BluetoothError>
    where
        S: BluetoothService + ?Sized,
    {
        let subscription = policy
            .call(service.subscribe_properties(&device, sink))
            .await?;
        debug!("session {device}: subscribed to property changes");
        Ok(Self {
            device,
            subscription: Some(subscription),
            services: BTreeMap::new(),
            characteristics: BTreeMap::new(),
        })
    }

    pub fn device(&self) -> &ObjectPath {
        &self.device
    }

    /// Interprets property changes of the session's device.
    pub fn interpret(&self, changes: &[PropertyChange]) -> Vec<SessionUpdate> {
        changes
            .iter()
            .filter_map(|change| match change {
                PropertyChange::Connected(true) => Some(SessionUpdate::Connected),
                PropertyChange::Connected(false) => Some(SessionUpdate::Disconnected),
                PropertyChange::ServicesResolved(true) => Some(SessionUpdate::ServicesResolved),
                _ => None,
            })
            .collect()
    }

    /// Replaces the session's records from a fresh enumeration and returns
    /// one `ServiceFound` per service.
    ///
    /// Characteristics that survive re-resolution keep their watch state and
    /// last value.
    pub fn resolve(&mut self, objects: &[ManagedObject]) -> Vec<BleEvent> {
        let services: BTreeMap<ObjectPath, ServiceRecord> = objects
            .iter()
            .filter_map(|obj| {
                let props = obj.interfaces.gatt_service.as_ref()?;
                (props.device == self.device).then(|| ServiceRecord {
                    path: obj.path.clone(),
                    uuid: props.uuid,
                    device: props.device.clone(),
                })
            })
            .map(|record| (record.path.clone(), record))
            .collect();

        let mut characteristics = BTreeMap::new();
        for obj in objects {
            let Some(props) = obj.interfaces.gatt_characteristic.as_ref() else {
                continue;
            };
            if !services.contains_key(&props.service) {
                continue;
            }
            let previous = self.characteristics.get(&obj.path);
            characteristics.insert(
                obj.path.clone(),
                CharacteristicRecord {
                    path: obj.path.clone(),
                    uuid: props.uuid,
                    service: props.service.clone(),
                    watch: previous.map_or(WatchState::Unwatched, |c| c.watch),
                    value: props
                        .value
                        .clone()
                        .or_else(|| previous.and_then(|c| c.value.clone())),
                },
            );
        }

        self.services = services;
        self.characteristics = characteristics;

        debug!(
            "session {}: resolved {} services, {} characteristics",
            self.device,
            self.services.len(),
            self.characteristics.len()
        );

        self.services
            .values()
            .map(|svc| BleEvent::ServiceFound {
                device: self.device.clone(),
                service: svc.path.clone(),
                uuid: svc.uuid,
                characteristics: self
                    .characteristics
                    .values()
                    .filter(|c| c.service == svc.path)
                    .map(|c| (c.path.clone(), c.uuid))
                    .collect(),
            })
            .collect()
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.services.values()
    }

    pub fn characteristic(&self, path: &ObjectPath) -> Option<&CharacteristicRecord> {
        self.characteristics.get(path)
    }

    pub fn characteristic_mut(&mut self, path: &ObjectPath) -> Option<&mut CharacteristicRecord> {
        self.characteristics.get_mut(path)
    }

    pub fn characteristic_paths(&self) -> BTreeSet<ObjectPath> {
        self.characteristics.keys().cloned().collect()
    }

    /// Marks every characteristic unwatched; used after the device drops its
    /// connection and its monitors are released.
    pub fn unwatch_all(&mut self) {
        for record in self.characteristics.values_mut() {
            record.watch = WatchState::Unwatched;
        }
    }

    /// Releases the property-change subscription.  Consumes the session so
    /// the release cannot happen twice.
    pub async fn close<S>(mut self, service: &S)
    where
        S: BluetoothService + ?Sized,
    {
        if let Some(subscription) = self.subscription.take() {
            service.unsubscribe(subscription).await;
            debug!("session {}: released property subscription", self.device);
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.subscription.is_some() {
            warn!(
                "session {} dropped without close; its subscription leaks",
                self.device
            );
        }
    }
}
