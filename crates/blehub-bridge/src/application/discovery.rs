//! BLE discovery & session manager.
//!
//! The manager is the only owner of Bluetooth state in the bridge:
//!
//! - the adapters found at startup,
//! - one [`DeviceRecord`] per discovered device (keyed by object path),
//! - one [`DeviceSession`] per device the client asked to connect, holding
//!   that device's Service and Characteristic records,
//! - one [`CharacteristicMonitor`] per watched characteristic.
//!
//! Every signal from the Bluetooth service and every command from the
//! orchestrator goes through a `&mut self` method here, so the tables are
//! updated by one caller at a time.  Methods return the [`BleEvent`]s the
//! orchestrator should see rather than invoking callbacks.
//!
//! # Teardown order
//!
//! Whenever a device goes away (removal, disconnect, exit) its monitors are
//! stopped first, then its session is closed, and only then is the device
//! record changed or dropped.  No monitor outlives the record it belongs to.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use blehub_core::domain::DeviceProperties;
use blehub_core::{BusSignal, HandlerId, InterfaceKind, ManagedObject, ObjectPath, PropertyChange};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::BleEvent;
use crate::infrastructure::bluetooth::{BluetoothError, BluetoothService, SignalSink, Subscription};

use super::monitor::CharacteristicMonitor;
use super::retry::CallPolicy;
use super::session::{DeviceSession, SessionUpdate, WatchState};

// ── Error type ────────────────────────────────────────────────────────────────

/// Errors reported by the discovery manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Enumeration or the add/remove subscription failed on `enter`.
    #[error("bluetooth service unreachable: {0}")]
    Unreachable(#[source] BluetoothError),

    #[error("discovery manager already entered")]
    AlreadyEntered,

    #[error("unknown device: {0}")]
    UnknownDevice(ObjectPath),

    /// No connected device has this characteristic.
    #[error("characteristic {0} has no connected owner")]
    NoOwner(ObjectPath),

    /// More than one connected device claims this characteristic.
    #[error("characteristic {characteristic} is claimed by {owners} connected devices")]
    AmbiguousOwner {
        characteristic: ObjectPath,
        owners: usize,
    },

    #[error("characteristic {0} is not watched")]
    NotWatched(ObjectPath),

    /// A call into the Bluetooth service failed or timed out.
    #[error("{op} on {path} failed: {source}")]
    Call {
        op: &'static str,
        path: ObjectPath,
        #[source]
        source: BluetoothError,
    },
}

impl ManagerError {
    fn call(op: &'static str, path: &ObjectPath, source: BluetoothError) -> Self {
        ManagerError::Call {
            op,
            path: path.clone(),
            source,
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// Connection state of a discovered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Discovered,
    Connecting,
    Connected,
    ServicesResolved,
    Disconnected,
}

impl DeviceState {
    fn is_connected(self) -> bool {
        matches!(self, DeviceState::Connected | DeviceState::ServicesResolved)
    }
}

/// A discovered peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub path: ObjectPath,
    pub address: String,
    pub alias: String,
    pub uuids: Vec<uuid::Uuid>,
    pub state: DeviceState,
}

impl DeviceRecord {
    fn new(path: ObjectPath, props: &DeviceProperties) -> Self {
        Self {
            path,
            address: props.address.clone(),
            alias: if props.alias.is_empty() {
                props.address.clone()
            } else {
                props.alias.clone()
            },
            uuids: props.uuids.clone(),
            state: DeviceState::Discovered,
        }
    }

    fn found_event(&self) -> BleEvent {
        BleEvent::DeviceFound {
            device: self.path.clone(),
            address: self.address.clone(),
            alias: self.alias.clone(),
            uuids: self.uuids.clone(),
        }
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// Tracks adapters, devices, sessions and monitors for one bridge session.
pub struct DiscoveryManager<S: BluetoothService + ?Sized> {
    service: Arc<S>,
    policy: CallPolicy,
    sink: SignalSink,
    objects_subscription: Option<Subscription>,
    adapters: Vec<ObjectPath>,
    devices: BTreeMap<ObjectPath, DeviceRecord>,
    sessions: BTreeMap<ObjectPath, DeviceSession>,
    monitors: HashMap<ObjectPath, CharacteristicMonitor>,
}

impl<S: BluetoothService + ?Sized> DiscoveryManager<S> {
    /// Creates an idle manager.  Signals from every subscription it makes are
    /// delivered to `sink`.
    pub fn new(service: Arc<S>, policy: CallPolicy, sink: SignalSink) -> Self {
        Self {
            service,
            policy,
            sink,
            objects_subscription: None,
            adapters: Vec::new(),
            devices: BTreeMap::new(),
            sessions: BTreeMap::new(),
            monitors: HashMap::new(),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn device(&self, path: &ObjectPath) -> Option<&DeviceRecord> {
        self.devices.get(path)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    pub fn adapters(&self) -> &[ObjectPath] {
        &self.adapters
    }

    pub fn session(&self, device: &ObjectPath) -> Option<&DeviceSession> {
        self.sessions.get(device)
    }

    pub fn is_watched(&self, characteristic: &ObjectPath) -> bool {
        self.monitors.contains_key(characteristic)
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Enumerates existing objects, subscribes to add/remove notifications
    /// and starts discovery on every adapter.
    ///
    /// Returns a `DeviceFound` for every device already known.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Unreachable`] if enumeration or the subscription
    /// fails.  A failure to start discovery on an adapter is only logged.
    pub async fn enter(&mut self) -> Result<Vec<BleEvent>, ManagerError> {
        if self.objects_subscription.is_some() {
            return Err(ManagerError::AlreadyEntered);
        }

        let objects = self
            .policy
            .call(self.service.managed_objects())
            .await
            .map_err(ManagerError::Unreachable)?;

        let mut events = Vec::new();
        for object in &objects {
            if object.interfaces.adapter.is_some() {
                self.adapters.push(object.path.clone());
            }
            if let Some(event) = self.record_device(object) {
                events.push(event);
            }
        }

        let subscription = self
            .policy
            .call(self.service.subscribe_objects(self.sink.clone()))
            .await
            .map_err(ManagerError::Unreachable)?;
        self.objects_subscription = Some(subscription);

        for adapter in self.adapters.clone() {
            self.start_discovery(&adapter).await;
        }

        info!(
            "discovery manager entered: {} adapters, {} devices",
            self.adapters.len(),
            self.devices.len()
        );
        Ok(events)
    }

    /// Releases everything: the add/remove subscription, discovery on every
    /// adapter and every connected device.  Errors are logged.
    pub async fn exit(&mut self) {
        if let Some(subscription) = self.objects_subscription.take() {
            self.service.unsubscribe(subscription).await;
        }

        for adapter in std::mem::take(&mut self.adapters) {
            if let Err(e) = self.policy.call(self.service.stop_discovery(&adapter)).await {
                warn!("StopDiscovery on {adapter} failed: {e}");
            }
        }

        let connected: Vec<ObjectPath> = self.sessions.keys().cloned().collect();
        for device in connected {
            if let Err(e) = self.disconnect(&device).await {
                warn!("disconnect of {device} during exit failed: {e}");
            }
        }

        self.devices.clear();
        info!("discovery manager exited");
    }

    // ── Signals ───────────────────────────────────────────────────────────────

    /// Applies one notification from the Bluetooth service.
    pub async fn handle_signal(&mut self, signal: BusSignal) -> Vec<BleEvent> {
        match signal {
            BusSignal::InterfacesAdded(object) => {
                if object.interfaces.adapter.is_some() && !self.adapters.contains(&object.path) {
                    self.adapters.push(object.path.clone());
                    self.start_discovery(&object.path).await;
                }
                self.record_device(&object).into_iter().collect()
            }
            BusSignal::InterfacesRemoved { path, interfaces } => {
                if interfaces.contains(&InterfaceKind::Device) {
                    self.remove_device(&path).await.into_iter().collect()
                } else {
                    Vec::new()
                }
            }
            BusSignal::PropertiesChanged { path, changes } => {
                if self.sessions.contains_key(&path) {
                    self.on_device_changes(&path, &changes).await
                } else if self.monitors.contains_key(&path) {
                    self.on_characteristic_changes(&path, &changes)
                } else {
                    debug!("ignoring property change on unwatched {path}");
                    Vec::new()
                }
            }
        }
    }

    fn record_device(&mut self, object: &ManagedObject) -> Option<BleEvent> {
        let props = object.interfaces.device.as_ref()?;
        let mut record = DeviceRecord::new(object.path.clone(), props);
        if let Some(existing) = self.devices.get(&object.path) {
            record.state = existing.state;
            debug!("device {} re-announced", object.path);
        } else {
            info!("device found: {} ({})", record.address, object.path);
        }
        let event = record.found_event();
        self.devices.insert(object.path.clone(), record);
        Some(event)
    }

    async fn remove_device(&mut self, device: &ObjectPath) -> Option<BleEvent> {
        if !self.devices.contains_key(device) {
            return None;
        }
        self.stop_monitors_of(device).await;
        if let Some(session) = self.sessions.remove(device) {
            session.close(&*self.service).await;
        }
        self.devices.remove(device);
        info!("device removed: {device}");
        Some(BleEvent::DeviceRemoved {
            device: device.clone(),
        })
    }

    async fn on_device_changes(
        &mut self,
        device: &ObjectPath,
        changes: &[PropertyChange],
    ) -> Vec<BleEvent> {
        let updates = match self.sessions.get(device) {
            Some(session) => session.interpret(changes),
            None => return Vec::new(),
        };

        let mut events = Vec::new();
        for update in updates {
            match update {
                SessionUpdate::Connected => self.set_state(device, DeviceState::Connected),
                SessionUpdate::Disconnected => {
                    info!("device {device} dropped its connection");
                    self.stop_monitors_of(device).await;
                    if let Some(session) = self.sessions.get_mut(device) {
                        session.unwatch_all();
                    }
                    self.set_state(device, DeviceState::Disconnected);
                }
                SessionUpdate::ServicesResolved => match self.resolve(device).await {
                    Ok(found) => events.extend(found),
                    Err(e) => {
                        error!("resolution of {device} failed: {e}");
                        self.abort_session(device).await;
                        return events;
                    }
                },
            }
        }
        events
    }

    fn on_characteristic_changes(
        &mut self,
        characteristic: &ObjectPath,
        changes: &[PropertyChange],
    ) -> Vec<BleEvent> {
        let Some(monitor) = self.monitors.get_mut(characteristic) else {
            return Vec::new();
        };
        let Some(event) = monitor.on_changes(changes) else {
            return Vec::new();
        };
        if let Some(record) = self
            .sessions
            .get_mut(monitor.device())
            .and_then(|s| s.characteristic_mut(characteristic))
        {
            record.value = monitor.last_value().map(<[u8]>::to_vec);
        }
        vec![event]
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Connects to `device`.
    ///
    /// Returns `ServiceFound` events when the device already reports its
    /// services resolved; otherwise they arrive later through
    /// [`handle_signal`](Self::handle_signal).  Connecting a device that is
    /// already connecting or connected does nothing.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::UnknownDevice`] if the device was never discovered.
    /// - [`ManagerError::Call`] if the subscription or `Connect` failed; the
    ///   partial session is torn down and the device is back to Discovered.
    ///   If enumeration fails after `Connect`, the device is disconnected.
    pub async fn connect(&mut self, device: &ObjectPath) -> Result<Vec<BleEvent>, ManagerError> {
        let state = self
            .devices
            .get(device)
            .map(|d| d.state)
            .ok_or_else(|| ManagerError::UnknownDevice(device.clone()))?;

        if matches!(
            state,
            DeviceState::Connecting | DeviceState::Connected | DeviceState::ServicesResolved
        ) {
            debug!("connect {device}: already {state:?}");
            return Ok(Vec::new());
        }

        let session = match self.sessions.remove(device) {
            Some(session) => session,
            None => DeviceSession::open(&*self.service, &self.policy, device.clone(), self.sink.clone())
                .await
                .map_err(|e| ManagerError::call("subscribe", device, e))?,
        };
        self.sessions.insert(device.clone(), session);
        self.set_state(device, DeviceState::Connecting);
        info!("connecting to {device}");

        let service = &*self.service;
        let result = self
            .policy
            .call_with_retry("Connect", || service.connect(device))
            .await;

        if let Err(e) = result {
            error!("connect to {device} failed: {e}");
            if let Some(session) = self.sessions.remove(device) {
                session.close(&*self.service).await;
            }
            self.set_state(device, DeviceState::Discovered);
            return Err(ManagerError::call("Connect", device, e));
        }

        self.set_state(device, DeviceState::Connected);
        info!("connected to {device}");

        let objects = match self.policy.call(self.service.managed_objects()).await {
            Ok(objects) => objects,
            Err(e) => {
                error!("enumeration after connecting {device} failed: {e}");
                self.abort_session(device).await;
                return Err(ManagerError::call("GetManagedObjects", device, e));
            }
        };
        let resolved = objects
            .iter()
            .find(|o| &o.path == device)
            .and_then(|o| o.interfaces.device.as_ref())
            .map(|d| d.services_resolved)
            .unwrap_or(false);

        if resolved {
            Ok(self.apply_resolution(device, &objects).await)
        } else {
            debug!("connect {device}: waiting for services to resolve");
            Ok(Vec::new())
        }
    }

    /// Disconnects `device`: stops its monitors, closes its session, then
    /// issues `Disconnect`.  The device record stays (state Disconnected)
    /// until the removal notification arrives.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::UnknownDevice`] if the device was never discovered.
    /// - [`ManagerError::Call`] if `Disconnect` failed; local state is
    ///   already torn down at that point.
    pub async fn disconnect(&mut self, device: &ObjectPath) -> Result<(), ManagerError> {
        if !self.devices.contains_key(device) {
            return Err(ManagerError::UnknownDevice(device.clone()));
        }
        let Some(session) = self.sessions.remove(device) else {
            debug!("disconnect {device}: no session");
            return Ok(());
        };

        self.stop_monitors_of(device).await;
        session.close(&*self.service).await;
        self.set_state(device, DeviceState::Disconnected);
        info!("disconnecting {device}");

        self.policy
            .call(self.service.disconnect(device))
            .await
            .map_err(|e| ManagerError::call("Disconnect", device, e))
    }

    /// Starts a monitor on `characteristic` forwarding to `handler`.
    ///
    /// Watching an already-watched characteristic does nothing.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::NoOwner`] / [`ManagerError::AmbiguousOwner`] unless
    ///   exactly one connected device owns the characteristic.
    /// - [`ManagerError::Call`] if the monitor could not be started.
    pub async fn watch_characteristic(
        &mut self,
        characteristic: &ObjectPath,
        handler: HandlerId,
    ) -> Result<(), ManagerError> {
        if self.monitors.contains_key(characteristic) {
            debug!("watch {characteristic}: already watched");
            return Ok(());
        }

        let owner = self.owner_of(characteristic)?;
        let monitor = CharacteristicMonitor::start(
            &*self.service,
            &self.policy,
            characteristic.clone(),
            owner.clone(),
            handler,
            self.sink.clone(),
        )
        .await
        .map_err(|e| ManagerError::call("StartNotify", characteristic, e))?;

        if let Some(record) = self
            .sessions
            .get_mut(&owner)
            .and_then(|s| s.characteristic_mut(characteristic))
        {
            record.watch = WatchState::Watched;
        }
        self.monitors.insert(characteristic.clone(), monitor);
        Ok(())
    }

    /// Reads the current value of a watched characteristic.
    pub async fn read_characteristic(
        &mut self,
        characteristic: &ObjectPath,
    ) -> Result<Vec<u8>, ManagerError> {
        let monitor = self
            .monitors
            .get_mut(characteristic)
            .ok_or_else(|| ManagerError::NotWatched(characteristic.clone()))?;
        monitor
            .read_value(&*self.service, &self.policy)
            .await
            .map_err(|e| ManagerError::call("ReadValue", characteristic, e))
    }

    /// Writes `value` to a watched characteristic.
    pub async fn write_characteristic(
        &mut self,
        characteristic: &ObjectPath,
        value: &[u8],
    ) -> Result<(), ManagerError> {
        let monitor = self
            .monitors
            .get(characteristic)
            .ok_or_else(|| ManagerError::NotWatched(characteristic.clone()))?;
        monitor
            .write_value(&*self.service, &self.policy, value)
            .await
            .map_err(|e| ManagerError::call("WriteValue", characteristic, e))
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn start_discovery(&self, adapter: &ObjectPath) {
        match self.policy.call(self.service.start_discovery(adapter)).await {
            Ok(()) => info!("discovery started on {adapter}"),
            Err(e) => warn!("StartDiscovery on {adapter} failed: {e}"),
        }
    }

    fn set_state(&mut self, device: &ObjectPath, state: DeviceState) {
        if let Some(record) = self.devices.get_mut(device) {
            record.state = state;
        }
    }

    /// The unique connected device whose session holds `characteristic`.
    fn owner_of(&self, characteristic: &ObjectPath) -> Result<ObjectPath, ManagerError> {
        let owners: Vec<&ObjectPath> = self
            .sessions
            .iter()
            .filter(|(device, session)| {
                self.devices
                    .get(*device)
                    .map(|d| d.state.is_connected())
                    .unwrap_or(false)
                    && session.characteristic(characteristic).is_some()
            })
            .map(|(device, _)| device)
            .collect();

        match owners.as_slice() {
            [owner] => Ok((*owner).clone()),
            [] => Err(ManagerError::NoOwner(characteristic.clone())),
            many => Err(ManagerError::AmbiguousOwner {
                characteristic: characteristic.clone(),
                owners: many.len(),
            }),
        }
    }

    /// Tears `device` down after a failed call, the same way as
    /// [`disconnect`](Self::disconnect).
    async fn abort_session(&mut self, device: &ObjectPath) {
        if let Err(e) = self.disconnect(device).await {
            warn!("teardown of {device} incomplete: {e}");
        }
    }

    async fn resolve(&mut self, device: &ObjectPath) -> Result<Vec<BleEvent>, ManagerError> {
        let objects = self
            .policy
            .call(self.service.managed_objects())
            .await
            .map_err(|e| ManagerError::call("GetManagedObjects", device, e))?;
        Ok(self.apply_resolution(device, &objects).await)
    }

    async fn apply_resolution(
        &mut self,
        device: &ObjectPath,
        objects: &[ManagedObject],
    ) -> Vec<BleEvent> {
        let Some(session) = self.sessions.get_mut(device) else {
            return Vec::new();
        };
        let events = session.resolve(objects);
        let remaining = session.characteristic_paths();

        // Monitors whose characteristic vanished in the new resolution.
        let stale: Vec<ObjectPath> = self
            .monitors
            .iter()
            .filter(|(path, m)| m.device() == device && !remaining.contains(*path))
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            if let Some(monitor) = self.monitors.remove(&path) {
                monitor.stop(&*self.service, &self.policy).await;
            }
        }

        self.set_state(device, DeviceState::ServicesResolved);
        info!("services resolved on {device}: {} services", events.len());
        events
    }

    async fn stop_monitors_of(&mut self, device: &ObjectPath) {
        let owned: Vec<ObjectPath> = self
            .monitors
            .iter()
            .filter(|(_, m)| m.device() == device)
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            if let Some(monitor) = self.monitors.remove(&path) {
                monitor.stop(&*self.service, &self.policy).await;
            }
        }
    }
}
