//! In-memory Bluetooth service for tests.
//!
//! Holds an object tree that tests populate directly, records every call in
//! order, and lets tests push signals, script failures, or make a call hang
//! so timeouts can be exercised with a paused clock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use blehub_core::{BusSignal, ManagedObject, ObjectPath, PropertyChange};

use super::{BluetoothError, BluetoothService, SignalSink, Subscription, SubscriptionTarget};

/// Operations whose outcome can be scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    SubscribeProperties,
    StartDiscovery,
    StopDiscovery,
    Connect,
    Disconnect,
    StartNotify,
    StopNotify,
    ReadValue,
    WriteValue,
}

/// A scripted outcome for one call.
#[derive(Debug, Clone)]
pub enum Scripted {
    Fail(BluetoothError),
    /// Never completes; the caller's timeout has to fire.
    Hang,
}

/// One recorded call, in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ManagedObjects,
    SubscribeObjects,
    SubscribeProperties(ObjectPath),
    Unsubscribe(SubscriptionTarget),
    StartDiscovery(ObjectPath),
    StopDiscovery(ObjectPath),
    Connect(ObjectPath),
    Disconnect(ObjectPath),
    StartNotify(ObjectPath),
    StopNotify(ObjectPath),
    ReadValue(ObjectPath),
    WriteValue(ObjectPath, Vec<u8>),
}

#[derive(Default)]
struct MockState {
    objects: BTreeMap<ObjectPath, ManagedObject>,
    object_sinks: HashMap<u64, SignalSink>,
    property_sinks: HashMap<u64, (ObjectPath, SignalSink)>,
    next_subscription: u64,
    calls: Vec<MockCall>,
    scripts: HashMap<(MockOp, ObjectPath), VecDeque<Scripted>>,
    unavailable: bool,
    keep_services_unresolved: bool,
}

/// A scriptable in-memory [`BluetoothService`].
///
/// Clones share the same state, so a test can keep one handle while the
/// bridge owns another.
#[derive(Clone, Default)]
pub struct MockBluetoothService {
    state: Arc<Mutex<MockState>>,
}

impl MockBluetoothService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Object tree ───────────────────────────────────────────────────────────

    /// Adds an object without notifying anyone, as if it existed before the
    /// bridge started.
    pub fn insert_object(&self, object: ManagedObject) {
        self.lock().objects.insert(object.path.clone(), object);
    }

    /// Adds an object and emits `InterfacesAdded` to object subscribers.
    pub fn add_object(&self, object: ManagedObject) {
        let mut state = self.lock();
        state.objects.insert(object.path.clone(), object.clone());
        for sink in state.object_sinks.values() {
            let _ = sink.send(BusSignal::InterfacesAdded(object.clone()));
        }
    }

    /// Removes an object and everything linked below it, emitting
    /// `InterfacesRemoved` for each (children first).
    pub fn remove_object(&self, path: &ObjectPath) {
        let mut state = self.lock();

        let mut doomed = vec![path.clone()];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i].clone();
            for obj in state.objects.values() {
                let linked = obj
                    .interfaces
                    .gatt_service
                    .as_ref()
                    .map(|s| s.device == parent)
                    .unwrap_or(false)
                    || obj
                        .interfaces
                        .gatt_characteristic
                        .as_ref()
                        .map(|c| c.service == parent)
                        .unwrap_or(false);
                if linked {
                    doomed.push(obj.path.clone());
                }
            }
            i += 1;
        }

        for victim in doomed.iter().rev() {
            if let Some(obj) = state.objects.remove(victim) {
                let signal = BusSignal::InterfacesRemoved {
                    path: obj.path.clone(),
                    interfaces: obj.interfaces.kinds(),
                };
                for sink in state.object_sinks.values() {
                    let _ = sink.send(signal.clone());
                }
            }
        }
    }

    /// Applies property changes to the stored object and emits
    /// `PropertiesChanged` to subscribers of `path`.
    pub fn emit_properties(&self, path: &ObjectPath, changes: Vec<PropertyChange>) {
        let mut state = self.lock();
        if let Some(obj) = state.objects.get_mut(path) {
            apply_changes(obj, &changes);
        }
        let signal = BusSignal::PropertiesChanged {
            path: path.clone(),
            changes,
        };
        for (target, sink) in state.property_sinks.values() {
            if target == path {
                let _ = sink.send(signal.clone());
            }
        }
    }

    /// Marks the device's services resolved and emits the change.
    pub fn resolve_services(&self, device: &ObjectPath) {
        self.emit_properties(device, vec![PropertyChange::ServicesResolved(true)]);
    }

    /// Emits a characteristic value notification.
    pub fn notify(&self, characteristic: &ObjectPath, value: Vec<u8>) {
        self.emit_properties(characteristic, vec![PropertyChange::Value(value)]);
    }

    // ── Scripting ─────────────────────────────────────────────────────────────

    /// Queues an outcome for the next `op` call on `path`.  Calls without a
    /// queued outcome succeed.
    pub fn script(&self, op: MockOp, path: impl Into<ObjectPath>, outcome: Scripted) {
        self.lock()
            .scripts
            .entry((op, path.into()))
            .or_default()
            .push_back(outcome);
    }

    /// Makes enumeration and object subscription fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// When set, `Connect` leaves `ServicesResolved` false so resolution
    /// only happens when a test calls [`resolve_services`](Self::resolve_services).
    pub fn set_keep_services_unresolved(&self, keep: bool) {
        self.lock().keep_services_unresolved = keep;
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of live subscriptions of any kind.
    pub fn active_subscriptions(&self) -> usize {
        let state = self.lock();
        state.object_sinks.len() + state.property_sinks.len()
    }

    /// Returns `true` if someone is subscribed to property changes of `path`.
    pub fn has_property_subscription(&self, path: &ObjectPath) -> bool {
        self.lock()
            .property_sinks
            .values()
            .any(|(target, _)| target == path)
    }

    pub fn object(&self, path: &ObjectPath) -> Option<ManagedObject> {
        self.lock().objects.get(path).cloned()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn begin(&self, call: MockCall, op: MockOp, path: &ObjectPath) -> Option<Scripted> {
        let mut state = self.lock();
        state.calls.push(call);
        state
            .scripts
            .get_mut(&(op, path.clone()))
            .and_then(VecDeque::pop_front)
    }

    fn mint(&self, state: &mut MockState, target: SubscriptionTarget) -> Subscription {
        state.next_subscription += 1;
        Subscription::new(state.next_subscription, target)
    }

    fn require_object(&self, path: &ObjectPath) -> Result<(), BluetoothError> {
        if self.lock().objects.contains_key(path) {
            Ok(())
        } else {
            Err(BluetoothError::UnknownObject(path.clone()))
        }
    }
}

fn apply_changes(obj: &mut ManagedObject, changes: &[PropertyChange]) {
    for change in changes {
        match change {
            PropertyChange::Connected(v) => {
                if let Some(dev) = obj.interfaces.device.as_mut() {
                    dev.connected = *v;
                }
            }
            PropertyChange::ServicesResolved(v) => {
                if let Some(dev) = obj.interfaces.device.as_mut() {
                    dev.services_resolved = *v;
                }
            }
            PropertyChange::Value(bytes) => {
                if let Some(chr) = obj.interfaces.gatt_characteristic.as_mut() {
                    chr.value = Some(bytes.clone());
                }
            }
        }
    }
}

async fn settle(scripted: Option<Scripted>) -> Result<(), BluetoothError> {
    match scripted {
        None => Ok(()),
        Some(Scripted::Fail(e)) => Err(e),
        Some(Scripted::Hang) => {
            std::future::pending::<()>().await;
            Ok(())
        }
    }
}

#[async_trait]
impl BluetoothService for MockBluetoothService {
    async fn managed_objects(&self) -> Result<Vec<ManagedObject>, BluetoothError> {
        let mut state = self.lock();
        state.calls.push(MockCall::ManagedObjects);
        if state.unavailable {
            return Err(BluetoothError::Unavailable("mock is unavailable".into()));
        }
        Ok(state.objects.values().cloned().collect())
    }

    async fn subscribe_objects(&self, sink: SignalSink) -> Result<Subscription, BluetoothError> {
        let mut state = self.lock();
        state.calls.push(MockCall::SubscribeObjects);
        if state.unavailable {
            return Err(BluetoothError::Unavailable("mock is unavailable".into()));
        }
        let sub = self.mint(&mut state, SubscriptionTarget::Objects);
        state.object_sinks.insert(sub.id(), sink);
        Ok(sub)
    }

    async fn subscribe_properties(
        &self,
        path: &ObjectPath,
        sink: SignalSink,
    ) -> Result<Subscription, BluetoothError> {
        let scripted = self.begin(
            MockCall::SubscribeProperties(path.clone()),
            MockOp::SubscribeProperties,
            path,
        );
        settle(scripted).await?;
        self.require_object(path)?;

        let mut state = self.lock();
        let sub = self.mint(&mut state, SubscriptionTarget::Properties(path.clone()));
        state.property_sinks.insert(sub.id(), (path.clone(), sink));
        Ok(sub)
    }

    async fn unsubscribe(&self, subscription: Subscription) {
        let mut state = self.lock();
        state
            .calls
            .push(MockCall::Unsubscribe(subscription.target().clone()));
        state.object_sinks.remove(&subscription.id());
        state.property_sinks.remove(&subscription.id());
    }

    async fn start_discovery(&self, adapter: &ObjectPath) -> Result<(), BluetoothError> {
        let scripted = self.begin(
            MockCall::StartDiscovery(adapter.clone()),
            MockOp::StartDiscovery,
            adapter,
        );
        settle(scripted).await
    }

    async fn stop_discovery(&self, adapter: &ObjectPath) -> Result<(), BluetoothError> {
        let scripted = self.begin(
            MockCall::StopDiscovery(adapter.clone()),
            MockOp::StopDiscovery,
            adapter,
        );
        settle(scripted).await
    }

    async fn connect(&self, device: &ObjectPath) -> Result<(), BluetoothError> {
        let scripted = self.begin(MockCall::Connect(device.clone()), MockOp::Connect, device);
        settle(scripted).await?;

        let mut state = self.lock();
        let resolve = !state.keep_services_unresolved;
        let dev = state
            .objects
            .get_mut(device)
            .and_then(|o| o.interfaces.device.as_mut())
            .ok_or_else(|| BluetoothError::UnknownObject(device.clone()))?;
        dev.connected = true;
        dev.services_resolved = resolve;
        Ok(())
    }

    async fn disconnect(&self, device: &ObjectPath) -> Result<(), BluetoothError> {
        let scripted = self.begin(
            MockCall::Disconnect(device.clone()),
            MockOp::Disconnect,
            device,
        );
        settle(scripted).await?;
        self.require_object(device)?;
        self.emit_properties(
            device,
            vec![
                PropertyChange::ServicesResolved(false),
                PropertyChange::Connected(false),
            ],
        );
        Ok(())
    }

    async fn start_notify(&self, characteristic: &ObjectPath) -> Result<(), BluetoothError> {
        let scripted = self.begin(
            MockCall::StartNotify(characteristic.clone()),
            MockOp::StartNotify,
            characteristic,
        );
        settle(scripted).await?;
        self.require_object(characteristic)
    }

    async fn stop_notify(&self, characteristic: &ObjectPath) -> Result<(), BluetoothError> {
        let scripted = self.begin(
            MockCall::StopNotify(characteristic.clone()),
            MockOp::StopNotify,
            characteristic,
        );
        settle(scripted).await
    }

    async fn read_value(&self, characteristic: &ObjectPath) -> Result<Vec<u8>, BluetoothError> {
        let scripted = self.begin(
            MockCall::ReadValue(characteristic.clone()),
            MockOp::ReadValue,
            characteristic,
        );
        settle(scripted).await?;
        self.lock()
            .objects
            .get(characteristic)
            .and_then(|o| o.interfaces.gatt_characteristic.as_ref())
            .map(|c| c.value.clone().unwrap_or_default())
            .ok_or_else(|| BluetoothError::UnknownObject(characteristic.clone()))
    }

    async fn write_value(
        &self,
        characteristic: &ObjectPath,
        value: &[u8],
    ) -> Result<(), BluetoothError> {
        let scripted = self.begin(
            MockCall::WriteValue(characteristic.clone(), value.to_vec()),
            MockOp::WriteValue,
            characteristic,
        );
        settle(scripted).await?;
        self.require_object(characteristic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blehub_core::domain::DeviceProperties;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn device(path: &str) -> ManagedObject {
        ManagedObject::device(
            path,
            DeviceProperties {
                address: "AA:BB:CC:DD:EE:FF".into(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_add_object_reaches_object_subscribers() {
        // Arrange
        let mock = MockBluetoothService::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = mock.subscribe_objects(tx).await.unwrap();

        // Act
        mock.add_object(device("/dev"));

        // Assert
        let signal = rx.try_recv().expect("signal expected");
        assert!(matches!(signal, BusSignal::InterfacesAdded(obj) if obj.path.as_str() == "/dev"));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let mock = MockBluetoothService::new();
        mock.insert_object(device("/dev"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = mock
            .subscribe_properties(&"/dev".into(), tx)
            .await
            .unwrap();

        mock.unsubscribe(sub).await;
        mock.emit_properties(&"/dev".into(), vec![PropertyChange::Connected(true)]);

        assert!(rx.try_recv().is_err());
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_remove_object_cascades_to_linked_children() {
        // Arrange
        let mock = MockBluetoothService::new();
        mock.insert_object(device("/dev"));
        mock.insert_object(ManagedObject::gatt_service("/dev/s1", Uuid::nil(), "/dev".into()));
        mock.insert_object(ManagedObject::gatt_characteristic(
            "/dev/s1/c1",
            Uuid::nil(),
            "/dev/s1".into(),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = mock.subscribe_objects(tx).await.unwrap();

        // Act
        mock.remove_object(&"/dev".into());

        // Assert: children first, device last
        let order: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|s| s.path().to_string())
            .collect();
        assert_eq!(order, vec!["/dev/s1/c1", "/dev/s1", "/dev"]);
        assert!(mock.object(&"/dev".into()).is_none());
    }

    #[tokio::test]
    async fn test_scripted_failure_is_returned_once() {
        let mock = MockBluetoothService::new();
        mock.insert_object(device("/dev"));
        mock.script(
            MockOp::Connect,
            "/dev",
            Scripted::Fail(BluetoothError::InProgress("busy".into())),
        );

        assert!(mock.connect(&"/dev".into()).await.is_err());
        assert!(mock.connect(&"/dev".into()).await.is_ok());
        assert_eq!(
            mock.calls(),
            vec![MockCall::Connect("/dev".into()), MockCall::Connect("/dev".into())]
        );
    }

    #[tokio::test]
    async fn test_connect_marks_services_resolved_by_default() {
        let mock = MockBluetoothService::new();
        mock.insert_object(device("/dev"));

        mock.connect(&"/dev".into()).await.unwrap();

        let dev = mock.object(&"/dev".into()).unwrap().interfaces.device.unwrap();
        assert!(dev.connected);
        assert!(dev.services_resolved);
    }

    #[tokio::test]
    async fn test_unavailable_fails_enumeration() {
        let mock = MockBluetoothService::new();
        mock.set_unavailable(true);
        assert!(matches!(
            mock.managed_objects().await,
            Err(BluetoothError::Unavailable(_))
        ));
    }
}
