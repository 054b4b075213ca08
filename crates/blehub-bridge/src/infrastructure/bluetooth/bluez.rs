//! BlueZ backend built on `bluer`.
//!
//! `bluer` hides raw D-Bus object paths behind typed handles (adapter name,
//! device address, service and characteristic ids).  This backend gives each
//! handle the path BlueZ itself would use and keeps an index from path back
//! to handle, so the rest of the bridge sees the same object model as on the
//! bus:
//!
//! ```text
//! /org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c/char000d
//! ```
//!
//! Notifications are forwarded by one spawned task per subscription; the task
//! is aborted when the subscription is released.  Characteristic values reach
//! property subscribers through the stream opened by `start_notify`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use blehub_core::domain::DeviceProperties;
use blehub_core::{BusSignal, InterfaceKind, ManagedObject, ObjectPath, PropertyChange};
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BluetoothError, BluetoothService, SignalSink, Subscription, SubscriptionTarget};

const BLUEZ_ROOT: &str = "/org/bluez";

impl From<bluer::Error> for BluetoothError {
    fn from(e: bluer::Error) -> Self {
        match e.kind {
            bluer::ErrorKind::InProgress => BluetoothError::InProgress(e.to_string()),
            bluer::ErrorKind::NotReady => BluetoothError::NotReady(e.to_string()),
            _ => BluetoothError::Failed(e.to_string()),
        }
    }
}

/// What a path refers to in `bluer` terms.
#[derive(Debug, Clone)]
enum Handle {
    Adapter {
        adapter: String,
    },
    Device {
        adapter: String,
        address: Address,
    },
    Service {
        adapter: String,
        address: Address,
        service: u16,
    },
    Characteristic {
        adapter: String,
        address: Address,
        service: u16,
        characteristic: u16,
    },
}

fn adapter_path(adapter: &str) -> ObjectPath {
    ObjectPath::new(format!("{BLUEZ_ROOT}/{adapter}"))
}

fn device_path(adapter: &str, address: Address) -> ObjectPath {
    let addr = address.to_string().replace(':', "_");
    ObjectPath::new(format!("{BLUEZ_ROOT}/{adapter}/dev_{addr}"))
}

fn service_path(device: &ObjectPath, id: u16) -> ObjectPath {
    ObjectPath::new(format!("{device}/service{id:04x}"))
}

fn characteristic_path(service: &ObjectPath, id: u16) -> ObjectPath {
    ObjectPath::new(format!("{service}/char{id:04x}"))
}

type SinkTable = Arc<Mutex<HashMap<u64, (ObjectPath, SignalSink)>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`BluetoothService`] over the system BlueZ daemon.
pub struct BluezService {
    session: bluer::Session,
    index: Arc<Mutex<HashMap<ObjectPath, Handle>>>,
    property_sinks: SinkTable,
    subscription_tasks: Mutex<HashMap<u64, Vec<JoinHandle<()>>>>,
    discovery_tasks: Mutex<HashMap<ObjectPath, JoinHandle<()>>>,
    notify_tasks: Mutex<HashMap<ObjectPath, JoinHandle<()>>>,
    next_subscription: Mutex<u64>,
}

impl BluezService {
    /// Connects to the system bus.
    pub async fn new() -> Result<Self, BluetoothError> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| BluetoothError::Unavailable(e.to_string()))?;
        Ok(Self {
            session,
            index: Arc::new(Mutex::new(HashMap::new())),
            property_sinks: Arc::new(Mutex::new(HashMap::new())),
            subscription_tasks: Mutex::new(HashMap::new()),
            discovery_tasks: Mutex::new(HashMap::new()),
            notify_tasks: Mutex::new(HashMap::new()),
            next_subscription: Mutex::new(0),
        })
    }

    fn mint(&self, target: SubscriptionTarget) -> Subscription {
        let mut next = lock(&self.next_subscription);
        *next += 1;
        Subscription::new(*next, target)
    }

    fn handle(&self, path: &ObjectPath) -> Result<Handle, BluetoothError> {
        lock(&self.index)
            .get(path)
            .cloned()
            .ok_or_else(|| BluetoothError::UnknownObject(path.clone()))
    }

    fn adapter(&self, path: &ObjectPath) -> Result<Adapter, BluetoothError> {
        match self.handle(path)? {
            Handle::Adapter { adapter } => Ok(self.session.adapter(&adapter)?),
            _ => Err(BluetoothError::UnknownObject(path.clone())),
        }
    }

    fn device(&self, path: &ObjectPath) -> Result<bluer::Device, BluetoothError> {
        match self.handle(path)? {
            Handle::Device { adapter, address } => {
                Ok(self.session.adapter(&adapter)?.device(address)?)
            }
            _ => Err(BluetoothError::UnknownObject(path.clone())),
        }
    }

    async fn characteristic(
        &self,
        path: &ObjectPath,
    ) -> Result<bluer::gatt::remote::Characteristic, BluetoothError> {
        match self.handle(path)? {
            Handle::Characteristic {
                adapter,
                address,
                service,
                characteristic,
            } => {
                let device = self.session.adapter(&adapter)?.device(address)?;
                let service = device.service(service).await?;
                Ok(service.characteristic(characteristic).await?)
            }
            _ => Err(BluetoothError::UnknownObject(path.clone())),
        }
    }
}

async fn describe_device(adapter: &Adapter, address: Address) -> bluer::Result<ManagedObject> {
    let device = adapter.device(address)?;
    let uuids = device.uuids().await?.unwrap_or_default();
    let props = DeviceProperties {
        address: address.to_string(),
        alias: device.alias().await?,
        uuids: uuids.into_iter().collect(),
        connected: device.is_connected().await?,
        services_resolved: device.is_services_resolved().await?,
    };
    Ok(ManagedObject::device(device_path(adapter.name(), address), props))
}

/// Enumerates GATT services and characteristics of a resolved device.
async fn describe_gatt(
    adapter: &str,
    device: &bluer::Device,
    out: &mut Vec<(ManagedObject, Handle)>,
) -> bluer::Result<()> {
    let address = device.address();
    let dev_path = device_path(adapter, address);
    for service in device.services().await? {
        let svc_path = service_path(&dev_path, service.id());
        out.push((
            ManagedObject::gatt_service(svc_path.clone(), service.uuid().await?, dev_path.clone()),
            Handle::Service {
                adapter: adapter.to_string(),
                address,
                service: service.id(),
            },
        ));
        for chr in service.characteristics().await? {
            out.push((
                ManagedObject::gatt_characteristic(
                    characteristic_path(&svc_path, chr.id()),
                    chr.uuid().await?,
                    svc_path.clone(),
                ),
                Handle::Characteristic {
                    adapter: adapter.to_string(),
                    address,
                    service: service.id(),
                    characteristic: chr.id(),
                },
            ));
        }
    }
    Ok(())
}

#[async_trait]
impl BluetoothService for BluezService {
    async fn managed_objects(&self) -> Result<Vec<ManagedObject>, BluetoothError> {
        let mut found: Vec<(ManagedObject, Handle)> = Vec::new();

        for name in self.session.adapter_names().await? {
            let adapter = self.session.adapter(&name)?;
            found.push((
                ManagedObject::adapter(adapter_path(&name), adapter.address().await?.to_string()),
                Handle::Adapter {
                    adapter: name.clone(),
                },
            ));

            for address in adapter.device_addresses().await? {
                let object = describe_device(&adapter, address).await?;
                let resolved = object
                    .interfaces
                    .device
                    .as_ref()
                    .map(|d| d.connected && d.services_resolved)
                    .unwrap_or(false);
                found.push((
                    object,
                    Handle::Device {
                        adapter: name.clone(),
                        address,
                    },
                ));
                if resolved {
                    let device = adapter.device(address)?;
                    describe_gatt(&name, &device, &mut found).await?;
                }
            }
        }

        let mut index = lock(&self.index);
        Ok(found
            .into_iter()
            .map(|(object, handle)| {
                index.insert(object.path.clone(), handle);
                object
            })
            .collect())
    }

    async fn subscribe_objects(&self, sink: SignalSink) -> Result<Subscription, BluetoothError> {
        let mut tasks = Vec::new();

        for name in self.session.adapter_names().await? {
            let adapter = self.session.adapter(&name)?;
            let events = adapter.events().await?;
            let index = Arc::clone(&self.index);
            let sink = sink.clone();

            tasks.push(tokio::spawn(async move {
                let mut events = Box::pin(events);
                while let Some(event) = events.next().await {
                    let signal = match event {
                        AdapterEvent::DeviceAdded(address) => {
                            match describe_device(&adapter, address).await {
                                Ok(object) => {
                                    lock(&index).insert(
                                        object.path.clone(),
                                        Handle::Device {
                                            adapter: adapter.name().to_string(),
                                            address,
                                        },
                                    );
                                    BusSignal::InterfacesAdded(object)
                                }
                                Err(e) => {
                                    warn!("cannot describe device {address}: {e}");
                                    continue;
                                }
                            }
                        }
                        AdapterEvent::DeviceRemoved(address) => {
                            let path = device_path(adapter.name(), address);
                            lock(&index).remove(&path);
                            BusSignal::InterfacesRemoved {
                                path,
                                interfaces: vec![InterfaceKind::Device],
                            }
                        }
                        _ => continue,
                    };
                    if sink.send(signal).is_err() {
                        break;
                    }
                }
                debug!("adapter {} event stream ended", adapter.name());
            }));
        }

        let sub = self.mint(SubscriptionTarget::Objects);
        lock(&self.subscription_tasks).insert(sub.id(), tasks);
        Ok(sub)
    }

    async fn subscribe_properties(
        &self,
        path: &ObjectPath,
        sink: SignalSink,
    ) -> Result<Subscription, BluetoothError> {
        let handle = self.handle(path)?;
        let mut tasks = Vec::new();

        if let Handle::Device { adapter, address } = &handle {
            let device = self.session.adapter(adapter)?.device(*address)?;
            let events = device.events().await?;

            // GATT objects only exist once services resolve; index them
            // before the change is forwarded so resolution can find them.
            let index = Arc::clone(&self.index);
            let adapter = adapter.clone();
            let path = path.clone();
            let sink = sink.clone();
            tasks.push(tokio::spawn(async move {
                let mut events = Box::pin(events);
                while let Some(event) = events.next().await {
                    let DeviceEvent::PropertyChanged(property) = event else {
                        continue;
                    };
                    let change = match property {
                        DeviceProperty::Connected(v) => PropertyChange::Connected(v),
                        DeviceProperty::ServicesResolved(v) => {
                            if v {
                                let mut found = Vec::new();
                                match describe_gatt(&adapter, &device, &mut found).await {
                                    Ok(()) => {
                                        let mut index = lock(&index);
                                        for (object, handle) in found {
                                            index.insert(object.path, handle);
                                        }
                                    }
                                    Err(e) => warn!("cannot enumerate GATT of {path}: {e}"),
                                }
                            }
                            PropertyChange::ServicesResolved(v)
                        }
                        _ => continue,
                    };
                    let signal = BusSignal::PropertiesChanged {
                        path: path.clone(),
                        changes: vec![change],
                    };
                    if sink.send(signal).is_err() {
                        break;
                    }
                }
            }));
        }

        let sub = self.mint(SubscriptionTarget::Properties(path.clone()));
        lock(&self.property_sinks).insert(sub.id(), (path.clone(), sink));
        lock(&self.subscription_tasks).insert(sub.id(), tasks);
        Ok(sub)
    }

    async fn unsubscribe(&self, subscription: Subscription) {
        lock(&self.property_sinks).remove(&subscription.id());
        if let Some(tasks) = lock(&self.subscription_tasks).remove(&subscription.id()) {
            for task in tasks {
                task.abort();
            }
        }
    }

    async fn start_discovery(&self, adapter: &ObjectPath) -> Result<(), BluetoothError> {
        let radio = self.adapter(adapter)?;
        let stream = radio.discover_devices().await?;
        // Discovery stays active for as long as the stream is alive.
        let task = tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while stream.next().await.is_some() {}
        });
        if let Some(previous) = lock(&self.discovery_tasks).insert(adapter.clone(), task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_discovery(&self, adapter: &ObjectPath) -> Result<(), BluetoothError> {
        if let Some(task) = lock(&self.discovery_tasks).remove(adapter) {
            task.abort();
        }
        Ok(())
    }

    async fn connect(&self, device: &ObjectPath) -> Result<(), BluetoothError> {
        Ok(self.device(device)?.connect().await?)
    }

    async fn disconnect(&self, device: &ObjectPath) -> Result<(), BluetoothError> {
        Ok(self.device(device)?.disconnect().await?)
    }

    async fn start_notify(&self, characteristic: &ObjectPath) -> Result<(), BluetoothError> {
        let chr = self.characteristic(characteristic).await?;
        let stream = chr.notify().await?;
        let sinks = Arc::clone(&self.property_sinks);
        let path = characteristic.clone();

        let task = tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(value) = stream.next().await {
                let signal = BusSignal::PropertiesChanged {
                    path: path.clone(),
                    changes: vec![PropertyChange::Value(value)],
                };
                for (target, sink) in lock(&sinks).values() {
                    if *target == path {
                        let _ = sink.send(signal.clone());
                    }
                }
            }
            debug!("notification stream for {path} ended");
        });

        if let Some(previous) = lock(&self.notify_tasks).insert(characteristic.clone(), task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_notify(&self, characteristic: &ObjectPath) -> Result<(), BluetoothError> {
        // Dropping the notification stream ends the notify session.
        if let Some(task) = lock(&self.notify_tasks).remove(characteristic) {
            task.abort();
        }
        Ok(())
    }

    async fn read_value(&self, characteristic: &ObjectPath) -> Result<Vec<u8>, BluetoothError> {
        Ok(self.characteristic(characteristic).await?.read().await?)
    }

    async fn write_value(
        &self,
        characteristic: &ObjectPath,
        value: &[u8],
    ) -> Result<(), BluetoothError> {
        Ok(self.characteristic(characteristic).await?.write(value).await?)
    }
}
