//! The seam between the bridge and the local Bluetooth management service.
//!
//! [`BluetoothService`] mirrors the small part of the BlueZ D-Bus API the
//! bridge needs: enumerate objects, subscribe to object add/remove and
//! per-object property changes, and a handful of actions.
//!
//! Notifications are pushed as [`BusSignal`] values into an unbounded channel
//! supplied by the caller.  Every subscription returns a [`Subscription`]
//! handle that must be handed back through [`BluetoothService::unsubscribe`];
//! the handle is not `Clone`, so a subscription can only be released once.
//!
//! Backends:
//!
//! - [`mock::MockBluetoothService`] – in-memory, scriptable; used by tests.
//! - `bluez::BluezService` – BlueZ via `bluer`, behind the `bluez` feature.

use std::time::Duration;

use async_trait::async_trait;
use blehub_core::{BusSignal, ManagedObject, ObjectPath};
use thiserror::Error;
use tokio::sync::mpsc;

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod mock;

/// Where a backend delivers notifications.
pub type SignalSink = mpsc::UnboundedSender<BusSignal>;

/// What a [`Subscription`] is listening to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionTarget {
    /// Object add/remove notifications for the whole tree.
    Objects,
    /// Property changes of one object.
    Properties(ObjectPath),
}

/// Release handle for one notification subscription.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    target: SubscriptionTarget,
}

impl Subscription {
    /// Backends mint handles with their own ids.
    pub fn new(id: u64, target: SubscriptionTarget) -> Self {
        Self { id, target }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &SubscriptionTarget {
        &self.target
    }
}

/// Errors reported by a Bluetooth backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BluetoothError {
    /// The service itself cannot be reached (daemon down, bus gone).
    #[error("bluetooth service unavailable: {0}")]
    Unavailable(String),

    /// The path does not name a known object.
    #[error("no such object: {0}")]
    UnknownObject(ObjectPath),

    /// Another operation is still running on the object.
    #[error("operation already in progress: {0}")]
    InProgress(String),

    /// The object is not ready yet (e.g. not connected).
    #[error("not ready: {0}")]
    NotReady(String),

    /// Any other failure.
    #[error("operation failed: {0}")]
    Failed(String),

    /// The call did not complete within the configured timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

impl BluetoothError {
    /// Transient errors are worth retrying after a short delay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BluetoothError::InProgress(_) | BluetoothError::NotReady(_) | BluetoothError::Timeout(_)
        )
    }
}

/// Operations the bridge needs from the local Bluetooth management service.
#[async_trait]
pub trait BluetoothService: Send + Sync {
    /// Enumerates every object with the interfaces it implements.
    async fn managed_objects(&self) -> Result<Vec<ManagedObject>, BluetoothError>;

    /// Delivers `InterfacesAdded` / `InterfacesRemoved` for the whole tree.
    async fn subscribe_objects(&self, sink: SignalSink) -> Result<Subscription, BluetoothError>;

    /// Delivers `PropertiesChanged` for `path`.
    async fn subscribe_properties(
        &self,
        path: &ObjectPath,
        sink: SignalSink,
    ) -> Result<Subscription, BluetoothError>;

    /// Stops a subscription.  No signal for it is sent afterwards.
    async fn unsubscribe(&self, subscription: Subscription);

    async fn start_discovery(&self, adapter: &ObjectPath) -> Result<(), BluetoothError>;

    async fn stop_discovery(&self, adapter: &ObjectPath) -> Result<(), BluetoothError>;

    async fn connect(&self, device: &ObjectPath) -> Result<(), BluetoothError>;

    async fn disconnect(&self, device: &ObjectPath) -> Result<(), BluetoothError>;

    async fn start_notify(&self, characteristic: &ObjectPath) -> Result<(), BluetoothError>;

    async fn stop_notify(&self, characteristic: &ObjectPath) -> Result<(), BluetoothError>;

    async fn read_value(&self, characteristic: &ObjectPath) -> Result<Vec<u8>, BluetoothError>;

    async fn write_value(
        &self,
        characteristic: &ObjectPath,
        value: &[u8],
    ) -> Result<(), BluetoothError>;
}
