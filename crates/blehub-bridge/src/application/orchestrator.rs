//! Bridge orchestrator: the interest table applied to BLE events and client
//! commands.
//!
//! [`Bridge`] sits between the WebSocket session and the
//! [`DiscoveryManager`].  It has no I/O of its own: every method takes an
//! input (a bus signal or a client message) and returns the JSON messages the
//! session should send to the browser.
//!
//! # Data flow
//!
//! ```text
//! BusSignal ──► DiscoveryManager::handle_signal ──► BleEvent ──► route ──► HubToClientMsg
//!                                                                  │
//!                             watch_characteristic ◄── ServiceFound┘
//!
//! ClientToHubMsg ──► resolve address ──► connect / disconnect ──► BleEvent ──► route
//! ```
//!
//! # Session registry
//!
//! Only devices advertising a service from the interest table are announced
//! to the browser.  The registry maps their object path to the address the
//! browser knows them by; `conn_device`/`disc_device` resolve that address
//! back to a path.

use std::collections::BTreeMap;
use std::sync::Arc;

use blehub_core::{BusSignal, HandlerId, InterestTable, ObjectPath};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{BleEvent, BridgeConfig, ClientToHubMsg, HubToClientMsg};
use crate::infrastructure::bluetooth::BluetoothService;

use super::discovery::{DiscoveryManager, ManagerError};
use super::retry::CallPolicy;

// ── Error type ────────────────────────────────────────────────────────────────

/// Errors reported for one client command.  None of them ends the session.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The text frame was not valid JSON or had an unknown `"type"`.
    #[error("malformed client message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    /// No announced device has this address.
    #[error("no announced device with address {0}")]
    UnknownAddress(String),

    /// Several announced devices share this address.
    #[error("address {address} matches {count} announced devices")]
    AmbiguousAddress { address: String, count: usize },

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// An announced device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub address: String,
    pub alias: String,
    pub uuids: Vec<Uuid>,
}

// ── Bridge ────────────────────────────────────────────────────────────────────

/// Per-session bridge state: the discovery manager plus the registry of
/// announced devices.
pub struct Bridge<S: BluetoothService + ?Sized> {
    manager: DiscoveryManager<S>,
    interest: InterestTable,
    registry: BTreeMap<ObjectPath, RegistryEntry>,
}

impl<S: BluetoothService + ?Sized> Bridge<S> {
    /// Creates a bridge for one client session.
    ///
    /// Returns the receiving end of the signal channel; the session loop
    /// passes every signal it yields to [`on_signal`](Self::on_signal).
    pub fn new(service: Arc<S>, config: &BridgeConfig) -> (Self, UnboundedReceiver<BusSignal>) {
        let (sink, signals) = mpsc::unbounded_channel();
        let manager = DiscoveryManager::new(service, CallPolicy::from_config(config), sink);
        let bridge = Self {
            manager,
            interest: config.interest.clone(),
            registry: BTreeMap::new(),
        };
        (bridge, signals)
    }

    pub fn manager(&self) -> &DiscoveryManager<S> {
        &self.manager
    }

    pub fn registry(&self) -> impl Iterator<Item = (&ObjectPath, &RegistryEntry)> {
        self.registry.iter()
    }

    /// Enters the discovery manager and announces matching devices that
    /// already exist.
    pub async fn start(&mut self) -> Result<Vec<HubToClientMsg>, BridgeError> {
        let events = self.manager.enter().await?;
        self.route(events).await
    }

    /// Releases every subscription, monitor and connection.
    pub async fn shutdown(&mut self) {
        self.manager.exit().await;
        self.registry.clear();
    }

    /// Handles one notification from the Bluetooth service.
    ///
    /// Failures are logged here; there is no command to reject.
    pub async fn on_signal(&mut self, signal: BusSignal) -> Vec<HubToClientMsg> {
        let events = self.manager.handle_signal(signal).await;
        match self.route(events).await {
            Ok(out) => out,
            Err(e) => {
                warn!("dropping signal outcome: {e}");
                Vec::new()
            }
        }
    }

    /// Parses and handles one text frame from the browser.
    pub async fn on_client_text(&mut self, text: &str) -> Result<Vec<HubToClientMsg>, BridgeError> {
        let msg: ClientToHubMsg = serde_json::from_str(text)?;
        self.on_client_message(msg).await
    }

    /// Handles one command from the browser.
    pub async fn on_client_message(
        &mut self,
        msg: ClientToHubMsg,
    ) -> Result<Vec<HubToClientMsg>, BridgeError> {
        match msg {
            ClientToHubMsg::ConnDevice { dev_addr } => {
                let device = self.resolve_address(&dev_addr)?;
                info!("client asked to connect {dev_addr} ({device})");
                let events = self.manager.connect(&device).await?;
                self.route(events).await
            }
            ClientToHubMsg::DiscDevice { dev_addr } => {
                let device = self.resolve_address(&dev_addr)?;
                info!("client asked to disconnect {dev_addr} ({device})");
                self.manager.disconnect(&device).await?;
                Ok(Vec::new())
            }
        }
    }

    // ── Routing ───────────────────────────────────────────────────────────────

    /// Turns manager events into browser messages.
    ///
    /// Stops at the first failed watch; the owning device is already torn
    /// down by then.
    async fn route(&mut self, events: Vec<BleEvent>) -> Result<Vec<HubToClientMsg>, BridgeError> {
        let mut out = Vec::new();
        for event in events {
            match event {
                BleEvent::DeviceFound {
                    device,
                    address,
                    alias,
                    uuids,
                } => {
                    if self.registry.contains_key(&device) || !self.interest.matches_any(&uuids) {
                        continue;
                    }
                    info!("announcing {address} ({alias})");
                    out.push(HubToClientMsg::NewDevice {
                        dev_addr: address.clone(),
                    });
                    self.registry.insert(
                        device,
                        RegistryEntry {
                            address,
                            alias,
                            uuids,
                        },
                    );
                }
                BleEvent::DeviceRemoved { device } => {
                    if let Some(entry) = self.registry.remove(&device) {
                        info!("withdrawing {}", entry.address);
                        out.push(HubToClientMsg::RemDevice {
                            dev_addr: entry.address,
                        });
                    }
                }
                BleEvent::ServiceFound {
                    device,
                    uuid,
                    characteristics,
                    ..
                } => {
                    self.watch_interesting(&device, uuid, &characteristics).await?;
                }
                BleEvent::ValueChanged {
                    device,
                    handler,
                    value,
                    ..
                } => {
                    if let Some(msg) = self.decode_value(&device, handler, &value) {
                        out.push(msg);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Watches every characteristic of `service_uuid` named in the interest
    /// table.  A failed call into the Bluetooth service disconnects `device`.
    async fn watch_interesting(
        &mut self,
        device: &ObjectPath,
        service_uuid: Uuid,
        characteristics: &BTreeMap<ObjectPath, Uuid>,
    ) -> Result<(), BridgeError> {
        let targets: Vec<_> = self
            .interest
            .entries_for_service(service_uuid)
            .filter_map(|(handler, entry)| {
                characteristics
                    .iter()
                    .find(|(_, uuid)| **uuid == entry.characteristic_uuid)
                    .map(|(path, _)| (path.clone(), handler))
            })
            .collect();

        for (characteristic, handler) in targets {
            match self.manager.watch_characteristic(&characteristic, handler).await {
                Ok(()) => debug!("{device}: watching {characteristic} with {handler}"),
                Err(e @ ManagerError::Call { .. }) => {
                    error!("{device}: cannot watch {characteristic}: {e}");
                    if let Err(teardown) = self.manager.disconnect(device).await {
                        warn!("{device}: teardown incomplete: {teardown}");
                    }
                    return Err(e.into());
                }
                Err(e) => warn!("{device}: cannot watch {characteristic}: {e}"),
            }
        }
        Ok(())
    }

    fn decode_value(
        &self,
        device: &ObjectPath,
        handler: HandlerId,
        value: &[u8],
    ) -> Option<HubToClientMsg> {
        let Some(registered) = self.registry.get(device) else {
            debug!("value from unannounced device {device} dropped");
            return None;
        };
        let entry = self.interest.entry(handler)?;
        match entry.decoder.decode(value) {
            Ok(decoded) => Some(HubToClientMsg::ValueUpdate {
                dev_addr: registered.address.clone(),
                value: decoded,
            }),
            Err(e) => {
                warn!(
                    "{}: {} could not decode {} bytes: {e}",
                    registered.address,
                    entry.decoder.name(),
                    value.len()
                );
                None
            }
        }
    }

    fn resolve_address(&self, address: &str) -> Result<ObjectPath, BridgeError> {
        let mut matches = self
            .registry
            .iter()
            .filter(|(_, entry)| entry.address.eq_ignore_ascii_case(address))
            .map(|(path, _)| path);

        match (matches.next(), matches.count()) {
            (Some(path), 0) => Ok(path.clone()),
            (None, _) => Err(BridgeError::UnknownAddress(address.to_string())),
            (Some(_), rest) => Err(BridgeError::AmbiguousAddress {
                address: address.to_string(),
                count: rest + 1,
            }),
        }
    }
}
