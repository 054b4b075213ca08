//! GATT characteristic monitor: notifications for one watched characteristic.
//!
//! Lifecycle:
//!
//! ```text
//! start ──► subscribe to property changes ──► StartNotify ──► running
//!              │                                  │ fails
//!              │                                  ▼
//!              │                       release subscription, return error
//! stop(self) ──► release subscription ──► StopNotify (best effort)
//! ```
//!
//! `stop` takes the monitor by value, so a monitor is stopped at most once
//! and cannot be used afterwards.

use blehub_core::{HandlerId, ObjectPath, PropertyChange};
use tracing::{debug, info, warn};

use crate::domain::BleEvent;
use crate::infrastructure::bluetooth::{BluetoothError, BluetoothService, SignalSink, Subscription};

use super::retry::CallPolicy;

/// An active notification subscription on one characteristic.
#[derive(Debug)]
pub struct CharacteristicMonitor {
    characteristic: ObjectPath,
    device: ObjectPath,
    handler: HandlerId,
    subscription: Option<Subscription>,
    last_value: Option<Vec<u8>>,
}

impl CharacteristicMonitor {
    /// Subscribes to value changes of `characteristic` and enables
    /// notifications on it.
    pub async fn start<S>(
        service: &S,
        policy: &CallPolicy,
        characteristic: ObjectPath,
        device: ObjectPath,
        handler: HandlerId,
        sink: SignalSink,
    ) -> Result<Self, BluetoothError>
    where
        S: BluetoothService + ?Sized,
    {
        let subscription = policy
            .call(service.subscribe_properties(&characteristic, sink))
            .await?;

        let path = &characteristic;
        if let Err(e) = policy
            .call_with_retry("StartNotify", || service.start_notify(path))
            .await
        {
            service.unsubscribe(subscription).await;
            return Err(e);
        }

        info!("monitor {characteristic}: notifications enabled ({handler})");
        Ok(Self {
            characteristic,
            device,
            handler,
            subscription: Some(subscription),
            last_value: None,
        })
    }

    pub fn characteristic(&self) -> &ObjectPath {
        &self.characteristic
    }

    pub fn device(&self) -> &ObjectPath {
        &self.device
    }

    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    pub fn last_value(&self) -> Option<&[u8]> {
        self.last_value.as_deref()
    }

    /// Records the newest value among `changes` and returns the event for it.
    pub fn on_changes(&mut self, changes: &[PropertyChange]) -> Option<BleEvent> {
        let value = changes.iter().rev().find_map(|change| match change {
            PropertyChange::Value(bytes) => Some(bytes.clone()),
            _ => None,
        })?;
        self.last_value = Some(value.clone());
        Some(BleEvent::ValueChanged {
            device: self.device.clone(),
            characteristic: self.characteristic.clone(),
            handler: self.handler,
            value,
        })
    }

    /// Reads the current value from the peripheral.
    pub async fn read_value<S>(
        &mut self,
        service: &S,
        policy: &CallPolicy,
    ) -> Result<Vec<u8>, BluetoothError>
    where
        S: BluetoothService + ?Sized,
    {
        let value = policy.call(service.read_value(&self.characteristic)).await?;
        self.last_value = Some(value.clone());
        Ok(value)
    }

    /// Writes `value` to the peripheral.
    pub async fn write_value<S>(
        &self,
        service: &S,
        policy: &CallPolicy,
        value: &[u8],
    ) -> Result<(), BluetoothError>
    where
        S: BluetoothService + ?Sized,
    {
        policy
            .call(service.write_value(&self.characteristic, value))
            .await
    }

    /// Releases the subscription and disables notifications.
    pub async fn stop<S>(mut self, service: &S, policy: &CallPolicy)
    where
        S: BluetoothService + ?Sized,
    {
        if let Some(subscription) = self.subscription.take() {
            service.unsubscribe(subscription).await;
        }
        if let Err(e) = policy.call(service.stop_notify(&self.characteristic)).await {
            warn!("monitor {}: StopNotify failed: {e}", self.characteristic);
        }
        debug!("monitor {}: stopped", self.characteristic);
    }
}

impl Drop for CharacteristicMonitor {
    fn drop(&mut self) {
        if self.subscription.is_some() {
            warn!(
                "monitor {} dropped without stop; its subscription leaks",
                self.characteristic
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{MockBluetoothService, MockCall, MockOp, Scripted};
    use blehub_core::ManagedObject;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const CHR: &str = "/hci0/dev1/s1/c1";

    fn policy() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(1),
            attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }

    fn mock_with_characteristic() -> MockBluetoothService {
        let mock = MockBluetoothService::new();
        mock.insert_object(ManagedObject::gatt_characteristic(
            CHR,
            Uuid::nil(),
            "/hci0/dev1/s1".into(),
        ));
        mock
    }

    async fn start(mock: &MockBluetoothService, sink: SignalSink) -> CharacteristicMonitor {
        CharacteristicMonitor::start(
            mock,
            &policy(),
            CHR.into(),
            "/hci0/dev1".into(),
            HandlerId(0),
            sink,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_subscribes_then_enables_notify() {
        // Arrange
        let mock = mock_with_characteristic();
        let (tx, _rx) = mpsc::unbounded_channel();

        // Act
        let monitor = start(&mock, tx).await;

        // Assert
        assert_eq!(
            mock.calls(),
            vec![
                MockCall::SubscribeProperties(CHR.into()),
                MockCall::StartNotify(CHR.into())
            ]
        );
        monitor.stop(&mock, &policy()).await;
    }

    #[tokio::test]
    async fn test_failed_start_notify_releases_subscription() {
        // Arrange
        let mock = mock_with_characteristic();
        mock.script(
            MockOp::StartNotify,
            CHR,
            Scripted::Fail(BluetoothError::Failed("not permitted".into())),
        );
        let (tx, _rx) = mpsc::unbounded_channel();

        // Act
        let result = CharacteristicMonitor::start(
            &mock,
            &policy(),
            CHR.into(),
            "/hci0/dev1".into(),
            HandlerId(0),
            tx,
        )
        .await;

        // Assert
        assert!(result.is_err());
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_start_notify_failure_is_retried() {
        let mock = mock_with_characteristic();
        mock.script(
            MockOp::StartNotify,
            CHR,
            Scripted::Fail(BluetoothError::InProgress("busy".into())),
        );
        let (tx, _rx) = mpsc::unbounded_channel();

        let monitor = start(&mock, tx).await;

        let notifies = mock
            .calls()
            .into_iter()
            .filter(|c| matches!(c, MockCall::StartNotify(_)))
            .count();
        assert_eq!(notifies, 2);
        monitor.stop(&mock, &policy()).await;
    }

    #[tokio::test]
    async fn test_value_change_emits_event_with_raw_bytes() {
        let mock = mock_with_characteristic();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut monitor = start(&mock, tx).await;

        let event = monitor.on_changes(&[PropertyChange::Value(vec![1, 2, 3])]);

        assert_eq!(
            event,
            Some(BleEvent::ValueChanged {
                device: "/hci0/dev1".into(),
                characteristic: CHR.into(),
                handler: HandlerId(0),
                value: vec![1, 2, 3],
            })
        );
        assert_eq!(monitor.last_value(), Some(&[1u8, 2, 3][..]));
        monitor.stop(&mock, &policy()).await;
    }

    #[tokio::test]
    async fn test_changes_without_value_are_ignored() {
        let mock = mock_with_characteristic();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut monitor = start(&mock, tx).await;

        assert!(monitor
            .on_changes(&[PropertyChange::Connected(true)])
            .is_none());
        monitor.stop(&mock, &policy()).await;
    }

    #[tokio::test]
    async fn test_stop_releases_subscription_and_stops_notify() {
        let mock = mock_with_characteristic();
        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor = start(&mock, tx).await;
        mock.clear_calls();

        monitor.stop(&mock, &policy()).await;

        assert_eq!(
            mock.calls(),
            vec![
                MockCall::Unsubscribe(crate::infrastructure::bluetooth::SubscriptionTarget::Properties(
                    CHR.into()
                )),
                MockCall::StopNotify(CHR.into())
            ]
        );
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_read_and_write_go_through_the_service() {
        let mock = mock_with_characteristic();
        mock.notify(&CHR.into(), vec![9]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut monitor = start(&mock, tx).await;

        let value = monitor.read_value(&mock, &policy()).await.unwrap();
        monitor.write_value(&mock, &policy(), &[4, 5]).await.unwrap();

        assert_eq!(value, vec![9]);
        assert!(mock
            .calls()
            .contains(&MockCall::WriteValue(CHR.into(), vec![4, 5])));
        monitor.stop(&mock, &policy()).await;
    }
}
