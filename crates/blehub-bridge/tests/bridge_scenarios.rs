//! End-to-end bridge scenarios against the in-memory Bluetooth service.
//!
//! The first test drives a full WebSocket session over an in-memory duplex
//! stream, exactly as a browser would.  The others drive [`Bridge`] directly
//! and check what would be sent to the browser.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use blehub_bridge::application::{Bridge, BridgeError, ManagerError};
use blehub_bridge::domain::{BridgeConfig, HubToClientMsg};
use blehub_bridge::infrastructure::bluetooth::mock::{
    MockBluetoothService, MockCall, MockOp, Scripted,
};
use blehub_bridge::infrastructure::bluetooth::{BluetoothError, SubscriptionTarget};
use blehub_bridge::infrastructure::ws_server::serve_connection;
use blehub_core::domain::interest::{NORDIC_UART_SERVICE, NORDIC_UART_TX};
use blehub_core::domain::DeviceProperties;
use blehub_core::protocol::{decode_frame, encode_masked_frame, FrameError, Opcode};
use blehub_core::{BusSignal, ManagedObject, ObjectPath};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

const ADAPTER: &str = "/org/bluez/hci0";
const DEV: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";
const SVC: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c";
const CHR: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c/char000d";

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn device(path: &str, address: &str, uuids: Vec<Uuid>) -> ManagedObject {
    ManagedObject::device(
        path,
        DeviceProperties {
            address: address.into(),
            alias: "UART sensor".into(),
            uuids,
            ..Default::default()
        },
    )
}

/// Adapter plus one Nordic UART peripheral with its GATT tree.
fn uart_peripheral() -> MockBluetoothService {
    let mock = MockBluetoothService::new();
    mock.insert_object(ManagedObject::adapter(ADAPTER, "00:11:22:33:44:55"));
    mock.insert_object(device(DEV, "AA:BB:CC:DD:EE:FF", vec![NORDIC_UART_SERVICE]));
    mock.insert_object(ManagedObject::gatt_service(SVC, NORDIC_UART_SERVICE, DEV.into()));
    mock.insert_object(ManagedObject::gatt_characteristic(CHR, NORDIC_UART_TX, SVC.into()));
    mock
}

/// `{magic, length = 4, value}`, little-endian.
fn uart_packet(value: i32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(12);
    bytes.extend_from_slice(&0xCAFE_F00Du32.to_le_bytes());
    bytes.extend_from_slice(&4u32.to_le_bytes());
    bytes.extend_from_slice(&value.to_le_bytes());
    bytes
}

async fn drain(
    bridge: &mut Bridge<MockBluetoothService>,
    signals: &mut UnboundedReceiver<BusSignal>,
) -> Vec<HubToClientMsg> {
    let mut out = Vec::new();
    while let Ok(signal) = signals.try_recv() {
        out.extend(bridge.on_signal(signal).await);
    }
    out
}

// ── Over the wire ─────────────────────────────────────────────────────────────

/// Reads the next text frame payload from the server side of the duplex.
async fn next_text<R: tokio::io::AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> String {
    loop {
        match decode_frame(buf, 1 << 16) {
            Ok((frame, consumed)) => {
                buf.drain(..consumed);
                assert_eq!(frame.opcode, Opcode::Text);
                return String::from_utf8(frame.payload).unwrap();
            }
            Err(FrameError::InsufficientData { .. }) => {}
            Err(e) => panic!("bad frame from server: {e}"),
        }
        let mut chunk = [0u8; 1024];
        let n = reader.read(&mut chunk).await.unwrap();
        assert!(n > 0, "server closed before sending a text frame");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn test_conn_device_forwards_decoded_value_over_websocket() {
    // Arrange
    let mock = uart_peripheral();
    let (client_io, server_io) = tokio::io::duplex(8192);
    let running = AtomicBool::new(true);
    let config = BridgeConfig::default();
    let key = [0x11, 0x22, 0x33, 0x44];

    let server = serve_connection(server_io, "browser", &config, Arc::new(mock.clone()), &running);
    let browser = async {
        let (read, mut write) = tokio::io::split(client_io);
        let mut read = BufReader::new(read);

        write
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Host: localhost:8080\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  \r\n",
            )
            .await
            .unwrap();
        let mut status = String::new();
        read.read_line(&mut status).await.unwrap();
        let mut line = String::new();
        while line != "\r\n" {
            line.clear();
            read.read_line(&mut line).await.unwrap();
        }

        let mut buf = Vec::new();
        let announced = next_text(&mut read, &mut buf).await;

        // Act
        let cmd = br#"{"type":"conn_device","dev_addr":"AA:BB:CC:DD:EE:FF"}"#;
        write
            .write_all(&encode_masked_frame(Opcode::Text, cmd, key))
            .await
            .unwrap();

        // The server is idle once the monitor is armed.
        let chr = ObjectPath::from(CHR);
        for _ in 0..200 {
            if mock.has_property_subscription(&chr) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        mock.notify(&chr, uart_packet(42));
        let update = next_text(&mut read, &mut buf).await;

        write
            .write_all(&encode_masked_frame(Opcode::Close, &[], key))
            .await
            .unwrap();
        // Hold the stream open until the server has echoed the close.
        let mut rest = Vec::new();
        read.read_to_end(&mut rest).await.unwrap();
        (status, announced, update)
    };
    let (served, (status, announced, update)) = tokio::join!(server, browser);

    // Assert
    served.unwrap();
    assert_eq!(status, "HTTP/1.1 101 Switching Protocols\r\n");
    assert_eq!(
        announced,
        r#"{"type":"new_device","dev_addr":"AA:BB:CC:DD:EE:FF"}"#
    );
    assert_eq!(
        update,
        r#"{"type":"value_update","dev_addr":"AA:BB:CC:DD:EE:FF","value":42}"#
    );
    assert_eq!(mock.active_subscriptions(), 0);
}

// ── Discovery and removal ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_non_matching_device_never_announced() {
    // Arrange
    let mock = MockBluetoothService::new();
    let (mut bridge, mut signals) = Bridge::new(Arc::new(mock.clone()), &BridgeConfig::default());
    bridge.start().await.unwrap();

    // Act
    mock.add_object(device(
        "/org/bluez/hci0/dev_11_22_33_44_55_66",
        "11:22:33:44:55:66",
        vec![Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb)],
    ));
    mock.remove_object(&"/org/bluez/hci0/dev_11_22_33_44_55_66".into());
    let out = drain(&mut bridge, &mut signals).await;

    // Assert
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_matching_device_announced_once_and_withdrawn_once() {
    // Arrange
    let mock = MockBluetoothService::new();
    let (mut bridge, mut signals) = Bridge::new(Arc::new(mock.clone()), &BridgeConfig::default());
    bridge.start().await.unwrap();
    let dev = device(DEV, "AA:BB:CC:DD:EE:FF", vec![NORDIC_UART_SERVICE]);

    // Act: discovered, re-announced by the daemon, then removed
    mock.add_object(dev.clone());
    mock.add_object(dev);
    mock.remove_object(&DEV.into());
    let out = drain(&mut bridge, &mut signals).await;

    // Assert
    assert_eq!(
        out,
        vec![
            HubToClientMsg::NewDevice {
                dev_addr: "AA:BB:CC:DD:EE:FF".into()
            },
            HubToClientMsg::RemDevice {
                dev_addr: "AA:BB:CC:DD:EE:FF".into()
            },
        ]
    );
}

#[tokio::test]
async fn test_removal_releases_monitor_before_withdrawal() {
    // Arrange
    let mock = uart_peripheral();
    let (mut bridge, mut signals) = Bridge::new(Arc::new(mock.clone()), &BridgeConfig::default());
    bridge.start().await.unwrap();
    bridge
        .on_client_text(r#"{"type":"conn_device","dev_addr":"AA:BB:CC:DD:EE:FF"}"#)
        .await
        .unwrap();
    assert!(bridge.manager().is_watched(&CHR.into()));

    // Act
    mock.remove_object(&DEV.into());
    let out = drain(&mut bridge, &mut signals).await;

    // Assert
    assert_eq!(
        out,
        vec![HubToClientMsg::RemDevice {
            dev_addr: "AA:BB:CC:DD:EE:FF".into()
        }]
    );
    assert!(!bridge.manager().is_watched(&CHR.into()));
    assert!(mock
        .calls()
        .contains(&MockCall::Unsubscribe(SubscriptionTarget::Properties(CHR.into()))));
    assert_eq!(bridge.registry().count(), 0);

    // A late notification for the removed characteristic goes nowhere.
    mock.notify(&CHR.into(), uart_packet(7));
    assert!(drain(&mut bridge, &mut signals).await.is_empty());
    bridge.shutdown().await;
}

// ── Connection lifecycle ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_late_resolution_still_arms_monitor() {
    // Arrange: services resolve only after Connect returns
    let mock = uart_peripheral();
    mock.set_keep_services_unresolved(true);
    let (mut bridge, mut signals) = Bridge::new(Arc::new(mock.clone()), &BridgeConfig::default());
    bridge.start().await.unwrap();
    bridge
        .on_client_text(r#"{"type":"conn_device","dev_addr":"AA:BB:CC:DD:EE:FF"}"#)
        .await
        .unwrap();
    assert!(!bridge.manager().is_watched(&CHR.into()));

    // Act
    mock.resolve_services(&DEV.into());
    drain(&mut bridge, &mut signals).await;
    mock.notify(&CHR.into(), uart_packet(-5));
    let out = drain(&mut bridge, &mut signals).await;

    // Assert
    assert_eq!(
        out,
        vec![HubToClientMsg::ValueUpdate {
            dev_addr: "AA:BB:CC:DD:EE:FF".into(),
            value: blehub_core::DecodedValue::Integer(-5),
        }]
    );
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_then_reconnect_rearms_monitor() {
    // Arrange
    let mock = uart_peripheral();
    let (mut bridge, mut signals) = Bridge::new(Arc::new(mock.clone()), &BridgeConfig::default());
    bridge.start().await.unwrap();
    let conn = r#"{"type":"conn_device","dev_addr":"AA:BB:CC:DD:EE:FF"}"#;
    let disc = r#"{"type":"disc_device","dev_addr":"AA:BB:CC:DD:EE:FF"}"#;

    // Act
    bridge.on_client_text(conn).await.unwrap();
    bridge.on_client_text(disc).await.unwrap();
    let watched_after_disc = bridge.manager().is_watched(&CHR.into());
    drain(&mut bridge, &mut signals).await;
    bridge.on_client_text(conn).await.unwrap();
    mock.notify(&CHR.into(), uart_packet(1));
    let out = drain(&mut bridge, &mut signals).await;

    // Assert
    assert!(!watched_after_disc);
    let updates = out
        .iter()
        .filter(|m| matches!(m, HubToClientMsg::ValueUpdate { .. }))
        .count();
    assert_eq!(updates, 1);
    let start_notifies = mock
        .calls()
        .into_iter()
        .filter(|c| matches!(c, MockCall::StartNotify(_)))
        .count();
    assert!(start_notifies >= 2);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_notify_refusal_rejects_conn_device_and_frees_the_device() {
    // Arrange
    let mock = uart_peripheral();
    mock.script(
        MockOp::StartNotify,
        CHR,
        Scripted::Fail(BluetoothError::Failed("not permitted".into())),
    );
    let (mut bridge, mut signals) = Bridge::new(Arc::new(mock.clone()), &BridgeConfig::default());
    bridge.start().await.unwrap();
    let conn = r#"{"type":"conn_device","dev_addr":"AA:BB:CC:DD:EE:FF"}"#;

    // Act
    let refused = bridge.on_client_text(conn).await;
    drain(&mut bridge, &mut signals).await;

    // Assert
    assert!(matches!(
        refused,
        Err(BridgeError::Manager(ManagerError::Call { .. }))
    ));
    assert!(bridge.manager().session(&DEV.into()).is_none());
    assert!(mock.calls().contains(&MockCall::Disconnect(DEV.into())));

    // The next request goes through and values flow.
    bridge.on_client_text(conn).await.unwrap();
    mock.notify(&CHR.into(), uart_packet(42));
    let out = drain(&mut bridge, &mut signals).await;
    assert_eq!(
        out,
        vec![HubToClientMsg::ValueUpdate {
            dev_addr: "AA:BB:CC:DD:EE:FF".into(),
            value: blehub_core::DecodedValue::Integer(42),
        }]
    );
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_failed_resolution_signal_frees_the_device() {
    // Arrange
    let mock = uart_peripheral();
    mock.set_keep_services_unresolved(true);
    let (mut bridge, mut signals) = Bridge::new(Arc::new(mock.clone()), &BridgeConfig::default());
    bridge.start().await.unwrap();
    let conn = r#"{"type":"conn_device","dev_addr":"AA:BB:CC:DD:EE:FF"}"#;
    bridge.on_client_text(conn).await.unwrap();

    // Act: enumeration fails when the resolution signal arrives
    mock.set_unavailable(true);
    mock.resolve_services(&DEV.into());
    let out = drain(&mut bridge, &mut signals).await;

    // Assert
    assert!(out.is_empty());
    assert!(bridge.manager().session(&DEV.into()).is_none());
    assert!(mock.calls().contains(&MockCall::Disconnect(DEV.into())));

    mock.set_unavailable(false);
    mock.set_keep_services_unresolved(false);
    bridge.on_client_text(conn).await.unwrap();
    assert!(bridge.manager().is_watched(&CHR.into()));
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_every_subscription() {
    let mock = uart_peripheral();
    let (mut bridge, _signals) = Bridge::new(Arc::new(mock.clone()), &BridgeConfig::default());
    bridge.start().await.unwrap();
    bridge
        .on_client_text(r#"{"type":"conn_device","dev_addr":"AA:BB:CC:DD:EE:FF"}"#)
        .await
        .unwrap();
    assert!(mock.active_subscriptions() >= 3);

    bridge.shutdown().await;

    assert_eq!(mock.active_subscriptions(), 0);
    assert!(mock.calls().contains(&MockCall::StopDiscovery(ADAPTER.into())));
}
