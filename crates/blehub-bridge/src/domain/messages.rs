//! JSON message types for the browser-facing WebSocket protocol.
//!
//! Every message is a JSON object whose `"type"` field names the variant; the
//! remaining fields sit in the same object:
//!
//! ```json
//! {"type":"new_device","dev_addr":"AA:BB:CC:DD:EE:FF"}
//! {"type":"value_update","dev_addr":"AA:BB:CC:DD:EE:FF","value":42}
//! {"type":"conn_device","dev_addr":"AA:BB:CC:DD:EE:FF"}
//! ```
//!
//! The two directions are separate enums so that sending a client-only
//! message to the client is a compile-time error.

use blehub_core::DecodedValue;
use serde::{Deserialize, Serialize};

// ── Client → Hub messages ─────────────────────────────────────────────────────

/// Commands the browser sends to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToHubMsg {
    /// Connect to the announced device with this address.
    ConnDevice { dev_addr: String },
    /// Disconnect from the device with this address.
    DiscDevice { dev_addr: String },
}

// ── Hub → Client messages ─────────────────────────────────────────────────────

/// Events the bridge sends to the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubToClientMsg {
    /// A device advertising a service of interest was discovered.
    NewDevice { dev_addr: String },
    /// A previously announced device went away.
    RemDevice { dev_addr: String },
    /// A forwarded characteristic produced a value.
    ValueUpdate {
        dev_addr: String,
        value: DecodedValue,
    },
}

impl HubToClientMsg {
    /// Serializes the message as a single-line JSON object.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_device_serializes_with_type_tag() {
        let msg = HubToClientMsg::NewDevice {
            dev_addr: "AA:BB:CC:DD:EE:FF".into(),
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"new_device","dev_addr":"AA:BB:CC:DD:EE:FF"}"#
        );
    }

    #[test]
    fn test_rem_device_serializes_with_type_tag() {
        let msg = HubToClientMsg::RemDevice {
            dev_addr: "11:22:33:44:55:66".into(),
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"rem_device","dev_addr":"11:22:33:44:55:66"}"#
        );
    }

    #[test]
    fn test_value_update_value_is_bare_number() {
        let msg = HubToClientMsg::ValueUpdate {
            dev_addr: "AA:BB:CC:DD:EE:FF".into(),
            value: DecodedValue::Integer(42),
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"value_update","dev_addr":"AA:BB:CC:DD:EE:FF","value":42}"#
        );
    }

    #[test]
    fn test_conn_device_parses() {
        let msg: ClientToHubMsg =
            serde_json::from_str(r#"{"type":"conn_device","dev_addr":"AA:BB:CC:DD:EE:FF"}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientToHubMsg::ConnDevice {
                dev_addr: "AA:BB:CC:DD:EE:FF".into()
            }
        );
    }

    #[test]
    fn test_disc_device_parses() {
        let msg: ClientToHubMsg =
            serde_json::from_str(r#"{"dev_addr":"AA","type":"disc_device"}"#).unwrap();
        assert_eq!(msg, ClientToHubMsg::DiscDevice { dev_addr: "AA".into() });
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result: Result<ClientToHubMsg, _> =
            serde_json::from_str(r#"{"type":"reboot","dev_addr":"AA"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_address_is_rejected() {
        let result: Result<ClientToHubMsg, _> = serde_json::from_str(r#"{"type":"conn_device"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_value_update_parses_back() {
        let msg: HubToClientMsg =
            serde_json::from_str(r#"{"type":"value_update","dev_addr":"AA","value":-3}"#)
                .unwrap();
        assert_eq!(
            msg,
            HubToClientMsg::ValueUpdate {
                dev_addr: "AA".into(),
                value: DecodedValue::Integer(-3)
            }
        );
    }
}
