//! Payload decoders: turn the raw bytes of a characteristic notification into
//! the number forwarded to the browser.
//!
//! Each forwarded characteristic names a decoder.  New payload formats are
//! added by implementing [`PayloadDecoder`] and registering a name in
//! [`decoder_by_name`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by a [`PayloadDecoder`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("wrong payload length: expected {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

/// A decoded characteristic value.
///
/// Serialized untagged so it lands in JSON as a bare number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Integer(i64),
}

/// Converts a notification payload into a value.
#[cfg_attr(test, mockall::automock)]
pub trait PayloadDecoder: Send + Sync {
    /// Name used in configuration files.
    fn name(&self) -> &'static str;

    fn decode(&self, payload: &[u8]) -> Result<DecodedValue, DecodeError>;
}

/// Packet sent on the Nordic UART TX characteristic.
///
/// Layout, all little-endian:
///
/// | Offset | Size | Field  |
/// |--------|------|--------|
/// | 0      | 4    | magic  |
/// | 4      | 4    | length |
/// | 8      | 4    | value (signed) |
///
/// Only `value` is forwarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct UartPacketDecoder;

impl UartPacketDecoder {
    pub const NAME: &'static str = "uart_packet";
    pub const PACKET_LEN: usize = 12;
}

impl PayloadDecoder for UartPacketDecoder {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn decode(&self, payload: &[u8]) -> Result<DecodedValue, DecodeError> {
        if payload.len() != Self::PACKET_LEN {
            return Err(DecodeError::WrongLength {
                expected: Self::PACKET_LEN,
                actual: payload.len(),
            });
        }
        let value = i32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]);
        Ok(DecodedValue::Integer(i64::from(value)))
    }
}

/// Standard Battery Level characteristic (0x2A19): one unsigned byte, percent.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatteryLevelDecoder;

impl BatteryLevelDecoder {
    pub const NAME: &'static str = "battery_level";
}

impl PayloadDecoder for BatteryLevelDecoder {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn decode(&self, payload: &[u8]) -> Result<DecodedValue, DecodeError> {
        match payload {
            [level] => Ok(DecodedValue::Integer(i64::from(*level))),
            _ => Err(DecodeError::WrongLength {
                expected: 1,
                actual: payload.len(),
            }),
        }
    }
}

/// Looks up a built-in decoder by its configuration name.
pub fn decoder_by_name(name: &str) -> Option<Arc<dyn PayloadDecoder>> {
    match name {
        UartPacketDecoder::NAME => Some(Arc::new(UartPacketDecoder)),
        BatteryLevelDecoder::NAME => Some(Arc::new(BatteryLevelDecoder)),
        _ => None,
    }
}
