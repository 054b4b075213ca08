//! Domain layer for blehub-core.
//!
//! Pure types describing the Bluetooth side of the bridge.  Nothing here
//! touches D-Bus, sockets, or an async runtime, so every rule can be tested
//! with plain values.
//!
//! - [`object`] – object paths, interface property sets, and bus signals.
//! - [`interest`] – which service/characteristic pairs are forwarded.
//! - [`decoder`] – how a forwarded characteristic's bytes become a number.

pub mod decoder;
pub mod interest;
pub mod object;

pub use decoder::{
    decoder_by_name, BatteryLevelDecoder, DecodeError, DecodedValue, PayloadDecoder,
    UartPacketDecoder,
};
pub use interest::{HandlerId, InterestEntry, InterestTable};
pub use object::{
    AdapterProperties, BusSignal, CharacteristicProperties, DeviceProperties, InterfaceKind,
    Interfaces, ManagedObject, ObjectPath, PropertyChange, ServiceProperties,
};
