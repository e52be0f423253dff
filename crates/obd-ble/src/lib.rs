//! OBD-II over Bluetooth Low Energy
//!
//! This crate drives ELM327-compatible adapters that expose a GATT
//! notify/write characteristic pair instead of a serial port. It supports
//! ISO 15765-4 (CAN) with ISO-TP multi-frame reassembly.
//!
//! Layers, bottom up:
//! - [`BleSerial`] turns GATT notifications into a buffered byte stream
//! - [`CanProtocol`] reassembles adapter lines into [`Message`]s
//! - [`CommandDescriptor`] normalizes and decodes messages
//! - [`Elm327`] runs bring-up and command transactions
//! - [`Obd`] adds header management on top

pub mod ble;
mod catalog;
mod command;
pub mod decoders;
mod elm327;
mod error;
mod frame;
mod obd;
mod protocol;
mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use catalog::{Catalog, FUNCTIONAL_HEADER, LBC_HEADER};
pub use command::{CommandDescriptor, Decoder, LengthAdjustment, ObdValue, Response};
pub use elm327::{ConnectionState, Elm327, ElmConfig};
pub use error::{DecodeError, LinkError, ObdError};
pub use frame::{CanProtocol, Frame, Message, Pci, Reassembly};
pub use obd::Obd;
pub use protocol::{AddressingMode, ObdProtocol};
pub use transport::{BleSerial, GattLink, GattProfile, NotificationReceiver};
