//! OBD-II over BLE Error Types

use thiserror::Error;

/// Errors that can occur while talking to an ELM327 adapter over BLE
#[derive(Debug, Error)]
pub enum ObdError {
    /// GATT service or characteristic discovery failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Writing to the write characteristic failed
    #[error("Write error: {0}")]
    Write(String),

    /// The notification stream failed or ended while reading
    #[error("Read error: {0}")]
    Read(String),

    /// Timeout waiting for a delimiter
    #[error("Timeout waiting for adapter response after {0}ms")]
    Timeout(u64),

    /// Unexpected acknowledgment from the adapter during bring-up
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation requires an established adapter connection
    #[error("Adapter is not connected")]
    NotConnected,

    /// Failure reported by the underlying BLE stack
    #[error("BLE link error: {0}")]
    Link(#[from] LinkError),
}

impl ObdError {
    /// Whether this error leaves the connection unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ObdError::Write(_) | ObdError::Read(_) | ObdError::Link(_) | ObdError::NotConnected
        )
    }
}

/// Error raised by a [`GattLink`](crate::GattLink) implementation
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct LinkError(pub String);

impl From<btleplug::Error> for LinkError {
    fn from(err: btleplug::Error) -> Self {
        LinkError(err.to_string())
    }
}

/// A descriptor's decode function could not interpret the payload
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// Payload shorter than the decoder needs
    #[error("payload too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },

    /// No message carried data
    #[error("no message data")]
    Empty,

    /// Payload bytes are not meaningful for this command
    #[error("invalid payload: {0}")]
    Invalid(String),
}
