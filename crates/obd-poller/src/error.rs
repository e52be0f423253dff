//! Poller Error Types

use obd_ble::ObdError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PollerError {
    #[error("Unable to fetch data: {0}")]
    Fetch(#[from] ObdError),

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl From<btleplug::Error> for PollerError {
    fn from(e: btleplug::Error) -> Self {
        PollerError::Bluetooth(e.to_string())
    }
}
