//! Adaptive Polling of an OBD-II BLE Adapter
//!
//! Polls quickly while the car answers, slowly while the adapter is in
//! range but the car is off, and very slowly while the adapter is gone.

mod config;
mod error;
mod presence;
mod scheduler;
mod source;

pub use config::{DeviceFilter, PollerConfig};
pub use error::PollerError;
pub use presence::{on_advertisement, track_advertisements, Presence};
pub use scheduler::{IntervalPolicy, PollOutcome, Poller, ReadingSource, Readings};
pub use source::{collect_readings, discover, BleSource};

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize logging
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}
