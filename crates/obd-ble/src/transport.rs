//! BLE GATT Serial Transport
//!
//! Makes a notify/write characteristic pair look like a UART: notifications
//! arrive on a channel in arbitrary-sized chunks and are accumulated in a
//! receive buffer that reads consume from the front.

use crate::error::{LinkError, ObdError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Chunks of notification payload delivered by a [`GattLink`]
pub type NotificationReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// The BLE platform operations the transport depends on
#[async_trait]
pub trait GattLink: Send {
    /// Establish the BLE connection
    async fn connect(&mut self) -> Result<(), LinkError>;

    /// UUIDs of the characteristics exposed by `service`, empty if the service is absent
    async fn characteristics(&mut self, service: Uuid) -> Result<Vec<Uuid>, LinkError>;

    /// Enable notifications on `characteristic`
    ///
    /// The returned channel closes when the link disconnects.
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<NotificationReceiver, LinkError>;

    /// Disable notifications on `characteristic`
    async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<(), LinkError>;

    /// Write `data` to `characteristic`
    async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), LinkError>;

    /// Tear down the BLE connection
    async fn disconnect(&mut self) -> Result<(), LinkError>;
}

/// Service and characteristic UUIDs of one adapter family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    /// Service holding both characteristics
    pub service: Uuid,
    /// Characteristic the adapter notifies on
    pub read: Uuid,
    /// Characteristic commands are written to
    pub write: Uuid,
}

impl GattProfile {
    /// Generic 0xFFE0 service (LeLink, OBDBLE)
    pub const GENERIC: GattProfile = GattProfile {
        service: Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb),
        read: Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb),
        write: Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb),
    };

    /// Veepeak / Vgate 0xFFF0 service
    pub const VEEPEAK: GattProfile = GattProfile {
        service: Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb),
        read: Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb),
        write: Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb),
    };

    /// Nordic UART Service
    pub const NORDIC_UART: GattProfile = GattProfile {
        service: Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e),
        read: Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e),
        write: Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e),
    };

    /// Build a profile from textual UUIDs (any letter case)
    pub fn parse(service: &str, read: &str, write: &str) -> Result<Self, ObdError> {
        let parse = |s: &str| {
            Uuid::parse_str(s).map_err(|e| ObdError::Connection(format!("bad UUID {}: {}", s, e)))
        };
        Ok(Self {
            service: parse(service)?,
            read: parse(read)?,
            write: parse(write)?,
        })
    }

    /// Pick the profile matching a device's advertised services
    pub fn for_advertised(services: &[Uuid]) -> Self {
        if services.contains(&Self::NORDIC_UART.service) {
            Self::NORDIC_UART
        } else if services.contains(&Self::VEEPEAK.service) {
            Self::VEEPEAK
        } else {
            Self::GENERIC
        }
    }
}

impl Default for GattProfile {
    fn default() -> Self {
        Self::GENERIC
    }
}

/// Serial-like byte stream over a GATT characteristic pair
pub struct BleSerial<L: GattLink> {
    link: L,
    profile: GattProfile,
    rx: Option<NotificationReceiver>,
    buffer: Vec<u8>,
}

impl<L: GattLink> BleSerial<L> {
    /// Wrap a link; nothing happens on the air until [`open`](Self::open)
    pub fn new(link: L, profile: GattProfile) -> Self {
        Self {
            link,
            profile,
            rx: None,
            buffer: Vec::new(),
        }
    }

    /// Connect, locate the characteristics and start notifications
    pub async fn open(&mut self) -> Result<(), ObdError> {
        if self.is_open() {
            return Ok(());
        }

        debug!("Connecting to GATT service {}", self.profile.service);
        self.link
            .connect()
            .await
            .map_err(|e| ObdError::Connection(e.to_string()))?;

        match self.subscribe().await {
            Ok(rx) => {
                self.rx = Some(rx);
                self.buffer.clear();
                debug!("Notifications started on {}", self.profile.read);
                Ok(())
            }
            Err(e) => {
                error!("Failed to connect or start notifications: {}", e);
                if let Err(e) = self.link.disconnect().await {
                    warn!("Disconnect after failed open also failed: {}", e);
                }
                Err(e)
            }
        }
    }

    async fn subscribe(&mut self) -> Result<NotificationReceiver, ObdError> {
        let available = self
            .link
            .characteristics(self.profile.service)
            .await
            .map_err(|e| ObdError::Connection(e.to_string()))?;

        if !available.contains(&self.profile.read) || !available.contains(&self.profile.write) {
            return Err(ObdError::Connection(
                "Unable to locate GATT characteristics".to_string(),
            ));
        }

        self.link
            .subscribe(self.profile.read)
            .await
            .map_err(|e| ObdError::Connection(e.to_string()))
    }

    /// Whether notifications are flowing
    pub fn is_open(&self) -> bool {
        self.rx.is_some()
    }

    /// GATT profile this transport talks to
    pub fn profile(&self) -> &GattProfile {
        &self.profile
    }

    /// Number of received bytes not yet consumed
    pub fn in_waiting(&mut self) -> usize {
        self.drain_pending();
        self.buffer.len()
    }

    /// Discard everything received so far
    pub fn reset_input_buffer(&mut self) {
        self.drain_pending();
        if !self.buffer.is_empty() {
            debug!("Discarding {} buffered bytes", self.buffer.len());
        }
        self.buffer.clear();
    }

    /// Send `data` verbatim; a failure closes the transport
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ObdError> {
        if !self.is_open() {
            return Err(ObdError::NotConnected);
        }

        debug!("write: {:?}", String::from_utf8_lossy(data));
        if let Err(e) = self.link.write(self.profile.write, data).await {
            error!("Failed to write data: {}", e);
            self.close().await;
            return Err(ObdError::Write(e.to_string()));
        }
        Ok(())
    }

    /// Wait for at least `size` bytes and return exactly that many
    pub async fn read(&mut self, size: usize) -> Result<Vec<u8>, ObdError> {
        while self.buffer.len() < size {
            self.receive().await?;
        }
        Ok(self.buffer.drain(..size).collect())
    }

    /// Wait until `delimiter` is buffered and return everything up to and including it
    ///
    /// On timeout the bytes received so far stay buffered.
    pub async fn read_until(
        &mut self,
        delimiter: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ObdError> {
        let wait = async {
            loop {
                if let Some(end) = find(&self.buffer, delimiter) {
                    return Ok::<usize, ObdError>(end + delimiter.len());
                }
                self.receive().await?;
            }
        };

        let outcome = tokio::time::timeout(timeout, wait).await;
        match outcome {
            Ok(end) => Ok(self.buffer.drain(..end?).collect()),
            Err(_) => Err(ObdError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Stop notifications and disconnect; safe to call repeatedly
    pub async fn close(&mut self) {
        if self.rx.take().is_none() {
            debug!("Transport already closed");
            return;
        }
        self.buffer.clear();

        if let Err(e) = self.link.unsubscribe(self.profile.read).await {
            warn!("Failed to stop notifications: {}", e);
        }
        if let Err(e) = self.link.disconnect().await {
            warn!("Failed to disconnect: {}", e);
        }
        debug!("Transport closed");
    }

    /// Pull one chunk from the notification channel, suspending until it arrives
    async fn receive(&mut self) -> Result<(), ObdError> {
        let rx = self.rx.as_mut().ok_or(ObdError::NotConnected)?;
        match rx.recv().await {
            Some(chunk) => {
                debug!("Notification received: {} bytes", chunk.len());
                self.buffer.extend_from_slice(&chunk);
                Ok(())
            }
            None => Err(ObdError::Read("notification stream closed".to_string())),
        }
    }

    /// Move already delivered chunks into the buffer without waiting
    fn drain_pending(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            while let Ok(chunk) = rx.try_recv() {
                self.buffer.extend_from_slice(&chunk);
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
