//! btleplug GATT Link
//!
//! Implements [`GattLink`] for a btleplug peripheral. Notifications for the
//! subscribed characteristic are forwarded from btleplug's stream into the
//! transport's channel by a small pump task.

use crate::elm327::ElmConfig;
use crate::error::{LinkError, ObdError};
use crate::obd::Obd;
use crate::transport::{GattLink, GattProfile, NotificationReceiver};
use async_trait::async_trait;
use btleplug::api::{CharPropFlags, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Default time allowed for the BLE connection to come up
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`GattLink`] over a btleplug peripheral
pub struct BtleLink {
    peripheral: Peripheral,
    characteristics: Vec<Characteristic>,
    pump: Option<JoinHandle<()>>,
    connect_timeout: Duration,
}

impl BtleLink {
    /// Wrap a discovered peripheral; nothing is connected yet
    pub fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            characteristics: Vec::new(),
            pump: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Time allowed for the BLE connection to come up
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, LinkError> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| LinkError(format!("characteristic {} not discovered", uuid)))
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[async_trait]
impl GattLink for BtleLink {
    async fn connect(&mut self) -> Result<(), LinkError> {
        if self.peripheral.is_connected().await? {
            return Ok(());
        }
        debug!("Connecting to device: {}", self.peripheral.address());
        tokio::time::timeout(self.connect_timeout, self.peripheral.connect())
            .await
            .map_err(|_| LinkError(format!("connect timed out after {:?}", self.connect_timeout)))??;
        debug!("Connected to device: {}", self.peripheral.address());
        Ok(())
    }

    async fn characteristics(&mut self, service: Uuid) -> Result<Vec<Uuid>, LinkError> {
        self.peripheral.discover_services().await?;
        self.characteristics = self
            .peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics)
            .collect();
        Ok(self.characteristics.iter().map(|c| c.uuid).collect())
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<NotificationReceiver, LinkError> {
        let target = self.characteristic(characteristic)?.clone();
        self.peripheral.subscribe(&target).await?;
        let mut notifications = self.peripheral.notifications().await?;

        self.stop_pump();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pump = Some(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == characteristic && tx.send(notification.value).is_err() {
                    break;
                }
            }
            debug!("Notification stream for {} ended", characteristic);
        }));
        Ok(rx)
    }

    async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<(), LinkError> {
        self.stop_pump();
        let target = self.characteristic(characteristic)?.clone();
        self.peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), LinkError> {
        let target = self.characteristic(characteristic)?;
        let write_type = if target
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        self.peripheral.write(target, data, write_type).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.stop_pump();
        if self.peripheral.is_connected().await? {
            debug!("Disconnecting from device");
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

impl Drop for BtleLink {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

/// Connect to an adapter found by discovery
///
/// The GATT profile is chosen from the advertised services and the CAN
/// variant from `config.protocol`.
pub async fn connect(
    peripheral: Peripheral,
    connect_timeout: Duration,
    config: ElmConfig,
    fast: bool,
) -> Result<Obd<BtleLink>, ObdError> {
    let services = peripheral
        .properties()
        .await
        .map_err(LinkError::from)?
        .map(|p| p.services)
        .unwrap_or_default();
    let profile = GattProfile::for_advertised(&services);
    info!(
        "Using GATT service {} for {}",
        profile.service,
        peripheral.address()
    );

    let link = BtleLink::new(peripheral).with_connect_timeout(connect_timeout);
    Obd::connect(link, profile, config, fast).await
}
