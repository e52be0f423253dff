//! BLE Reading Source
//!
//! Every poll opens a fresh connection, queries the catalog and closes
//! again, so the adapter is free between polls.

use crate::config::{DeviceFilter, PollerConfig};
use crate::error::PollerError;
use crate::presence::Presence;
use crate::scheduler::{ReadingSource, Readings};
use async_trait::async_trait;
use btleplug::api::{Central, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use obd_ble::{ble, Catalog, ElmConfig, GattLink, Obd, ObdError, ObdValue};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Query every command in `catalog` and collect the decoded values
///
/// Multi-field values are flattened into one reading per field. Commands
/// the car does not answer are left out.
pub async fn collect_readings<L: GattLink>(
    obd: &mut Obd<L>,
    catalog: &Catalog,
) -> Result<Readings, ObdError> {
    let mut readings = Readings::new();
    for cmd in catalog.iter() {
        let response = obd.query(cmd).await?;
        match response.value {
            Some(ObdValue::Fields(fields)) => {
                readings.extend(fields.into_iter().map(|(k, v)| (k, ObdValue::Number(v))));
            }
            Some(value) => {
                readings.insert(cmd.name().to_string(), value);
            }
            None => debug!("No value for {}", cmd.name()),
        }
    }
    Ok(readings)
}

/// Find the first known peripheral matching `filter`
async fn find_peripheral(
    adapter: &Adapter,
    filter: &DeviceFilter,
) -> Result<Option<Peripheral>, btleplug::Error> {
    for peripheral in adapter.peripherals().await? {
        let Some(props) = peripheral.properties().await? else {
            continue;
        };
        if filter.matches(&props.address.to_string(), props.local_name.as_deref()) {
            return Ok(Some(peripheral));
        }
    }
    Ok(None)
}

/// Scan until an adapter matching `filter` shows up or `timeout` passes
pub async fn discover(
    adapter: &Adapter,
    filter: &DeviceFilter,
    timeout: Duration,
) -> Result<Option<Peripheral>, PollerError> {
    info!("Scanning for OBD adapter ({:?})", timeout);
    adapter.start_scan(ScanFilter::default()).await?;

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(peripheral) = find_peripheral(adapter, filter).await? {
            info!("Found OBD adapter: {}", peripheral.address());
            return Ok(Some(peripheral));
        }
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
    }

    warn!("No OBD adapter found");
    Ok(None)
}

/// [`ReadingSource`] backed by a btleplug adapter
///
/// Availability comes from `presence`, which
/// [`track_advertisements`](crate::track_advertisements) keeps current while
/// the scan started by [`discover`] runs.
pub struct BleSource {
    adapter: Adapter,
    presence: Presence,
    filter: DeviceFilter,
    catalog: Catalog,
    elm: ElmConfig,
    connect_timeout: Duration,
    fast: bool,
    peripheral: Option<Peripheral>,
}

impl BleSource {
    /// Source for the adapter matching `config.device`
    pub fn new(adapter: Adapter, config: &PollerConfig, presence: Presence) -> Self {
        Self {
            adapter,
            presence,
            filter: config.device.clone(),
            catalog: config.catalog(),
            elm: config.elm.clone(),
            connect_timeout: config.connect_timeout(),
            fast: config.fast,
            peripheral: None,
        }
    }

    /// Start from an already discovered peripheral
    pub fn with_peripheral(mut self, peripheral: Peripheral) -> Self {
        self.peripheral = Some(peripheral);
        self
    }
}

#[async_trait]
impl ReadingSource for BleSource {
    async fn is_available(&mut self) -> bool {
        if !self.presence.is_present() {
            debug!("No recent advertisement from the OBD adapter");
            return false;
        }
        match find_peripheral(&self.adapter, &self.filter).await {
            Ok(Some(peripheral)) => {
                self.peripheral = Some(peripheral);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Presence check failed: {}", e);
                false
            }
        }
    }

    async fn fetch(&mut self) -> Result<Readings, ObdError> {
        let peripheral = self.peripheral.clone().ok_or(ObdError::NotConnected)?;
        let mut obd =
            ble::connect(peripheral, self.connect_timeout, self.elm.clone(), self.fast).await?;

        let readings = collect_readings(&mut obd, &self.catalog).await;
        obd.close().await;

        let readings = readings?;
        debug!("Fetched {} readings", readings.len());
        Ok(readings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_ble::testing::MockLink;
    use obd_ble::GattProfile;

    fn lbc_reply() -> String {
        let mut payload = vec![0u8; 53];
        payload[0] = 0x61;
        payload[1] = 0x01;
        payload[20..22].copy_from_slice(&36_512u16.to_be_bytes());

        let hex = |b: &[u8]| b.iter().map(|x| format!("{:02X}", x)).collect::<String>();
        let mut lines = vec![format!("7BB1035{}", hex(&payload[..6]))];
        for (i, chunk) in payload[6..].chunks(7).enumerate() {
            lines.push(format!("7BB2{:X}{}", (i + 1) & 0x0F, hex(chunk)));
        }
        lines.join("\r") + "\r\r>"
    }

    async fn connect() -> Obd<MockLink> {
        let reply = lbc_reply();
        let link = MockLink::elm(move |cmd| match cmd {
            "02010D" => Some("7E803410D37\r\r>".to_string()),
            "022101" => Some(reply.clone()),
            _ => None,
        });
        Obd::connect(link, GattProfile::GENERIC, ElmConfig::default(), false)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_skips_unanswered() {
        let mut obd = connect().await;
        let catalog = Catalog::standard().select(&["speed", "rpm"]);

        let readings = collect_readings(&mut obd, &catalog).await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings["speed"], ObdValue::Number(55.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_flattens_fields() {
        let mut obd = connect().await;
        let catalog = Catalog::standard().select(&["lbc"]);

        let readings = collect_readings(&mut obd, &catalog).await.unwrap();
        assert!(!readings.contains_key("lbc"));
        let voltage = readings["hv_battery_voltage"].as_f64().unwrap();
        assert!((voltage - 365.12).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_after_close_fails() {
        let mut obd = connect().await;
        obd.close().await;

        let result = collect_readings(&mut obd, &Catalog::standard()).await;
        assert!(matches!(result, Err(ObdError::NotConnected)));
    }
}
