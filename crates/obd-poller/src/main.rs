//! OBD BLE Poller - Main Entry Point
//!
//! Usage: `obd-poller [CONFIG]` where CONFIG defaults to `obd-ble` (any
//! supported extension, e.g. `obd-ble.toml`).

use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use obd_poller::{
    discover, init_logging, track_advertisements, BleSource, DeviceFilter, Poller, PollerConfig,
    Presence,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "obd-ble".to_string());
    let config = PollerConfig::load(&path)?;
    init_logging(&config.log_level);

    info!("=== OBD BLE Poller v{} ===", env!("CARGO_PKG_VERSION"));

    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or("no Bluetooth adapter found")?;

    let presence = Presence::new(config.presence_timeout());
    let mut source = BleSource::new(adapter.clone(), &config, presence.clone());
    match discover(&adapter, &config.device, config.scan_timeout()).await? {
        Some(peripheral) => {
            presence.seen();
            source = source.with_peripheral(peripheral);
        }
        None => info!("Polling anyway, the adapter may come into range later"),
    }

    let mut poller = Poller::new(source, config.intervals(), config.cache_values);

    // the scan keeps running so advertisements keep arriving
    let tracker = tokio::spawn(track_and_log(
        adapter.clone(),
        config.device.clone(),
        presence,
        poller.refresh_handle(),
    ));
    let (tx, mut rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
        let _ = stop_tx.send(true);
    });

    let printer = tokio::spawn(async move {
        while let Some(readings) = rx.recv().await {
            match serde_json::to_string(&readings) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to encode readings: {}", e),
            }
        }
    });

    poller.run(tx, stop_rx).await;
    tracker.abort();
    printer.await?;

    Ok(())
}

async fn track_and_log(
    adapter: Adapter,
    filter: DeviceFilter,
    presence: Presence,
    refresh: Arc<Notify>,
) {
    if let Err(e) = track_advertisements(adapter, filter, presence, refresh).await {
        warn!("Advertisement tracking stopped: {}", e);
    }
}
