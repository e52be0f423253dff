//! Adapter Presence
//!
//! btleplug keeps a peripheral in its list long after it stops advertising,
//! so the adapter counts as present only while its last advertisement is
//! recent. An adapter that advertises again after going quiet wakes the
//! poller instead of leaving it in the ultra-slow wait.

use crate::config::DeviceFilter;
use crate::error::PollerError;
use btleplug::api::{Central, CentralEvent, Peripheral as _};
use btleplug::platform::Adapter;
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// When the adapter last advertised, shared between the event task and the
/// reading source
#[derive(Debug, Clone)]
pub struct Presence {
    last_seen: Arc<Mutex<Option<Instant>>>,
    max_age: Duration,
}

impl Presence {
    /// Advertisements older than `max_age` no longer count
    pub fn new(max_age: Duration) -> Self {
        Self {
            last_seen: Arc::new(Mutex::new(None)),
            max_age,
        }
    }

    /// Record an advertisement
    ///
    /// Returns true when the adapter had not been seen recently before.
    pub fn seen(&self) -> bool {
        let mut last_seen = self.lock();
        let was_present = last_seen.is_some_and(|t| t.elapsed() <= self.max_age);
        *last_seen = Some(Instant::now());
        !was_present
    }

    /// Whether the last advertisement is recent enough
    pub fn is_present(&self) -> bool {
        self.lock().is_some_and(|t| t.elapsed() <= self.max_age)
    }

    /// Time of the last advertisement, if any
    pub fn last_seen(&self) -> Option<Instant> {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle one advertisement
///
/// Advertisements from other devices are ignored. When our adapter comes
/// back after being absent, `refresh` is notified so the next poll happens
/// right away. Returns whether the advertisement was ours.
pub fn on_advertisement(
    filter: &DeviceFilter,
    presence: &Presence,
    refresh: &Notify,
    address: &str,
    local_name: Option<&str>,
) -> bool {
    if !filter.matches(address, local_name) {
        return false;
    }
    if presence.seen() {
        info!("OBD adapter {} is advertising again", address);
        refresh.notify_one();
    }
    true
}

/// Follow the adapter's events until the stream ends
///
/// A scan must be running for advertisements to arrive.
pub async fn track_advertisements(
    adapter: Adapter,
    filter: DeviceFilter,
    presence: Presence,
    refresh: Arc<Notify>,
) -> Result<(), PollerError> {
    let mut events = adapter.events().await?;

    while let Some(event) = events.next().await {
        let id = match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => id,
            _ => continue,
        };

        let peripheral = match adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                debug!("Advertising peripheral {:?} not found: {}", id, e);
                continue;
            }
        };
        if let Ok(Some(props)) = peripheral.properties().await {
            on_advertisement(
                &filter,
                &presence,
                &refresh,
                &props.address.to_string(),
                props.local_name.as_deref(),
            );
        }
    }

    warn!("Bluetooth event stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{IntervalPolicy, Poller, ReadingSource, Readings};
    use async_trait::async_trait;
    use obd_ble::{ObdError, ObdValue};

    const MAX_AGE: Duration = Duration::from_secs(180);

    /// Answers while the adapter advertises, like the BLE source
    struct AdvertisingSource {
        presence: Presence,
        fetches: usize,
    }

    #[async_trait]
    impl ReadingSource for AdvertisingSource {
        async fn is_available(&mut self) -> bool {
            self.presence.is_present()
        }

        async fn fetch(&mut self) -> Result<Readings, ObdError> {
            self.fetches += 1;
            Ok(Readings::from([("speed".to_string(), ObdValue::Number(42.0))]))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_expires() {
        let presence = Presence::new(MAX_AGE);
        assert!(!presence.is_present());
        assert!(presence.last_seen().is_none());

        assert!(presence.seen());
        assert!(presence.is_present());
        assert!(!presence.seen());

        tokio::time::advance(MAX_AGE + Duration::from_secs(1)).await;
        assert!(!presence.is_present());
        assert!(presence.seen());
        assert!(presence.is_present());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_our_adapter_counts() {
        let presence = Presence::new(MAX_AGE);
        let refresh = Notify::new();
        let filter = DeviceFilter::default();

        let stranger = "00:11:22:33:44:55";
        assert!(!on_advertisement(&filter, &presence, &refresh, stranger, Some("Headphones")));
        assert!(!presence.is_present());

        let adapter = "AA:BB:CC:DD:EE:FF";
        assert!(on_advertisement(&filter, &presence, &refresh, adapter, Some("OBDBLE")));
        assert!(presence.is_present());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reappearance_requests_refresh() {
        let presence = Presence::new(MAX_AGE);
        let refresh = Notify::new();
        let filter = DeviceFilter::default();

        on_advertisement(&filter, &presence, &refresh, "AA:BB:CC:DD:EE:FF", Some("OBDBLE"));
        refresh.notified().await;

        // repeated advertisements while present do not wake the poller
        on_advertisement(&filter, &presence, &refresh, "AA:BB:CC:DD:EE:FF", Some("OBDBLE"));
        let woke = tokio::time::timeout(Duration::from_secs(1), refresh.notified()).await;
        assert!(woke.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_adapter_slows_polling() {
        let policy = IntervalPolicy::default();
        let presence = Presence::new(MAX_AGE);
        presence.seen();
        let source = AdvertisingSource {
            presence: presence.clone(),
            fetches: 0,
        };
        let mut poller = Poller::new(source, policy, false);

        assert!(!poller.poll_once().await.unwrap().is_empty());
        assert_eq!(poller.interval(), policy.fast);

        tokio::time::advance(MAX_AGE + Duration::from_secs(1)).await;
        assert!(poller.poll_once().await.unwrap().is_empty());
        assert_eq!(poller.interval(), policy.ultra_slow);
        assert_eq!(poller.source().fetches, 1);

        let refresh = poller.refresh_handle();
        on_advertisement(
            &DeviceFilter::default(),
            &presence,
            &refresh,
            "AA:BB:CC:DD:EE:FF",
            Some("VEEPEAK"),
        );
        refresh.notified().await;
        assert!(!poller.poll_once().await.unwrap().is_empty());
        assert_eq!(poller.interval(), policy.fast);
    }
}
