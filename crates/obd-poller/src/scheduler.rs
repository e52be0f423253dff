//! Poll Scheduler
//!
//! Picks the next poll interval from what the last poll saw and
//! optionally keeps the last value of every reading.

use crate::error::PollerError;
use async_trait::async_trait;
use obd_ble::{ObdError, ObdValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Readings keyed by name
pub type Readings = BTreeMap<String, ObdValue>;

/// What a poll found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The car answered
    Data,
    /// The adapter answered but the car did not, it is probably off
    NoData,
    /// The adapter is out of range
    Unavailable,
}

/// Poll interval for each outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalPolicy {
    pub fast: Duration,
    /// Long, since waking some cars clicks a relay
    pub slow: Duration,
    /// Used until the adapter is seen again
    pub ultra_slow: Duration,
}

impl Default for IntervalPolicy {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(10),
            slow: Duration::from_secs(5 * 60),
            ultra_slow: Duration::from_secs(60 * 60),
        }
    }
}

impl IntervalPolicy {
    pub fn next(&self, outcome: PollOutcome) -> Duration {
        match outcome {
            PollOutcome::Data => self.fast,
            PollOutcome::NoData => self.slow,
            PollOutcome::Unavailable => self.ultra_slow,
        }
    }
}

/// Something that can be asked for the current readings
#[async_trait]
pub trait ReadingSource: Send {
    /// Whether the adapter is currently in range
    async fn is_available(&mut self) -> bool;

    /// Query the car once
    async fn fetch(&mut self) -> Result<Readings, ObdError>;
}

/// Polls a [`ReadingSource`] with an adaptive interval
pub struct Poller<S: ReadingSource> {
    source: S,
    policy: IntervalPolicy,
    cache_values: bool,
    cache: Readings,
    interval: Duration,
    refresh: Arc<Notify>,
}

impl<S: ReadingSource> Poller<S> {
    pub fn new(source: S, policy: IntervalPolicy, cache_values: bool) -> Self {
        Self {
            source,
            policy,
            cache_values,
            cache: Readings::new(),
            interval: policy.fast,
            refresh: Arc::new(Notify::new()),
        }
    }

    /// Delay before the next poll
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Handle that cuts the current wait short, e.g. when the adapter
    /// advertises again
    pub fn refresh_handle(&self) -> Arc<Notify> {
        self.refresh.clone()
    }

    /// Poll once and adjust the interval
    ///
    /// A failed fetch leaves the interval as it was.
    pub async fn poll_once(&mut self) -> Result<Readings, PollerError> {
        debug!("Checking whether the adapter is available");
        if !self.source.is_available().await {
            self.interval = self.policy.next(PollOutcome::Unavailable);
            debug!(
                "Adapter out of range, switching to ultra slow polling: {:?}",
                self.interval
            );
            return Ok(self.current(Readings::new()));
        }

        let fresh = self.source.fetch().await?;
        if fresh.is_empty() {
            self.interval = self.policy.next(PollOutcome::NoData);
            debug!(
                "Car is probably off, switching to slow polling: {:?}",
                self.interval
            );
        } else {
            self.interval = self.policy.next(PollOutcome::Data);
            debug!("Car is on, polling every {:?}", self.interval);
        }

        Ok(self.current(fresh))
    }

    /// Poll until `shutdown` changes or the receiver of `tx` goes away
    pub async fn run(&mut self, tx: mpsc::Sender<Readings>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting poller");
        let refresh = self.refresh.clone();

        while !*shutdown.borrow() {
            match self.poll_once().await {
                Ok(readings) => {
                    if tx.send(readings).await.is_err() {
                        info!("Readings receiver dropped");
                        break;
                    }
                }
                Err(e) => warn!("{}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = refresh.notified() => debug!("Refresh requested"),
                _ = shutdown.changed() => break,
            }
        }

        info!("Poller stopped");
    }

    fn current(&mut self, fresh: Readings) -> Readings {
        if self.cache_values {
            self.cache.extend(fresh);
            self.cache.clone()
        } else {
            fresh
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    #[derive(Default)]
    struct FakeSource {
        unavailable: bool,
        results: VecDeque<Result<Readings, ObdError>>,
        fetches: usize,
    }

    impl FakeSource {
        fn with(results: Vec<Result<Readings, ObdError>>) -> Self {
            Self {
                results: results.into(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ReadingSource for FakeSource {
        async fn is_available(&mut self) -> bool {
            !self.unavailable
        }

        async fn fetch(&mut self) -> Result<Readings, ObdError> {
            self.fetches += 1;
            self.results.pop_front().unwrap_or_else(|| Ok(Readings::new()))
        }
    }

    fn readings(pairs: &[(&str, f64)]) -> Readings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ObdValue::Number(*v)))
            .collect()
    }

    #[tokio::test]
    async fn test_interval_follows_outcome() {
        let policy = IntervalPolicy::default();
        let source = FakeSource::with(vec![
            Ok(readings(&[("speed", 50.0)])),
            Ok(Readings::new()),
        ]);
        let mut poller = Poller::new(source, policy, false);

        let data = poller.poll_once().await.unwrap();
        assert_eq!(data, readings(&[("speed", 50.0)]));
        assert_eq!(poller.interval(), policy.fast);

        let empty = poller.poll_once().await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(poller.interval(), policy.slow);
    }

    #[tokio::test]
    async fn test_unavailable_skips_fetch() {
        let policy = IntervalPolicy::default();
        let source = FakeSource {
            unavailable: true,
            ..FakeSource::default()
        };
        let mut poller = Poller::new(source, policy, false);

        assert!(poller.poll_once().await.unwrap().is_empty());
        assert_eq!(poller.interval(), policy.ultra_slow);
        assert_eq!(poller.source().fetches, 0);
    }

    #[tokio::test]
    async fn test_cache_merges_readings() {
        let source = FakeSource::with(vec![
            Ok(readings(&[("speed", 50.0), ("rpm", 900.0)])),
            Ok(readings(&[("speed", 60.0)])),
            Ok(Readings::new()),
        ]);
        let mut poller = Poller::new(source, IntervalPolicy::default(), true);

        poller.poll_once().await.unwrap();
        let merged = poller.poll_once().await.unwrap();
        assert_eq!(merged, readings(&[("rpm", 900.0), ("speed", 60.0)]));

        let car_off = poller.poll_once().await.unwrap();
        assert_eq!(car_off, merged);

        poller.source.unavailable = true;
        assert_eq!(poller.poll_once().await.unwrap(), merged);
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_interval() {
        let policy = IntervalPolicy::default();
        let source = FakeSource::with(vec![
            Ok(Readings::new()),
            Err(ObdError::Connection("adapter went away".to_string())),
        ]);
        let mut poller = Poller::new(source, policy, false);

        poller.poll_once().await.unwrap();
        assert_eq!(poller.interval(), policy.slow);

        let err = poller.poll_once().await.unwrap_err();
        assert!(matches!(err, PollerError::Fetch(ObdError::Connection(_))));
        assert_eq!(poller.interval(), policy.slow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_waits_between_polls() {
        let source = FakeSource::with(vec![
            Ok(readings(&[("speed", 50.0)])),
            Ok(readings(&[("speed", 55.0)])),
        ]);
        let mut poller = Poller::new(source, IntervalPolicy::default(), false);
        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);

        let start = Instant::now();
        let task = tokio::spawn(async move {
            poller.run(tx, stop_rx).await;
            poller
        });

        assert_eq!(rx.recv().await.unwrap(), readings(&[("speed", 50.0)]));
        assert_eq!(rx.recv().await.unwrap(), readings(&[("speed", 55.0)]));
        assert!(start.elapsed() >= Duration::from_secs(10));

        stop_tx.send(true).unwrap();
        let poller = task.await.unwrap();
        assert!(poller.source().fetches >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_cuts_wait_short() {
        let source = FakeSource {
            unavailable: true,
            ..FakeSource::default()
        };
        let mut poller = Poller::new(source, IntervalPolicy::default(), false);
        let refresh = poller.refresh_handle();
        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);

        let start = Instant::now();
        let task = tokio::spawn(async move { poller.run(tx, stop_rx).await });

        rx.recv().await.unwrap();
        refresh.notify_one();
        rx.recv().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(60));

        drop(stop_tx);
        drop(rx);
        task.await.unwrap();
    }
}
