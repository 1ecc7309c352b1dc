//! Push-to-pull adapter for callback-driven sensors
//!
//! The platform sensor API calls [`SensorFeed::deliver`] from its own thread. The feed
//! hands readings to the currently open [`FeedSource`] through a channel of capacity 1,
//! so at most one reading is in flight. A reading that arrives while the slot is still
//! occupied is dropped and counted; the consumer always catches up with a fresh value.

use super::{ReadingSource, Sample, SampleFuture, SourceError, SourceProvider};
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_TRANSIENT_FAULTS: u32 = 5;

/// A recoverable sensor read error reported by the platform callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorFault(pub String);

#[derive(Debug)]
enum FeedItem {
    Reading(Sample),
    Fault(SensorFault),
}

#[derive(Debug, Default)]
struct FeedShared {
    sender: Mutex<Option<mpsc::Sender<FeedItem>>>,
    unavailable: Mutex<Option<String>>,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

/// Callback side of the adapter; cheap to clone into sensor callbacks
#[derive(Debug, Clone)]
pub struct SensorFeed {
    shared: Arc<FeedShared>,
    max_transient_faults: u32,
}

impl Default for SensorFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorFeed {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(FeedShared::default()),
            max_transient_faults: DEFAULT_MAX_TRANSIENT_FAULTS,
        }
    }

    /// Number of consecutive transient faults after which the sensor counts as gone
    pub fn with_max_transient_faults(mut self, max: u32) -> Self {
        self.max_transient_faults = max;
        self
    }

    /// Hands a raw reading to the open source
    ///
    /// Returns `false` when the reading was not accepted: no source is open, the slot
    /// is occupied, or the sensor has been shut down. Non-finite or negative values
    /// are reported as transient faults instead.
    pub fn deliver(&self, timestamp: DateTime<Local>, raw: f32) -> bool {
        if !raw.is_finite() || raw < 0.0 {
            self.report_fault(format!("implausible raw value {}", raw));
            return false;
        }
        self.push(FeedItem::Reading(Sample::new(timestamp, raw)))
    }

    /// Reports a recoverable read error; the source retries internally
    pub fn report_fault(&self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!("Sensor reported transient fault: {}", reason);
        self.push(FeedItem::Fault(SensorFault(reason)));
    }

    /// Marks the sensor as permanently unavailable and ends the open sequence
    pub fn shutdown(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!("Sensor became unavailable: {}", reason);
        *lock(&self.shared.unavailable) = Some(reason);
        // Dropping the sender ends the receiver's sequence
        lock(&self.shared.sender).take();
    }

    /// Readings dropped because a reading was already in flight
    pub fn dropped_readings(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered_readings(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    fn push(&self, item: FeedItem) -> bool {
        let guard = lock(&self.shared.sender);
        let Some(sender) = guard.as_ref() else {
            debug!("No reading source open, discarding sensor callback");
            return false;
        };

        match sender.try_send(item) {
            Ok(()) => {
                self.shared.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Reading still in flight, dropped callback (total {})", dropped);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Reading source closed, discarding sensor callback");
                false
            }
        }
    }
}

impl SourceProvider for SensorFeed {
    fn open(&self, cancel: CancellationToken) -> Result<Box<dyn ReadingSource>, SourceError> {
        if let Some(reason) = lock(&self.shared.unavailable).clone() {
            return Err(SourceError::SourceUnavailable(reason));
        }

        let (sender, receiver) = mpsc::channel(1);
        if lock(&self.shared.sender).replace(sender).is_some() {
            warn!("Opening sensor feed replaced a previously open source");
        }
        info!("Sensor feed opened");

        Ok(Box::new(FeedSource {
            receiver,
            cancel,
            shared: self.shared.clone(),
            max_transient_faults: self.max_transient_faults,
            consecutive_faults: 0,
        }))
    }

    fn describe(&self) -> String {
        "sensor feed".to_string()
    }
}

/// Pull side of a [`SensorFeed`]
pub struct FeedSource {
    receiver: mpsc::Receiver<FeedItem>,
    cancel: CancellationToken,
    shared: Arc<FeedShared>,
    max_transient_faults: u32,
    consecutive_faults: u32,
}

impl FeedSource {
    async fn next(&mut self) -> Result<Sample, SourceError> {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SourceError::Cancelled),
                item = self.receiver.recv() => item,
            };

            match item {
                Some(FeedItem::Reading(sample)) => {
                    self.consecutive_faults = 0;
                    return Ok(sample);
                }
                Some(FeedItem::Fault(SensorFault(reason))) => {
                    self.consecutive_faults += 1;
                    if self.consecutive_faults >= self.max_transient_faults {
                        return Err(SourceError::SourceUnavailable(format!(
                            "{} consecutive read faults, last: {}",
                            self.consecutive_faults, reason
                        )));
                    }
                    warn!(
                        "Transient sensor fault {}/{}: {}, retrying",
                        self.consecutive_faults, self.max_transient_faults, reason
                    );
                }
                None => {
                    let reason = lock(&self.shared.unavailable)
                        .clone()
                        .unwrap_or_else(|| "sensor feed closed".to_string());
                    return Err(SourceError::SourceUnavailable(reason));
                }
            }
        }
    }
}

impl ReadingSource for FeedSource {
    fn next_sample(&mut self) -> SampleFuture<'_> {
        Box::pin(self.next())
    }
}

impl Drop for FeedSource {
    fn drop(&mut self) {
        self.receiver.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn delivers_one_reading_at_a_time() {
        let feed = SensorFeed::new();
        let mut source = feed.open(CancellationToken::new()).unwrap();

        assert!(feed.deliver(Local::now(), 10.0));
        // Slot occupied
        assert!(!feed.deliver(Local::now(), 20.0));
        assert_eq!(feed.dropped_readings(), 1);

        let sample = source.next_sample().await.unwrap();
        assert_eq!(sample.value, 10.0);

        assert!(feed.deliver(Local::now(), 30.0));
        assert_eq!(source.next_sample().await.unwrap().value, 30.0);
    }

    #[tokio::test]
    async fn retries_transient_faults() {
        let feed = SensorFeed::new().with_max_transient_faults(3);
        let mut source = feed.open(CancellationToken::new()).unwrap();

        let pusher = feed.clone();
        let task = tokio::spawn(async move {
            for _ in 0..2 {
                while !pusher.push(FeedItem::Fault(SensorFault("glitch".into()))) {
                    tokio::task::yield_now().await;
                }
            }
            while !pusher.deliver(Local::now(), 5.5) {
                tokio::task::yield_now().await;
            }
        });

        let sample = timeout(Duration::from_secs(2), source.next_sample())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.value, 5.5);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn too_many_faults_end_the_sequence() {
        let feed = SensorFeed::new().with_max_transient_faults(0);
        let mut source = feed.open(CancellationToken::new()).unwrap();

        feed.report_fault("bus error");
        let result = source.next_sample().await;
        assert!(matches!(result, Err(SourceError::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn escalates_on_the_configured_fault_count() {
        let feed = SensorFeed::new().with_max_transient_faults(2);
        let mut source = feed.open(CancellationToken::new()).unwrap();

        let pusher = feed.clone();
        let task = tokio::spawn(async move {
            for _ in 0..2 {
                while !pusher.push(FeedItem::Fault(SensorFault("glitch".into()))) {
                    tokio::task::yield_now().await;
                }
            }
        });

        let result = timeout(Duration::from_secs(2), source.next_sample())
            .await
            .unwrap();
        match result {
            Err(SourceError::SourceUnavailable(reason)) => {
                assert!(reason.starts_with("2 consecutive read faults"))
            }
            other => panic!("expected unavailable, got {:?}", other),
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_reports_unavailable() {
        let feed = SensorFeed::new();
        let mut source = feed.open(CancellationToken::new()).unwrap();

        feed.shutdown("light sensor removed");
        assert_eq!(
            source.next_sample().await,
            Err(SourceError::SourceUnavailable("light sensor removed".into()))
        );
        assert!(matches!(
            feed.open(CancellationToken::new()),
            Err(SourceError::SourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_the_sequence() {
        let feed = SensorFeed::new();
        let cancel = CancellationToken::new();
        let mut source = feed.open(cancel.clone()).unwrap();

        feed.deliver(Local::now(), 1.0);
        cancel.cancel();
        assert_eq!(source.next_sample().await, Err(SourceError::Cancelled));
    }

    #[test]
    fn implausible_values_are_not_samples() {
        let feed = SensorFeed::new();
        assert!(!feed.deliver(Local::now(), f32::NAN));
        assert!(!feed.deliver(Local::now(), -1.0));
        assert_eq!(feed.delivered_readings(), 0);
    }
}
