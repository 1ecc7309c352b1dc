use crate::mqtt::ConnectionState;
use crate::sensor::Sample;
use chrono::{DateTime, Local};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

/// Snapshot of everything the control surface shows
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BridgeStatus {
    pub running: bool,
    pub connection_state: ConnectionState,
    /// Latest brightness reading in lux
    pub brightness: Option<f32>,
    pub samples_read: u64,
    pub messages_sent: u64,
    pub requeued: u64,
    pub overflows: u64,
    pub transport_drops: u64,
    pub reconnect_attempts: u64,
    pub last_failure: Option<String>,
    pub last_activity: Option<DateTime<Local>>,
}

impl BridgeStatus {
    /// One-line status text for the user-facing layer
    pub fn status_line(&self) -> String {
        let brightness = match self.brightness {
            Some(lux) => format!("{:.1} lx", lux),
            None => "-- lx".to_string(),
        };
        let mut line = format!(
            "{} | {} | {} | sent {}, dropped {}, reconnects {}",
            if self.running { "ON" } else { "OFF" },
            self.connection_state,
            brightness,
            self.messages_sent,
            self.overflows,
            self.reconnect_attempts
        );
        if let Some(failure) = &self.last_failure {
            line.push_str(" | last failure: ");
            line.push_str(failure);
        }
        line
    }
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.status_line())
    }
}

/// Counters shared between the bridge flows
#[derive(Debug)]
pub(crate) struct Telemetry {
    brightness: watch::Sender<Option<Sample>>,
    samples_read: AtomicU64,
    forwarded: AtomicU64,
    requeued: AtomicU64,
    retired_overflows: AtomicU64,
    last_failure: Mutex<Option<String>>,
    last_activity: Mutex<Option<DateTime<Local>>>,
}

impl Default for Telemetry {
    fn default() -> Self {
        let (brightness, _) = watch::channel(None);
        Self {
            brightness,
            samples_read: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            retired_overflows: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            last_activity: Mutex::new(None),
        }
    }
}

impl Telemetry {
    pub fn observe_sample(&self, sample: Sample) {
        self.samples_read.fetch_add(1, Ordering::Relaxed);
        self.brightness.send_replace(Some(sample));
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Local::now());
    }

    pub fn record_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds the overflow count of a finished run into the lifetime total
    pub fn retire_overflows(&self, overflows: u64) {
        self.retired_overflows.fetch_add(overflows, Ordering::Relaxed);
    }

    pub fn record_failure(&self, reason: impl Into<String>) {
        *self
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    pub fn clear_failure(&self) {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn subscribe_brightness(&self) -> watch::Receiver<Option<Sample>> {
        self.brightness.subscribe()
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    /// Fills in the fields owned by the bridge flows
    pub fn fill(&self, status: &mut BridgeStatus, live_overflows: u64) {
        let latest = *self.brightness.borrow();
        status.brightness = latest.map(|sample| sample.value);
        status.samples_read = self.samples_read.load(Ordering::Relaxed);
        status.messages_sent = self.forwarded();
        status.requeued = self.requeued();
        status.overflows = self.retired_overflows.load(Ordering::Relaxed) + live_overflows;
        status.last_failure = self
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        status.last_activity = *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_shows_state_and_reading() {
        let status = BridgeStatus {
            running: true,
            connection_state: ConnectionState::Reconnecting,
            brightness: Some(312.46),
            messages_sent: 12,
            overflows: 3,
            reconnect_attempts: 2,
            ..Default::default()
        };
        assert_eq!(
            status.status_line(),
            "ON | Reconnecting | 312.5 lx | sent 12, dropped 3, reconnects 2"
        );
    }

    #[test]
    fn status_line_includes_failure() {
        let status = BridgeStatus {
            connection_state: ConnectionState::Failed("refused".into()),
            last_failure: Some("sensor removed".into()),
            ..Default::default()
        };
        assert_eq!(
            status.to_string(),
            "OFF | Failed: refused | -- lx | sent 0, dropped 0, reconnects 0 | last failure: sensor removed"
        );
    }

    #[test]
    fn telemetry_fills_counters() {
        let telemetry = Telemetry::default();
        telemetry.observe_sample(Sample::now(10.0));
        telemetry.record_forwarded();
        telemetry.record_requeued();
        telemetry.retire_overflows(4);

        let mut status = BridgeStatus::default();
        telemetry.fill(&mut status, 1);

        assert_eq!(status.brightness, Some(10.0));
        assert_eq!(status.samples_read, 1);
        assert_eq!(status.messages_sent, 1);
        assert_eq!(status.requeued, 1);
        assert_eq!(status.overflows, 5);
        assert!(status.last_activity.is_some());
    }
}
