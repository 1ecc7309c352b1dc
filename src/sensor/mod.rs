//! Ambient-light reading sources
//!
//! A [`ReadingSource`] is a pull-based, non-restartable sequence of [`Sample`]s:
//!
//! ```text
//! OS callback ──► SensorFeed ──[capacity 1]──► FeedSource::next_sample()
//! timer       ──────────────────────────────► SimulatedLightSensor::next_sample()
//! ```
//!
//! Sources are opened through a [`SourceProvider`] so the bridge can get a fresh
//! sequence every time it is switched on.

pub mod feed;
pub mod simulated;

use chrono::{DateTime, Local};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use feed::{FeedSource, SensorFault, SensorFeed};
pub use simulated::{SimulatedLightSensor, SimulatedSensorSettings};

/// Boxed future returned by [`ReadingSource::next_sample`]
pub type SampleFuture<'a> = Pin<Box<dyn Future<Output = Result<Sample, SourceError>> + Send + 'a>>;

/// One timestamped light reading in lux
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Local>,
    pub value: f32,
}

impl Sample {
    pub fn new(timestamp: DateTime<Local>, value: f32) -> Self {
        Self { timestamp, value }
    }

    pub fn now(value: f32) -> Self {
        Self::new(Local::now(), value)
    }

    /// Payload sent to the broker: the value with a fractional part, e.g. `42.0`
    pub fn payload(&self) -> Vec<u8> {
        let value = self.value;
        let text = if value.is_finite() && value.fract() == 0.0 {
            format!("{:.1}", value)
        } else {
            value.to_string()
        };
        text.into_bytes()
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} lx @ {}",
            self.value,
            self.timestamp.format("%H:%M:%S.%3f")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The sensor is gone for good; the sequence has ended
    #[error("Sensor unavailable: {0}")]
    SourceUnavailable(String),

    /// The caller cancelled the source
    #[error("Reading source cancelled")]
    Cancelled,
}

/// Pull-based sensor contract
///
/// `next_sample` suspends until a reading is available. Once the cancellation token
/// given at open time fires, no further samples are produced.
pub trait ReadingSource: Send {
    fn next_sample(&mut self) -> SampleFuture<'_>;
}

/// Opens a fresh [`ReadingSource`] for each bridge run
pub trait SourceProvider: Send + Sync {
    fn open(&self, cancel: CancellationToken) -> Result<Box<dyn ReadingSource>, SourceError>;

    fn describe(&self) -> String {
        "sensor".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_keeps_fractional_part() {
        assert_eq!(Sample::now(42.0).payload(), b"42.0".to_vec());
        assert_eq!(Sample::now(3.25).payload(), b"3.25".to_vec());
        assert_eq!(Sample::now(0.0).payload(), b"0.0".to_vec());
    }
}
