//! Timer-driven light sensor for hosts without an ambient-light sensor
//!
//! Produces a slow sine wave around a baseline lux level so the broker side sees
//! realistic, changing values.

use super::{ReadingSource, Sample, SampleFuture, SourceError, SourceProvider};
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SimulatedSensorSettings {
    /// Time between readings
    pub interval_ms: u64,
    pub baseline_lux: f32,
    pub amplitude_lux: f32,
    /// Length of one full brightness cycle
    pub period_secs: f32,
}

impl Default for SimulatedSensorSettings {
    fn default() -> Self {
        Self {
            interval_ms: 200, // roughly SENSOR_DELAY_NORMAL
            baseline_lux: 320.0,
            amplitude_lux: 180.0,
            period_secs: 60.0,
        }
    }
}

/// [`SourceProvider`] for simulated readings
#[derive(Debug, Clone, Default)]
pub struct SimulatedLightSensor {
    settings: SimulatedSensorSettings,
}

impl SimulatedLightSensor {
    pub fn new(settings: SimulatedSensorSettings) -> Self {
        Self { settings }
    }
}

impl SourceProvider for SimulatedLightSensor {
    fn open(&self, cancel: CancellationToken) -> Result<Box<dyn ReadingSource>, SourceError> {
        info!("Opening simulated light sensor: {:?}", self.settings);
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.settings.interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Ok(Box::new(SimulatedSource {
            settings: self.settings.clone(),
            ticker,
            started: Instant::now(),
            cancel,
        }))
    }

    fn describe(&self) -> String {
        format!("simulated light sensor every {}ms", self.settings.interval_ms)
    }
}

struct SimulatedSource {
    settings: SimulatedSensorSettings,
    ticker: Interval,
    started: Instant,
    cancel: CancellationToken,
}

impl SimulatedSource {
    fn lux_at(&self, elapsed: Duration) -> f32 {
        let period = self.settings.period_secs.max(f32::EPSILON);
        let phase = (elapsed.as_secs_f32() / period) * TAU;
        (self.settings.baseline_lux + self.settings.amplitude_lux * phase.sin()).max(0.0)
    }

    async fn next(&mut self) -> Result<Sample, SourceError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SourceError::Cancelled),
            tick = self.ticker.tick() => {
                let value = self.lux_at(tick.duration_since(self.started));
                debug!("Simulated reading: {:.2} lx", value);
                Ok(Sample::now(value))
            }
        }
    }
}

impl ReadingSource for SimulatedSource {
    fn next_sample(&mut self) -> SampleFuture<'_> {
        Box::pin(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produces_values_around_baseline() {
        let sensor = SimulatedLightSensor::new(SimulatedSensorSettings {
            interval_ms: 1,
            baseline_lux: 100.0,
            amplitude_lux: 10.0,
            period_secs: 1.0,
        });
        let mut source = sensor.open(CancellationToken::new()).unwrap();

        for _ in 0..3 {
            let sample = source.next_sample().await.unwrap();
            assert!((90.0..=110.0).contains(&sample.value));
        }
    }

    #[tokio::test]
    async fn stops_after_cancel() {
        let cancel = CancellationToken::new();
        let mut source = SimulatedLightSensor::default()
            .open(cancel.clone())
            .unwrap();
        cancel.cancel();
        assert_eq!(source.next_sample().await, Err(SourceError::Cancelled));
    }

    #[tokio::test]
    async fn never_negative() {
        let source = SimulatedSource {
            settings: SimulatedSensorSettings {
                baseline_lux: 5.0,
                amplitude_lux: 50.0,
                ..Default::default()
            },
            ticker: tokio::time::interval(Duration::from_secs(1)),
            started: Instant::now(),
            cancel: CancellationToken::new(),
        };
        let three_quarters = Duration::from_secs_f32(45.0);
        assert_eq!(source.lux_at(three_quarters), 0.0);
    }
}
