use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect backoff settings
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Give up after this many failed attempts; `None` retries until disconnected
    pub max_attempts: Option<u32>,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
            max_attempts: None,
        }
    }
}

/// Exponential backoff: base, doubling, capped
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
    attempts: u32,
    max_attempts: Option<u32>,
}

impl Backoff {
    pub fn new(settings: &BackoffSettings) -> Self {
        let base = Duration::from_millis(settings.base_ms.max(1));
        let max = Duration::from_millis(settings.max_ms).max(base);
        Self {
            base,
            max,
            next: base,
            attempts: 0,
            max_attempts: settings.max_attempts,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.max_attempts {
            if self.attempts >= max_attempts {
                return None;
            }
        }
        self.attempts += 1;
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.next = self.base;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_cap() {
        let mut backoff = Backoff::new(&BackoffSettings::default());
        let delays: Vec<u64> = (0..9)
            .map(|_| backoff.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn respects_attempt_budget() {
        let mut backoff = Backoff::new(&BackoffSettings {
            base_ms: 10,
            max_ms: 100,
            max_attempts: Some(2),
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.attempts(), 1);
    }
}
