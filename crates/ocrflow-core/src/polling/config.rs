//! PollingConfig - ポーリング間隔の設定

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Status polling profile.
///
/// The default is the OCR profile: 5s initial interval, doubling up to 30s,
/// giving up after 300s overall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    pub max_duration_ms: u64,
    /// Give up after this many invocations (None = only the duration limit).
    pub max_attempts: Option<u32>,
    /// false = fixed interval (`initial_interval_ms` every time).
    pub exponential: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 5_000,
            max_interval_ms: 30_000,
            multiplier: 2.0,
            max_duration_ms: 300_000,
            max_attempts: None,
            exponential: true,
        }
    }
}

impl PollingConfig {
    /// Fixed-interval profile.
    pub fn fixed(interval: Duration, max_duration: Duration) -> Self {
        let interval_ms = duration_ms(interval);
        Self {
            initial_interval_ms: interval_ms,
            max_interval_ms: interval_ms,
            multiplier: 1.0,
            max_duration_ms: duration_ms(max_duration),
            max_attempts: None,
            exponential: false,
        }
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    /// Wait before the next invocation, `attempt` counted from 0:
    /// `min(initial * multiplier^attempt, max_interval)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial = self.initial_interval();
        let cap = self.max_interval().max(initial);
        if !self.exponential {
            return initial;
        }
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = initial.as_secs_f64() * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(secs).unwrap_or(cap).min(cap)
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
