//! Retry policy: classification ceilings and backoff delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{FailureClass, OcrError};

/// Retry policy for failed OCR requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay_ms: u64,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay_ms: u64,

    /// Retry ceiling for transient failures.
    pub max_retries: u32,

    /// Whether unclassified failures are retried at all.
    pub unknown_as_transient: bool,

    /// Tighter ceiling for unclassified failures.
    pub unknown_max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            max_retries: 3,
            unknown_as_transient: true,
            unknown_max_retries: 1,
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before retry number `retry_count + 1`:
    /// `min(base_delay * multiplier^retry_count, max_delay)`.
    ///
    /// Example with base_delay=2s, multiplier=2.0:
    /// - 0 retries so far: 2s
    /// - 1: 4s
    /// - 2: 8s
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let cap = self.max_delay();
        let exp = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.base_delay().as_secs_f64() * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(secs).unwrap_or(cap).min(cap)
    }

    pub fn classify(&self, error: &OcrError) -> FailureClass {
        error.failure_class()
    }

    /// How many automatic retries a failure of this class gets.
    pub fn ceiling(&self, class: FailureClass) -> u32 {
        match class {
            FailureClass::Transient => self.max_retries,
            FailureClass::Permanent => 0,
            FailureClass::Unknown if self.unknown_as_transient => {
                self.max_retries.min(self.unknown_max_retries)
            }
            FailureClass::Unknown => 0,
        }
    }

    /// Whether a failure of `class` that has already been retried
    /// `retry_count` times may be retried again (ignoring timing).
    pub fn should_retry(&self, class: FailureClass, retry_count: u32) -> bool {
        retry_count < self.ceiling(class)
    }
}
