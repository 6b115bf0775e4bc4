//! FailedRequest - リトライ待ちの失敗記録

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::policy::RetryPolicy;
use crate::domain::{ErrorCode, FailureClass, Fingerprint, JobId, Priority, Submission};

/// A failed request awaiting (or exhausted of) automatic retries.
///
/// Keyed by the queue's job id, so a retried job updates the same record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRequest {
    pub request_id: JobId,
    pub submission: Submission,
    pub fingerprint: Fingerprint,
    pub priority: Priority,

    pub first_failed_at: DateTime<Utc>,
    /// Last time the request was submitted (failure or retry start).
    pub last_attempt_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,

    /// Automatic or manual retries started so far.
    pub retry_count: u32,
    /// A retry has started and has not failed yet.
    #[serde(default)]
    pub retry_pending: bool,
    pub classification: FailureClass,
    pub error_code: ErrorCode,
    pub last_error: String,
}

impl FailedRequest {
    /// `last_attempt_at + min(base * multiplier^retry_count, cap)`.
    pub fn next_eligible_at(&self, policy: &RetryPolicy) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(policy.next_delay(self.retry_count))
            .unwrap_or(chrono::Duration::MAX);
        self.last_attempt_at
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Retry ceiling reached (never true for permanent failures, which are
    /// not retried in the first place).
    pub fn is_exhausted(&self, policy: &RetryPolicy) -> bool {
        self.classification != FailureClass::Permanent
            && !policy.should_retry(self.classification, self.retry_count)
    }

    pub fn is_eligible(&self, now: DateTime<Utc>, policy: &RetryPolicy) -> bool {
        self.classification != FailureClass::Permanent
            && policy.should_retry(self.classification, self.retry_count)
            && now >= self.next_eligible_at(policy)
    }
}
