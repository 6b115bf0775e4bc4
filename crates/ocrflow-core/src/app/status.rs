//! Status - キューの集計値
//!
//! - `QueueCounts`: 状態ごとのジョブ数（ジョブマップから数える）
//! - `QueueStatistics`: 処理結果の累計（アトミックなカウンタから導出）

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::domain::JobState;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueCounts {
    pub fn add(&mut self, state: JobState) {
        match state {
            JobState::Queued => self.queued += 1,
            JobState::Processing => self.processing += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// Aggregate processing results. Derived on every call, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatistics {
    /// Jobs that reached Completed or Failed through processing.
    pub total_processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub served_from_cache: u64,
    pub average_processing_ms: f64,
    pub throughput_per_minute: f64,
    pub uptime_ms: u64,
    /// `succeeded / total_processed`, 0 when nothing was processed.
    pub success_rate: f64,
}

/// Lock-free counters updated by the workers.
#[derive(Debug)]
pub(crate) struct StatsCounters {
    started: Instant,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    from_cache: AtomicU64,
    timed_jobs: AtomicU64,
    total_processing_ms: AtomicU64,
}

impl Default for StatsCounters {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            from_cache: AtomicU64::new(0),
            timed_jobs: AtomicU64::new(0),
            total_processing_ms: AtomicU64::new(0),
        }
    }
}

impl StatsCounters {
    fn record_duration(&self, duration: Option<Duration>) {
        if let Some(d) = duration {
            let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
            self.total_processing_ms.fetch_add(ms, Ordering::Relaxed);
            self.timed_jobs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_success(&self, duration: Option<Duration>, from_cache: bool) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        if from_cache {
            self.from_cache.fetch_add(1, Ordering::Relaxed);
        }
        self.record_duration(duration);
    }

    pub fn record_failure(&self, duration: Option<Duration>) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_duration(duration);
    }

    pub fn record_cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueStatistics {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = succeeded + failed;
        let timed = self.timed_jobs.load(Ordering::Relaxed);
        let total_ms = self.total_processing_ms.load(Ordering::Relaxed);
        let uptime = self.started.elapsed();
        let minutes = uptime.as_secs_f64() / 60.0;

        QueueStatistics {
            total_processed: total,
            succeeded,
            failed,
            cancelled: self.cancelled.load(Ordering::Relaxed),
            served_from_cache: self.from_cache.load(Ordering::Relaxed),
            average_processing_ms: if timed == 0 {
                0.0
            } else {
                total_ms as f64 / timed as f64
            },
            throughput_per_minute: if minutes > 0.0 {
                total as f64 / minutes
            } else {
                0.0
            },
            uptime_ms: u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
            success_rate: if total == 0 {
                0.0
            } else {
                succeeded as f64 / total as f64
            },
        }
    }
}
