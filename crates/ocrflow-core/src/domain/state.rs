//! State - ジョブとキューの状態遷移
//!
//! # ジョブの状態遷移
//! - Queued -> Processing -> Completed | Failed
//! - Failed -> Queued（手動 / 自動リトライ）
//! - Queued | Processing -> Cancelled
//!
//! # キューの状態遷移
//! - Stopped -> Running <-> Paused -> Stopping -> Stopped

use serde::{Deserialize, Serialize};

/// State of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker slot.
    Queued,

    /// Handed to the OCR backend and being polled.
    Processing,

    /// Backend returned a result.
    Completed,

    /// Backend (or the pipeline around it) failed.
    Failed,

    /// Cancelled by the caller.
    Cancelled,
}

impl JobState {
    /// Is this a terminal state (no further processing without a retry)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Queued)
                | (Queued, Cancelled)
                | (Processing, Cancelled)
        )
    }
}

/// Global state of the processing queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Stopped,
    Running,
    /// No new Queued -> Processing transitions; in-flight work continues.
    Paused,
    /// Draining in-flight work before `Stopped`.
    Stopping,
}

impl QueueState {
    pub fn can_transition_to(self, next: QueueState) -> bool {
        use QueueState::*;
        matches!(
            (self, next),
            (Stopped, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopping)
                | (Paused, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Whether the worker may start new jobs.
    pub fn accepts_work(self) -> bool {
        self == QueueState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::start(JobState::Queued, JobState::Processing)]
    #[case::complete(JobState::Processing, JobState::Completed)]
    #[case::fail(JobState::Processing, JobState::Failed)]
    #[case::retry(JobState::Failed, JobState::Queued)]
    #[case::cancel_queued(JobState::Queued, JobState::Cancelled)]
    #[case::cancel_in_flight(JobState::Processing, JobState::Cancelled)]
    fn legal_job_transitions(#[case] from: JobState, #[case] to: JobState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case::skip_processing(JobState::Queued, JobState::Completed)]
    #[case::revive_completed(JobState::Completed, JobState::Queued)]
    #[case::revive_cancelled(JobState::Cancelled, JobState::Queued)]
    #[case::cancel_failed(JobState::Failed, JobState::Cancelled)]
    #[case::back_to_queue(JobState::Processing, JobState::Queued)]
    fn illegal_job_transitions(#[case] from: JobState, #[case] to: JobState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[rstest]
    #[case(QueueState::Stopped, QueueState::Running, true)]
    #[case(QueueState::Running, QueueState::Paused, true)]
    #[case(QueueState::Paused, QueueState::Running, true)]
    #[case(QueueState::Paused, QueueState::Stopping, true)]
    #[case(QueueState::Stopping, QueueState::Stopped, true)]
    #[case(QueueState::Stopped, QueueState::Paused, false)]
    #[case(QueueState::Running, QueueState::Stopped, false)]
    #[case(QueueState::Stopping, QueueState::Running, false)]
    fn queue_transitions(#[case] from: QueueState, #[case] to: QueueState, #[case] ok: bool) {
        assert_eq!(from.can_transition_to(to), ok);
    }
}
