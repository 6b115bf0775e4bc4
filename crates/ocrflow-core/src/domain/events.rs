//! Events - キューが発行する通知
//!
//! UI やロギングなど複数の購読者に配られます（[`crate::ports::EventSink`]）。

use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::job::JobSnapshot;
use super::ocr::OcrStatus;
use super::state::{JobState, QueueState};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A submission was accepted.
    JobQueued { job: JobSnapshot },

    /// Any job state transition.
    JobStateChanged {
        job: JobSnapshot,
        from: JobState,
        to: JobState,
    },

    /// Intermediate backend status while polling.
    JobProgress { job_id: JobId, status: OcrStatus },

    /// Terminal success, carrying the final result.
    JobCompleted { job: JobSnapshot },

    /// Running / Paused / Stopping / Stopped.
    QueueStateChanged { from: QueueState, to: QueueState },
}

impl QueueEvent {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            QueueEvent::JobQueued { job }
            | QueueEvent::JobStateChanged { job, .. }
            | QueueEvent::JobCompleted { job } => Some(job.job_id),
            QueueEvent::JobProgress { job_id, .. } => Some(*job_id),
            QueueEvent::QueueStateChanged { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::JobQueued { .. } => "job_queued",
            QueueEvent::JobStateChanged { .. } => "job_state_changed",
            QueueEvent::JobProgress { .. } => "job_progress",
            QueueEvent::JobCompleted { .. } => "job_completed",
            QueueEvent::QueueStateChanged { .. } => "queue_state_changed",
        }
    }
}
