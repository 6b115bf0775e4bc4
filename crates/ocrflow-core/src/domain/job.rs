//! Job record and snapshot views.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{JobError, QueueError};
use super::ids::JobId;
use super::ocr::OcrResult;
use super::state::JobState;
use super::submission::{DocumentType, Fingerprint, Priority, Submission, TrackingId};

/// Structured output produced by a document processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub document_type: DocumentType,
    pub processor: String,
    pub processor_version: String,
    pub confidence: f32,
    pub data: serde_json::Value,
}

/// A job in the processing queue.
///
/// Design:
/// - Single source of truth for the job's state.
/// - State transitions go through methods so the state machine is enforced
///   in one place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub submission: Submission,
    pub fingerprint: Fingerprint,
    pub priority: Priority,
    pub state: JobState,

    /// Monotonic enqueue order, used to break priority ties (FIFO).
    pub sequence: u64,

    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Number of Failed -> Queued transitions so far.
    pub retry_count: u32,
    pub last_error: Option<JobError>,

    pub tracking_id: Option<TrackingId>,
    pub result: Option<OcrResult>,
    pub extraction: Option<Extraction>,

    /// Completed from the result cache without a backend submission.
    #[serde(default)]
    pub served_from_cache: bool,
}

impl QueuedJob {
    pub fn new(
        job_id: JobId,
        submission: Submission,
        priority: Priority,
        sequence: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let fingerprint = submission.fingerprint();
        Self {
            job_id,
            submission,
            fingerprint,
            priority,
            state: JobState::Queued,
            sequence,
            enqueued_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
            tracking_id: None,
            result: None,
            extraction: None,
            served_from_cache: false,
        }
    }

    fn transition(&mut self, to: JobState) -> Result<JobState, QueueError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                job_id: self.job_id,
                from,
                to,
            });
        }
        self.state = to;
        Ok(from)
    }

    /// Queued -> Processing.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.transition(JobState::Processing)?;
        self.started_at = Some(now);
        self.completed_at = None;
        self.tracking_id = None;
        Ok(())
    }

    pub fn attach_tracking_id(&mut self, tracking_id: TrackingId) {
        self.tracking_id = Some(tracking_id);
    }

    /// Processing -> Completed.
    pub fn complete(
        &mut self,
        now: DateTime<Utc>,
        result: OcrResult,
        extraction: Option<Extraction>,
        from_cache: bool,
    ) -> Result<(), QueueError> {
        self.transition(JobState::Completed)?;
        self.completed_at = Some(now);
        self.result = Some(result);
        self.extraction = extraction;
        self.served_from_cache = from_cache;
        Ok(())
    }

    /// Processing -> Failed.
    pub fn fail(&mut self, now: DateTime<Utc>, error: JobError) -> Result<(), QueueError> {
        self.transition(JobState::Failed)?;
        self.completed_at = Some(now);
        self.last_error = Some(error);
        Ok(())
    }

    /// Failed -> Queued. The retry count carries over and is incremented;
    /// `last_error` is kept so the UI can still show why it was retried.
    pub fn requeue(&mut self, sequence: u64) -> Result<(), QueueError> {
        self.transition(JobState::Queued)?;
        self.retry_count += 1;
        self.sequence = sequence;
        self.started_at = None;
        self.completed_at = None;
        self.tracking_id = None;
        Ok(())
    }

    /// Queued | Processing -> Cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.transition(JobState::Cancelled)?;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn processing_duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.completed_at?;
        (finished - started).to_std().ok()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id,
            state: self.state,
            priority: self.priority,
            fingerprint: self.fingerprint.clone(),
            document_type: self.submission.document_type.clone(),
            metadata: self.submission.metadata.clone(),
            content_bytes: self.submission.content.len(),
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            tracking_id: self.tracking_id.clone(),
            result: self.result.clone(),
            extraction: self.extraction.clone(),
            served_from_cache: self.served_from_cache,
        }
    }
}

/// Serializable view of a job without the document bytes.
///
/// Carried by every notification so subscribers can render progress without
/// querying the queue again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub state: JobState,
    pub priority: Priority,
    pub fingerprint: Fingerprint,
    pub document_type: Option<DocumentType>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub content_bytes: usize,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<JobError>,
    pub tracking_id: Option<TrackingId>,
    pub result: Option<OcrResult>,
    pub extraction: Option<Extraction>,
    pub served_from_cache: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::{ErrorCode, FailureClass};
    use ulid::Ulid;

    fn job() -> QueuedJob {
        QueuedJob::new(
            JobId::from_ulid(Ulid::new()),
            Submission::new(b"scan".to_vec()),
            Priority::High,
            7,
            Utc::now(),
        )
    }

    fn error() -> JobError {
        JobError {
            code: ErrorCode::Network,
            class: FailureClass::Transient,
            message: "reset".into(),
            retryable: true,
            tracking_id: None,
        }
    }

    #[test]
    fn new_job_is_queued_with_fingerprint() {
        let j = job();
        assert_eq!(j.state, JobState::Queued);
        assert_eq!(j.fingerprint, Fingerprint::of(b"scan"));
        assert_eq!(j.retry_count, 0);
    }

    #[test]
    fn happy_path_records_timestamps() {
        let mut j = job();
        let t0 = Utc::now();
        j.start(t0).unwrap();
        j.attach_tracking_id(TrackingId::new("trk-1"));
        let t1 = t0 + chrono::Duration::milliseconds(1500);
        j.complete(t1, OcrResult::new("text", 0.9, 1), None, false)
            .unwrap();

        assert_eq!(j.state, JobState::Completed);
        assert_eq!(j.processing_duration(), Some(Duration::from_millis(1500)));
        assert_eq!(j.snapshot().tracking_id, Some(TrackingId::new("trk-1")));
    }

    #[test]
    fn requeue_only_from_failed_and_increments_retry_count() {
        let mut j = job();
        assert!(matches!(
            j.requeue(8),
            Err(QueueError::InvalidTransition { .. })
        ));

        j.start(Utc::now()).unwrap();
        j.fail(Utc::now(), error()).unwrap();
        j.requeue(8).unwrap();

        assert_eq!(j.state, JobState::Queued);
        assert_eq!(j.retry_count, 1);
        assert_eq!(j.sequence, 8);
        assert!(j.last_error.is_some());
        assert!(j.started_at.is_none());
    }

    #[test]
    fn terminal_jobs_cannot_be_cancelled() {
        let mut j = job();
        j.start(Utc::now()).unwrap();
        j.complete(Utc::now(), OcrResult::new("t", 1.0, 1), None, true)
            .unwrap();
        assert!(j.cancel(Utc::now()).is_err());
        assert!(j.served_from_cache);
    }

    #[test]
    fn snapshot_omits_content() {
        let j = job();
        let v = serde_json::to_value(j.snapshot()).unwrap();
        assert_eq!(v["content_bytes"], 4);
        assert!(v.get("content").is_none());
    }
}
