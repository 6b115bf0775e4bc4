//! Domain model (IDs, submissions, job records, states, events, errors).

pub mod errors;
pub mod events;
pub mod ids;
pub mod job;
pub mod ocr;
pub mod state;
pub mod submission;

pub use errors::{ErrorCode, FailureClass, JobError, OcrError, QueueError, StoreError};
pub use events::QueueEvent;
pub use ids::{JobId, ParseIdError};
pub use job::{Extraction, JobSnapshot, QueuedJob};
pub use ocr::{OcrRequest, OcrResult, OcrStatus, OcrStatusKind};
pub use state::{JobState, QueueState};
pub use submission::{DocumentType, Fingerprint, Priority, Submission, TrackingId};
