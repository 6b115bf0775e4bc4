//! Shapes exchanged with the OCR backend.
//!
//! Only the contract matters here (submit -> tracking id, status -> payload);
//! transport details live behind [`crate::ports::OcrBackend`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::submission::{DocumentType, Fingerprint, Submission, TrackingId};

/// Status reported by the backend for a tracking id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrStatusKind {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl OcrStatusKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, OcrStatusKind::Completed | OcrStatusKind::Failed)
    }
}

/// Recognised text plus whatever the backend tells us about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,

    /// Mean recognition confidence in `[0, 1]`.
    pub confidence: f32,

    pub page_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl OcrResult {
    pub fn new(text: impl Into<String>, confidence: f32, page_count: u32) -> Self {
        Self {
            text: text.into(),
            confidence,
            page_count,
            language: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// One status poll response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrStatus {
    pub tracking_id: TrackingId,
    pub status: OcrStatusKind,
    pub progress_percent: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_seconds_remaining: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OcrResult>,

    /// Backend-side failure description when `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OcrStatus {
    pub fn queued(tracking_id: TrackingId, queue_position: u32) -> Self {
        Self {
            tracking_id,
            status: OcrStatusKind::Queued,
            progress_percent: 0,
            estimated_seconds_remaining: None,
            queue_position: Some(queue_position),
            result: None,
            error: None,
        }
    }

    pub fn processing(tracking_id: TrackingId, progress_percent: u8) -> Self {
        Self {
            tracking_id,
            status: OcrStatusKind::Processing,
            progress_percent: progress_percent.min(100),
            estimated_seconds_remaining: None,
            queue_position: None,
            result: None,
            error: None,
        }
    }

    pub fn completed(tracking_id: TrackingId, result: OcrResult) -> Self {
        Self {
            tracking_id,
            status: OcrStatusKind::Completed,
            progress_percent: 100,
            estimated_seconds_remaining: Some(0),
            queue_position: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(tracking_id: TrackingId, error: impl Into<String>) -> Self {
        Self {
            tracking_id,
            status: OcrStatusKind::Failed,
            progress_percent: 0,
            estimated_seconds_remaining: None,
            queue_position: None,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn with_eta(mut self, seconds: u32) -> Self {
        self.estimated_seconds_remaining = Some(seconds);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// What the queue hands to [`crate::ports::OcrBackend::submit`].
#[derive(Debug, Clone)]
pub struct OcrRequest {
    pub job_id: JobId,
    pub fingerprint: Fingerprint,
    pub document_type: Option<DocumentType>,
    pub content: Vec<u8>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl OcrRequest {
    pub fn from_submission(job_id: JobId, submission: &Submission) -> Self {
        Self {
            job_id,
            fingerprint: submission.fingerprint(),
            document_type: submission.document_type.clone(),
            content: submission.content.clone(),
            metadata: submission.metadata.clone(),
        }
    }
}
