//! Errors - エラー型と分類
//!
//! - `OcrError`: バックエンド呼び出しの失敗（リトライ判定の対象）
//! - `QueueError`: 呼び出し側へ同期的に返すエラー（キューには入らない）
//! - `StoreError`: 永続化の失敗

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::JobId;
use super::ocr::OcrStatus;
use super::state::{JobState, QueueState};
use super::submission::TrackingId;

/// 運用上の分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Unknown: 分類できないエラー（ポリシー次第、既定では回数を絞ってリトライ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
    Unknown,
}

/// Stable machine-readable code carried on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BackendUnavailable,
    Network,
    Timeout,
    RateLimited,
    MalformedInput,
    Rejected,
    ProcessingFailed,
    InvalidResponse,
    PollTimeout,
    Interrupted,
}

/// Failure reported by (or while talking to) the OCR backend.
#[derive(Debug, Clone, Error)]
pub enum OcrError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("backend request timed out")]
    Timeout,

    #[error("rate limited by backend")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("content rejected by backend: {0}")]
    Rejected(String),

    #[error("backend reported failure: {0}")]
    ProcessingFailed(String),

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("status polling timed out after {elapsed_ms}ms")]
    PollTimeout {
        elapsed_ms: u64,
        last_status: Option<Box<OcrStatus>>,
    },

    #[error("processing interrupted: {0}")]
    Interrupted(String),
}

impl OcrError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OcrError::Unavailable(_) => ErrorCode::BackendUnavailable,
            OcrError::Network(_) => ErrorCode::Network,
            OcrError::Timeout => ErrorCode::Timeout,
            OcrError::RateLimited { .. } => ErrorCode::RateLimited,
            OcrError::MalformedInput(_) => ErrorCode::MalformedInput,
            OcrError::Rejected(_) => ErrorCode::Rejected,
            OcrError::ProcessingFailed(_) => ErrorCode::ProcessingFailed,
            OcrError::InvalidResponse(_) => ErrorCode::InvalidResponse,
            OcrError::PollTimeout { .. } => ErrorCode::PollTimeout,
            OcrError::Interrupted(_) => ErrorCode::Interrupted,
        }
    }

    /// Pure function of the failure type.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            OcrError::Unavailable(_)
            | OcrError::Network(_)
            | OcrError::Timeout
            | OcrError::RateLimited { .. }
            | OcrError::PollTimeout { .. }
            | OcrError::Interrupted(_) => FailureClass::Transient,
            OcrError::MalformedInput(_) | OcrError::Rejected(_) => FailureClass::Permanent,
            OcrError::ProcessingFailed(_) | OcrError::InvalidResponse(_) => FailureClass::Unknown,
        }
    }
}

/// Caller-visible failure detail stored on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: ErrorCode,
    pub class: FailureClass,
    pub message: String,
    /// Whether calling `retry` on the job is allowed.
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<TrackingId>,
}

/// Errors returned synchronously by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {job_id}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("queue: illegal transition {from:?} -> {to:?}")]
    InvalidQueueState { from: QueueState, to: QueueState },

    #[error("job {job_id} is not retryable: {reason}")]
    NotRetryable { job_id: JobId, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key '{0}'")]
    InvalidKey(String),
}
