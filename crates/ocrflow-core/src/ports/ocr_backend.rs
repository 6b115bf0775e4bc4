//! OcrBackend port - リモート OCR サービスの契約
//!
//! PollingEngine と ProcessingQueue はこの形だけに依存し、
//! HTTP などの転送方式は知りません。

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{OcrError, OcrRequest, OcrStatus, TrackingId};

#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Hand a document to the backend; returns its tracking id.
    async fn submit(&self, request: &OcrRequest) -> Result<TrackingId, OcrError>;

    /// Current status (and the result once completed).
    async fn get_status(&self, tracking_id: &TrackingId) -> Result<OcrStatus, OcrError>;
}

#[async_trait]
impl<B: OcrBackend + ?Sized> OcrBackend for Arc<B> {
    async fn submit(&self, request: &OcrRequest) -> Result<TrackingId, OcrError> {
        (**self).submit(request).await
    }

    async fn get_status(&self, tracking_id: &TrackingId) -> Result<OcrStatus, OcrError> {
        (**self).get_status(tracking_id).await
    }
}
