//! EventSink 実装
//!
//! - **BroadcastSink**: tokio broadcast チャネルで複数購読者に配る
//! - **TracingSink**: tracing にログとして流す

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::{JobState, QueueEvent};
use crate::ports::EventSink;

/// Fan-out over a bounded broadcast channel.
///
/// Slow subscribers lag (and see `RecvError::Lagged`) instead of blocking
/// the queue.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<QueueEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: &QueueEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}

/// Logs every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &QueueEvent) {
        match event {
            QueueEvent::JobQueued { job } => {
                info!(job_id = %job.job_id, priority = ?job.priority, fingerprint = job.fingerprint.short(), "job queued");
            }
            QueueEvent::JobStateChanged { job, from, to } => match to {
                JobState::Failed => {
                    let (code, message) = job
                        .last_error
                        .as_ref()
                        .map(|e| (Some(e.code), e.message.as_str()))
                        .unwrap_or((None, ""));
                    warn!(job_id = %job.job_id, ?from, ?code, error = message, retry_count = job.retry_count, "job failed");
                }
                _ => {
                    info!(job_id = %job.job_id, ?from, ?to, "job state changed");
                }
            },
            QueueEvent::JobProgress { job_id, status } => {
                debug!(
                    %job_id,
                    tracking_id = %status.tracking_id,
                    status = ?status.status,
                    progress = status.progress_percent,
                    eta_secs = ?status.estimated_seconds_remaining,
                    queue_position = ?status.queue_position,
                    "job progress"
                );
            }
            QueueEvent::JobCompleted { job } => {
                info!(
                    job_id = %job.job_id,
                    from_cache = job.served_from_cache,
                    document_type = ?job.extraction.as_ref().map(|e| e.document_type.as_str()),
                    "job completed"
                );
            }
            QueueEvent::QueueStateChanged { from, to } => {
                info!(?from, ?to, "queue state changed");
            }
        }
    }
}
