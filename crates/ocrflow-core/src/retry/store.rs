//! FailedRequestStore - 失敗したリクエストの保管とリトライ対象の選定
//!
//! # 責務
//! - 失敗の記録（分類はポリシー経由）
//! - リトライ可能な記録の列挙（優先度の高い順 → 古い順）
//! - リトライ試行の記帳、成功時の削除、上限到達分のパージ
//!
//! メモリ上のマップが正本で、変更のたびに DurableStore へ書き出します。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::policy::RetryPolicy;
use super::record::FailedRequest;
use crate::domain::{FailureClass, JobId, OcrError, QueuedJob, StoreError};
use crate::ports::durable_store::{list_json, put_json};
use crate::ports::{Clock, DurableStore, FAILED_NAMESPACE};

pub struct FailedRequestStore {
    entries: RwLock<HashMap<JobId, FailedRequest>>,
    store: Arc<dyn DurableStore>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl FailedRequestStore {
    pub fn new(policy: RetryPolicy, store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failed attempt of `job`. An existing record (from an earlier
    /// attempt of the same job) keeps its first-failure time. The retry
    /// count never drops below the job's own count, so a record purged
    /// while its last retry was running cannot come back with a fresh budget.
    pub async fn record(
        &self,
        job: &QueuedJob,
        error: &OcrError,
    ) -> Result<FailedRequest, StoreError> {
        let now = self.clock.now();
        let classification = self.policy.classify(error);

        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(job.job_id)
            .and_modify(|e| {
                e.retry_count = e.retry_count.max(job.retry_count);
                e.retry_pending = false;
                e.last_attempt_at = now;
                e.classification = classification;
                e.error_code = error.code();
                e.last_error = error.to_string();
            })
            .or_insert_with(|| FailedRequest {
                request_id: job.job_id,
                submission: job.submission.clone(),
                fingerprint: job.fingerprint.clone(),
                priority: job.priority,
                first_failed_at: now,
                last_attempt_at: now,
                last_retry_at: None,
                retry_count: job.retry_count,
                retry_pending: false,
                classification,
                error_code: error.code(),
                last_error: error.to_string(),
            })
            .clone();

        put_json(
            self.store.as_ref(),
            FAILED_NAMESPACE,
            &job.job_id.to_string(),
            &entry,
        )
        .await?;

        debug!(
            job_id = %job.job_id,
            class = ?classification,
            retry_count = entry.retry_count,
            next_eligible_at = %entry.next_eligible_at(&self.policy),
            "failure recorded"
        );
        Ok(entry)
    }

    /// Records whose backoff has elapsed and that are under their ceiling,
    /// highest priority first, then oldest failure first.
    pub async fn eligible(&self) -> Vec<FailedRequest> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        let mut eligible: Vec<FailedRequest> = entries
            .values()
            .filter(|e| e.is_eligible(now, &self.policy))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.first_failed_at.cmp(&b.first_failed_at))
        });
        eligible
    }

    /// Bookkeeping when a retry starts. Returns the updated record, or None
    /// if the request is unknown.
    pub async fn mark_retry_attempt(
        &self,
        request_id: JobId,
    ) -> Result<Option<FailedRequest>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&request_id) else {
            return Ok(None);
        };
        entry.retry_count += 1;
        entry.retry_pending = true;
        entry.last_retry_at = Some(now);
        entry.last_attempt_at = now;
        let entry = entry.clone();

        put_json(
            self.store.as_ref(),
            FAILED_NAMESPACE,
            &request_id.to_string(),
            &entry,
        )
        .await?;
        Ok(Some(entry))
    }

    /// Drop the record (the request succeeded or was removed).
    pub async fn remove(&self, request_id: JobId) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(&request_id).is_some();
        if removed {
            self.store
                .delete(FAILED_NAMESPACE, &request_id.to_string())
                .await?;
        }
        Ok(removed)
    }

    /// Remove records that reached their retry ceiling. Permanent failures
    /// stay until the job itself is removed. A record whose last retry is
    /// still queued or running stays until that retry fails (it is then
    /// purged on the next pass) or succeeds (it is removed).
    pub async fn purge_exhausted(&self) -> Result<Vec<FailedRequest>, StoreError> {
        let mut entries = self.entries.write().await;
        let exhausted: Vec<JobId> = entries
            .values()
            .filter(|e| !e.retry_pending && e.is_exhausted(&self.policy))
            .map(|e| e.request_id)
            .collect();

        let mut purged = Vec::with_capacity(exhausted.len());
        for id in exhausted {
            if let Some(entry) = entries.remove(&id) {
                self.store.delete(FAILED_NAMESPACE, &id.to_string()).await?;
                info!(
                    job_id = %id,
                    retry_count = entry.retry_count,
                    last_error = %entry.last_error,
                    "retries exhausted"
                );
                purged.push(entry);
            }
        }
        Ok(purged)
    }

    pub async fn get(&self, request_id: JobId) -> Option<FailedRequest> {
        self.entries.read().await.get(&request_id).cloned()
    }

    pub async fn list(&self) -> Vec<FailedRequest> {
        let mut all: Vec<FailedRequest> = self.entries.read().await.values().cloned().collect();
        all.sort_by_key(|e| e.first_failed_at);
        all
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn count_by_class(&self, class: FailureClass) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.classification == class)
            .count()
    }

    /// Reload records from the durable store. Returns how many were loaded.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let (records, broken) =
            list_json::<FailedRequest>(self.store.as_ref(), FAILED_NAMESPACE).await?;
        for key in broken {
            warn!(%key, "skipping unreadable failed-request record");
        }

        let mut entries = self.entries.write().await;
        let loaded = records.len();
        for record in records {
            entries.insert(record.request_id, record);
        }
        Ok(loaded)
    }
}
