//! ProcessingQueue - 優先度付きジョブキュー
//!
//! # 責務
//! - 投入の検証・永続化・通知
//! - ジョブ状態遷移の直列化（ジョブマップは単一の Mutex 配下で更新）
//! - キュー全体のライフサイクル（Stopped → Running ⇄ Paused → Stopping → Stopped）
//!
//! 実際の処理（キャッシュ照会、バックエンド呼び出し、ポーリング）は
//! [`super::worker_loop`]、自動リトライと保持期間の掃除は
//! [`super::housekeeping_loop`] が担当します。
//!
//! # 通知の順序
//! 状態遷移の通知はジョブマップのロックを保持したまま発行するため、
//! 同じジョブについての通知は遷移の順に届きます。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, Semaphore, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::housekeeping_loop::housekeeping_loop;
use super::ready::{ReadyEntry, ReadyQueue, Take};
use super::status::{QueueCounts, QueueStatistics, StatsCounters};
use super::worker_loop::worker_loop;
use crate::cache::ResultCache;
use crate::domain::{
    FailureClass, Fingerprint, JobError, JobId, JobSnapshot, JobState, OcrError, Priority,
    QueueError, QueueEvent, QueueState, QueuedJob, StoreError, Submission,
};
use crate::impls::BroadcastSink;
use crate::polling::PollingEngine;
use crate::ports::durable_store::{list_json, put_json};
use crate::ports::{Clock, DurableStore, EventSink, IdGenerator, JOBS_NAMESPACE, OcrBackend};
use crate::processors::ProcessorRegistry;
use crate::retry::FailedRequestStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of jobs in Processing at once.
    pub concurrency: usize,
    pub shutdown_timeout_ms: u64,
    pub housekeeping_interval_ms: u64,
    /// Completed and Cancelled jobs older than this are dropped.
    pub completed_retention_ms: u64,
    pub max_document_bytes: usize,
    pub event_capacity: usize,
    /// Resubmit eligible failed requests from the housekeeping loop.
    pub auto_retry: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            shutdown_timeout_ms: 30_000,
            housekeeping_interval_ms: 1_000,
            completed_retention_ms: 60 * 60 * 1_000,
            max_document_bytes: 50 * 1024 * 1024,
            event_capacity: 256,
            auto_retry: true,
        }
    }
}

impl QueueConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms.max(1))
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_millis(self.completed_retention_ms)
    }
}

/// What [`ProcessingQueue::restore`] found in the durable store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub jobs: usize,
    pub queued: usize,
    /// Jobs that were Processing when the previous process exited.
    pub interrupted: usize,
    pub failed_requests: usize,
    pub cache_entries: usize,
    /// Job records that could not be decoded.
    pub skipped: usize,
}

/// A job handed to a worker, with the token that stops it.
pub(crate) struct JobLease {
    pub job: QueuedJob,
    pub cancel: CancellationToken,
}

/// Everything guarded by the queue lock.
#[derive(Default)]
pub(super) struct Book {
    pub jobs: HashMap<JobId, QueuedJob>,
    pub ready: ReadyQueue,
    pub next_sequence: u64,
    pub in_flight: HashMap<JobId, CancellationToken>,
    /// Fingerprints currently being processed.
    pub busy: HashSet<Fingerprint>,
    /// Stops the worker and housekeeping loops of the current run.
    pub run: Option<CancellationToken>,
}

impl Book {
    fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

pub(crate) struct QueueParts {
    pub config: QueueConfig,
    pub backend: Arc<dyn OcrBackend>,
    pub store: Arc<dyn DurableStore>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub polling: PollingEngine,
    pub failures: FailedRequestStore,
    pub cache: ResultCache,
    pub registry: Arc<ProcessorRegistry>,
    pub sinks: Vec<Arc<dyn EventSink>>,
}

pub(super) struct Inner {
    pub config: QueueConfig,
    pub book: Mutex<Book>,
    pub state: watch::Sender<QueueState>,
    pub wake: Notify,
    pub permits: Arc<Semaphore>,
    pub backend: Arc<dyn OcrBackend>,
    pub store: Arc<dyn DurableStore>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub polling: PollingEngine,
    pub failures: Arc<FailedRequestStore>,
    pub cache: Arc<ResultCache>,
    pub registry: Arc<ProcessorRegistry>,
    pub events: BroadcastSink,
    pub sinks: Vec<Arc<dyn EventSink>>,
    pub stats: StatsCounters,
    pub tasks: TaskTracker,
}

impl Inner {
    pub async fn persist(&self, job: &QueuedJob) -> Result<(), StoreError> {
        put_json(
            self.store.as_ref(),
            JOBS_NAMESPACE,
            &job.job_id.to_string(),
            job,
        )
        .await
    }

    /// The in-memory record stays authoritative when the store is down.
    pub async fn persist_or_log(&self, job: &QueuedJob) {
        if let Err(e) = self.persist(job).await {
            error!(job_id = %job.job_id, error = %e, "could not persist job");
        }
    }

    pub async fn forget(&self, job_id: JobId) {
        if let Err(e) = self
            .store
            .delete(JOBS_NAMESPACE, &job_id.to_string())
            .await
        {
            error!(%job_id, error = %e, "could not delete job record");
        }
    }

    pub fn emit(&self, event: QueueEvent) {
        self.events.emit(&event);
        for sink in &self.sinks {
            sink.emit(&event);
        }
    }

    pub fn job_error(&self, job: &QueuedJob, error: &OcrError) -> JobError {
        let class = self.failures.policy().classify(error);
        JobError {
            code: error.code(),
            class,
            message: error.to_string(),
            retryable: class != FailureClass::Permanent,
            tracking_id: job.tracking_id.clone(),
        }
    }

    /// Queue lifecycle transition. Call with the book locked.
    fn transition_queue(&self, to: QueueState) -> Result<QueueState, QueueError> {
        let from = *self.state.borrow();
        if !from.can_transition_to(to) {
            return Err(QueueError::InvalidQueueState { from, to });
        }
        self.state.send_replace(to);
        self.emit(QueueEvent::QueueStateChanged { from, to });
        Ok(from)
    }
}

/// Owned, cloneable handle to one queue instance.
#[derive(Clone)]
pub struct ProcessingQueue {
    pub(super) inner: Arc<Inner>,
}

impl ProcessingQueue {
    pub(crate) fn from_parts(parts: QueueParts) -> Self {
        let concurrency = parts.config.concurrency.max(1);
        let events = BroadcastSink::new(parts.config.event_capacity);
        let (state, _) = watch::channel(QueueState::Stopped);
        Self {
            inner: Arc::new(Inner {
                config: parts.config,
                book: Mutex::new(Book::default()),
                state,
                wake: Notify::new(),
                permits: Arc::new(Semaphore::new(concurrency)),
                backend: parts.backend,
                store: parts.store,
                clock: parts.clock,
                ids: parts.ids,
                polling: parts.polling,
                failures: Arc::new(parts.failures),
                cache: Arc::new(parts.cache),
                registry: parts.registry,
                events,
                sinks: parts.sinks,
                stats: StatsCounters::default(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.inner.cache
    }

    pub fn failures(&self) -> &FailedRequestStore {
        &self.inner.failures
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.inner.registry
    }

    /// Validate, persist and queue a submission.
    pub async fn enqueue(
        &self,
        submission: Submission,
        priority: Priority,
    ) -> Result<JobId, QueueError> {
        let inner = &self.inner;
        if submission.content.is_empty() {
            return Err(QueueError::InvalidSubmission(
                "document content is empty".into(),
            ));
        }
        let limit = inner.config.max_document_bytes;
        if submission.content.len() > limit {
            return Err(QueueError::InvalidSubmission(format!(
                "document is {} bytes, limit is {limit}",
                submission.content.len()
            )));
        }

        let job_id = inner.ids.generate_job_id();
        {
            let mut book = inner.book.lock().await;
            let sequence = book.take_sequence();
            let job = QueuedJob::new(job_id, submission, priority, sequence, inner.clock.now());
            inner.persist(&job).await?;

            book.ready.push(ReadyEntry {
                priority,
                sequence,
                job_id,
            });
            inner.emit(QueueEvent::JobQueued {
                job: job.snapshot(),
            });
            book.jobs.insert(job_id, job);
        }
        inner.wake.notify_one();
        Ok(job_id)
    }

    /// Move the best Queued job to Processing.
    ///
    /// Returns `None` unless the queue is Running. A job whose content is
    /// already being processed by another job waits for that one to finish.
    pub(crate) async fn dequeue_for_processing(&self) -> Result<Option<JobLease>, QueueError> {
        let inner = &self.inner;
        let mut book = inner.book.lock().await;
        if !inner.state.borrow().accepts_work() {
            return Ok(None);
        }

        let Book {
            jobs, ready, busy, ..
        } = &mut *book;
        let picked = ready.pop_where(|entry| match jobs.get(&entry.job_id) {
            Some(job) if job.state == JobState::Queued && job.sequence == entry.sequence => {
                if busy.contains(&job.fingerprint) {
                    Take::Later
                } else {
                    Take::Yes
                }
            }
            _ => Take::Stale,
        });
        let Some(entry) = picked else {
            return Ok(None);
        };
        let Some(mut job) = book.jobs.get(&entry.job_id).cloned() else {
            return Ok(None);
        };

        job.start(inner.clock.now())?;
        if let Err(e) = inner.persist(&job).await {
            book.ready.push(entry);
            return Err(e.into());
        }

        let cancel = CancellationToken::new();
        book.in_flight.insert(job.job_id, cancel.clone());
        book.busy.insert(job.fingerprint.clone());
        inner.emit(QueueEvent::JobStateChanged {
            job: job.snapshot(),
            from: JobState::Queued,
            to: JobState::Processing,
        });
        book.jobs.insert(job.job_id, job.clone());
        debug!(
            job_id = %job.job_id,
            priority = ?job.priority,
            ready = book.ready.len(),
            "job dequeued"
        );
        Ok(Some(JobLease { job, cancel }))
    }

    /// Cancel the job and keep its Cancelled record.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobSnapshot, QueueError> {
        let inner = &self.inner;
        let snapshot = {
            let mut book = inner.book.lock().await;
            let mut job = book
                .jobs
                .get(&job_id)
                .cloned()
                .ok_or(QueueError::JobNotFound(job_id))?;
            let from = job.state;
            job.cancel(inner.clock.now())?;
            inner.persist(&job).await?;

            if let Some(token) = book.in_flight.get(&job_id) {
                token.cancel();
            }
            inner.stats.record_cancel();
            let snapshot = job.snapshot();
            inner.emit(QueueEvent::JobStateChanged {
                job: snapshot.clone(),
                from,
                to: JobState::Cancelled,
            });
            book.jobs.insert(job_id, job);
            snapshot
        };
        inner.failures.remove(job_id).await?;
        info!(%job_id, "job cancelled");
        Ok(snapshot)
    }

    /// Delete the job. A Queued or Processing job is cancelled first.
    pub async fn remove(&self, job_id: JobId) -> Result<JobSnapshot, QueueError> {
        let inner = &self.inner;
        let snapshot = {
            let mut book = inner.book.lock().await;
            let mut job = book
                .jobs
                .get(&job_id)
                .cloned()
                .ok_or(QueueError::JobNotFound(job_id))?;

            if !job.state.is_terminal() {
                let from = job.state;
                job.cancel(inner.clock.now())?;
                if let Some(token) = book.in_flight.get(&job_id) {
                    token.cancel();
                }
                inner.stats.record_cancel();
                inner.emit(QueueEvent::JobStateChanged {
                    job: job.snapshot(),
                    from,
                    to: JobState::Cancelled,
                });
            }

            inner
                .store
                .delete(JOBS_NAMESPACE, &job_id.to_string())
                .await?;
            book.jobs.remove(&job_id);
            job.snapshot()
        };
        inner.failures.remove(job_id).await?;
        debug!(%job_id, "job removed");
        Ok(snapshot)
    }

    /// Failed -> Queued. Rejected for Permanent failures.
    pub async fn retry(&self, job_id: JobId) -> Result<JobSnapshot, QueueError> {
        let inner = &self.inner;
        let snapshot = {
            let mut book = inner.book.lock().await;
            let job = book
                .jobs
                .get(&job_id)
                .cloned()
                .ok_or(QueueError::JobNotFound(job_id))?;
            if let Some(err) = &job.last_error
                && job.state == JobState::Failed
                && !err.retryable
            {
                return Err(QueueError::NotRetryable {
                    job_id,
                    reason: err.message.clone(),
                });
            }
            self.requeue_locked(&mut book, job).await?
        };
        inner.failures.mark_retry_attempt(job_id).await?;
        inner.wake.notify_one();
        info!(%job_id, retry_count = snapshot.retry_count, "job retried");
        Ok(snapshot)
    }

    /// Failed -> Queued with a fresh sequence. Call with the book locked.
    pub(super) async fn requeue_locked(
        &self,
        book: &mut Book,
        mut job: QueuedJob,
    ) -> Result<JobSnapshot, QueueError> {
        let inner = &self.inner;
        let from = job.state;
        let sequence = book.take_sequence();
        job.requeue(sequence)?;
        inner.persist(&job).await?;

        book.ready.push(ReadyEntry {
            priority: job.priority,
            sequence,
            job_id: job.job_id,
        });
        let snapshot = job.snapshot();
        inner.emit(QueueEvent::JobStateChanged {
            job: snapshot.clone(),
            from,
            to: JobState::Queued,
        });
        book.jobs.insert(job.job_id, job);
        Ok(snapshot)
    }

    /// Remove every terminal job. Returns how many were removed.
    pub async fn clear_completed(&self) -> Result<usize, QueueError> {
        let inner = &self.inner;
        let removed: Vec<JobId> = {
            let mut book = inner.book.lock().await;
            let ids: Vec<JobId> = book
                .jobs
                .values()
                .filter(|j| j.state.is_terminal())
                .map(|j| j.job_id)
                .collect();
            for id in &ids {
                inner.store.delete(JOBS_NAMESPACE, &id.to_string()).await?;
                book.jobs.remove(id);
            }
            ids
        };
        for id in &removed {
            inner.failures.remove(*id).await?;
        }
        debug!(removed = removed.len(), "cleared terminal jobs");
        Ok(removed.len())
    }

    pub async fn get(&self, job_id: JobId) -> Option<JobSnapshot> {
        self.inner
            .book
            .lock()
            .await
            .jobs
            .get(&job_id)
            .map(QueuedJob::snapshot)
    }

    /// All jobs, oldest first.
    pub async fn jobs(&self) -> Vec<JobSnapshot> {
        let book = self.inner.book.lock().await;
        let mut all: Vec<JobSnapshot> = book.jobs.values().map(QueuedJob::snapshot).collect();
        all.sort_by_key(|j| (j.enqueued_at, j.job_id));
        all
    }

    pub async fn counts(&self) -> QueueCounts {
        let book = self.inner.book.lock().await;
        let mut counts = QueueCounts::default();
        for job in book.jobs.values() {
            counts.add(job.state);
        }
        counts
    }

    pub async fn in_flight(&self) -> usize {
        self.inner.book.lock().await.in_flight.len()
    }

    pub fn statistics(&self) -> QueueStatistics {
        self.inner.stats.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn queue_state(&self) -> QueueState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<QueueState> {
        self.inner.state.subscribe()
    }

    /// Stopped -> Running. Spawns the worker and housekeeping loops.
    pub async fn start(&self) -> Result<(), QueueError> {
        let inner = &self.inner;
        let mut book = inner.book.lock().await;
        inner.transition_queue(QueueState::Running)?;

        let run = CancellationToken::new();
        book.run = Some(run.clone());
        inner.tasks.reopen();
        inner.tasks.spawn(worker_loop(self.clone(), run.clone()));
        inner.tasks.spawn(housekeeping_loop(self.clone(), run));
        info!(concurrency = inner.config.concurrency, "queue started");
        Ok(())
    }

    /// Running -> Paused. In-flight jobs keep running.
    pub async fn pause(&self) -> Result<(), QueueError> {
        let _book = self.inner.book.lock().await;
        self.inner.transition_queue(QueueState::Paused)?;
        info!("queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), QueueError> {
        {
            let _book = self.inner.book.lock().await;
            self.inner.transition_queue(QueueState::Running)?;
        }
        self.inner.wake.notify_one();
        info!("queue resumed");
        Ok(())
    }

    /// Graceful stop. In-flight jobs get until the shutdown deadline, after
    /// which they are interrupted and end Failed with a transient error.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let inner = &self.inner;
        {
            let mut book = inner.book.lock().await;
            inner.transition_queue(QueueState::Stopping)?;
            if let Some(run) = book.run.take() {
                run.cancel();
            }
        }

        inner.tasks.close();
        let deadline = inner.config.shutdown_timeout();
        if tokio::time::timeout(deadline, inner.tasks.wait())
            .await
            .is_err()
        {
            let interrupted = {
                let book = inner.book.lock().await;
                for token in book.in_flight.values() {
                    token.cancel();
                }
                book.in_flight.len()
            };
            warn!(interrupted, ?deadline, "shutdown deadline exceeded");
            inner.tasks.wait().await;
        }

        let _book = inner.book.lock().await;
        inner.transition_queue(QueueState::Stopped)?;
        info!("queue stopped");
        Ok(())
    }

    /// Reload jobs, failed requests and cache entries from the store.
    ///
    /// Jobs already known in memory are left alone. Jobs that were
    /// Processing become Failed with an `Interrupted` error and are recorded
    /// as failed requests, so automatic retry picks them up.
    pub async fn restore(&self) -> Result<RestoreReport, QueueError> {
        let inner = &self.inner;
        let mut report = RestoreReport {
            failed_requests: inner.failures.restore().await?,
            cache_entries: inner.cache.restore().await?,
            ..RestoreReport::default()
        };

        let (mut stored, broken) =
            list_json::<QueuedJob>(inner.store.as_ref(), JOBS_NAMESPACE).await?;
        for key in &broken {
            warn!(key = %key, "skipping undecodable job record");
        }
        report.skipped = broken.len();
        stored.sort_by_key(|j| j.sequence);

        let mut interrupted = Vec::new();
        {
            let mut book = inner.book.lock().await;
            for mut job in stored {
                if book.jobs.contains_key(&job.job_id) {
                    continue;
                }
                book.next_sequence = book.next_sequence.max(job.sequence + 1);
                match job.state {
                    JobState::Queued => {
                        book.ready.push(ReadyEntry {
                            priority: job.priority,
                            sequence: job.sequence,
                            job_id: job.job_id,
                        });
                        report.queued += 1;
                    }
                    JobState::Processing => {
                        let err = OcrError::Interrupted(
                            "process exited while the job was processing".into(),
                        );
                        let job_error = inner.job_error(&job, &err);
                        job.fail(inner.clock.now(), job_error)?;
                        inner.persist_or_log(&job).await;
                        interrupted.push((job.clone(), err));
                        report.interrupted += 1;
                    }
                    _ => {}
                }
                report.jobs += 1;
                book.jobs.insert(job.job_id, job);
            }
        }

        for (job, err) in &interrupted {
            inner.failures.record(job, err).await?;
        }
        if report.interrupted > 0 {
            report.failed_requests = inner.failures.len().await;
        }
        if report.queued > 0 {
            inner.wake.notify_one();
        }
        info!(
            jobs = report.jobs,
            queued = report.queued,
            interrupted = report.interrupted,
            failed_requests = report.failed_requests,
            cache_entries = report.cache_entries,
            "queue restored"
        );
        Ok(report)
    }
}
