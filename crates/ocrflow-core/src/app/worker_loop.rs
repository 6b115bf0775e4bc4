//! WorkerLoop - ジョブ実行ループ
//!
//! 単一のディスパッチループが、並行数の上限（Semaphore）の範囲で
//! Queued ジョブを取り出し、ジョブごとのタスクに渡します。
//!
//! # フロー（ジョブ 1 件）
//! 1. ResultCache を fingerprint で照会（ヒットならバックエンドを呼ばずに完了）
//! 2. OcrBackend::submit() で tracking id を取得
//! 3. PollingEngine で終端ステータスまでポーリング（途中経過は JobProgress で通知）
//! 4. 成功: キャッシュ保存 → ProcessorRegistry で構造化 → Completed
//! 5. 失敗: RetryCoordinator で分類・記録 → Failed
//!
//! どの段階の失敗もジョブ単位で捕まえ、ループ自体は止まりません。

use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::queue::{JobLease, ProcessingQueue};
use crate::domain::{
    Extraction, JobState, OcrError, OcrRequest, OcrResult, OcrStatus, OcrStatusKind, QueueEvent,
    QueuedJob, TrackingId,
};
use crate::polling::PollError;
use crate::polling::config::duration_ms;
use crate::processors::RegistryError;

/// How one processing attempt ended.
#[derive(Debug)]
enum Outcome {
    Completed {
        result: OcrResult,
        extraction: Option<Extraction>,
        from_cache: bool,
    },
    Failed(OcrError),
    /// The job token fired: user cancellation or shutdown deadline.
    Cancelled,
}

pub(super) async fn worker_loop(queue: ProcessingQueue, run: CancellationToken) {
    let inner = &queue.inner;
    info!("worker loop started");

    loop {
        let permit = tokio::select! {
            biased;
            _ = run.cancelled() => break,
            permit = inner.permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let lease = loop {
            match queue.dequeue_for_processing().await {
                Ok(Some(lease)) => break Some(lease),
                Ok(None) => {}
                Err(e) => error!(error = %e, "dequeue failed"),
            }
            tokio::select! {
                biased;
                _ = run.cancelled() => break None,
                _ = inner.wake.notified() => {}
            }
        };
        let Some(lease) = lease else { break };

        inner
            .tasks
            .spawn(process_job(queue.clone(), lease, permit));
    }

    info!("worker loop stopped");
}

/// Runs the job in its own task so that a panic (e.g. inside a registered
/// processor) still reaches `finish` and releases the job's fingerprint.
async fn process_job(queue: ProcessingQueue, lease: JobLease, _permit: OwnedSemaphorePermit) {
    let JobLease { job, cancel } = lease;
    let span = info_span!(
        "job",
        job_id = %job.job_id,
        fingerprint = job.fingerprint.short(),
        retry = job.retry_count,
    );
    async move {
        let attempt = {
            let queue = queue.clone();
            let job = job.clone();
            let cancel = cancel.clone();
            async move { queue.execute(&job, &cancel).await }.in_current_span()
        };
        let outcome = match queue.inner.tasks.spawn(attempt).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                error!(error = %e, "job task panicked");
                Outcome::Failed(OcrError::ProcessingFailed(format!(
                    "job task panicked: {e}"
                )))
            }
            Err(_) => Outcome::Cancelled,
        };
        queue.finish(&job, outcome).await;
    }
    .instrument(span)
    .await
}

impl ProcessingQueue {
    async fn execute(&self, job: &QueuedJob, cancel: &CancellationToken) -> Outcome {
        let inner = &self.inner;

        if let Some(status) = inner.cache.get(&job.fingerprint).await
            && let Some(result) = status.result
        {
            debug!("served from cache");
            let extraction = self.extract(job, &result.text).await;
            return Outcome::Completed {
                result,
                extraction,
                from_cache: true,
            };
        }

        let request = OcrRequest::from_submission(job.job_id, &job.submission);
        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            r = inner.backend.submit(&request) => r,
        };
        let tracking_id = match submitted {
            Ok(id) => id,
            Err(e) => return Outcome::Failed(e),
        };
        debug!(%tracking_id, "submitted");
        self.attach_tracking_id(job, &tracking_id).await;

        let backend = &inner.backend;
        let tracking = &tracking_id;
        let polled = inner
            .polling
            .poll_with_progress(
                move || backend.get_status(tracking),
                OcrStatus::is_terminal,
                |status: &OcrStatus| {
                    inner.emit(QueueEvent::JobProgress {
                        job_id: job.job_id,
                        status: status.clone(),
                    })
                },
                cancel,
            )
            .await;

        let status = match polled {
            Ok(outcome) => {
                debug!(attempts = outcome.attempts, elapsed = ?outcome.elapsed, "polling finished");
                outcome.value
            }
            Err(PollError::Cancelled { .. }) => return Outcome::Cancelled,
            Err(PollError::Operation(e)) => return Outcome::Failed(e),
            Err(
                PollError::Timeout { elapsed, last, .. }
                | PollError::AttemptsExhausted { elapsed, last, .. },
            ) => {
                return Outcome::Failed(OcrError::PollTimeout {
                    elapsed_ms: duration_ms(elapsed),
                    last_status: last.map(Box::new),
                });
            }
        };

        let result = match (status.status, &status.result) {
            (OcrStatusKind::Completed, Some(result)) => result.clone(),
            (OcrStatusKind::Completed, None) => {
                return Outcome::Failed(OcrError::InvalidResponse(
                    "completed status without a result".into(),
                ));
            }
            _ => {
                let reason = status
                    .error
                    .clone()
                    .unwrap_or_else(|| "no reason given".into());
                return Outcome::Failed(OcrError::ProcessingFailed(reason));
            }
        };

        let extraction = self.extract(job, &result.text).await;
        let document_type = extraction
            .as_ref()
            .map(|x| x.document_type.clone())
            .or_else(|| job.submission.document_type.clone());
        if let Err(e) = inner
            .cache
            .put(job.fingerprint.clone(), document_type, status, None)
            .await
        {
            warn!(error = %e, "could not cache result");
        }

        Outcome::Completed {
            result,
            extraction,
            from_cache: false,
        }
    }

    /// Structured extraction. A document type hint selects the processor
    /// directly; without one the registry auto-detects.
    async fn extract(&self, job: &QueuedJob, text: &str) -> Option<Extraction> {
        let registry = &self.inner.registry;
        let attempt = match &job.submission.document_type {
            Some(hint) if registry.contains(hint).await => {
                registry.process_as(hint, text, true).await
            }
            _ => registry.process_auto(text).await,
        };
        match attempt {
            Ok(extraction) => Some(extraction),
            Err(RegistryError::NoConfidentMatch { candidates }) => {
                debug!(candidates = candidates.len(), "no confident document type");
                None
            }
            Err(e) => {
                warn!(error = %e, "extraction failed");
                None
            }
        }
    }

    async fn attach_tracking_id(&self, job: &QueuedJob, tracking_id: &TrackingId) {
        let inner = &self.inner;
        let mut book = inner.book.lock().await;
        if let Some(current) = book.jobs.get_mut(&job.job_id)
            && current.state == JobState::Processing
        {
            current.attach_tracking_id(tracking_id.clone());
            inner.persist_or_log(current).await;
        }
    }

    /// Apply the outcome. Results for jobs cancelled or removed meanwhile
    /// are dropped.
    async fn finish(&self, job: &QueuedJob, outcome: Outcome) {
        let inner = &self.inner;
        let job_id = job.job_id;
        let mut book = inner.book.lock().await;
        book.in_flight.remove(&job_id);
        book.busy.remove(&job.fingerprint);
        inner.wake.notify_one();

        let Some(mut updated) = book.jobs.get(&job_id).cloned() else {
            debug!("job removed while processing");
            return;
        };
        if updated.state != JobState::Processing {
            debug!(state = ?updated.state, "discarding outcome");
            return;
        }

        let now = inner.clock.now();
        let failure = match outcome {
            Outcome::Completed {
                result,
                extraction,
                from_cache,
            } => {
                if let Err(e) = updated.complete(now, result, extraction, from_cache) {
                    error!(error = %e, "could not complete job");
                    return;
                }
                None
            }
            Outcome::Failed(e) => Some(e),
            Outcome::Cancelled => Some(OcrError::Interrupted(
                "queue stopped before the job finished".into(),
            )),
        };
        if let Some(e) = &failure {
            let job_error = inner.job_error(&updated, e);
            if let Err(e) = updated.fail(now, job_error) {
                error!(error = %e, "could not fail job");
                return;
            }
        }

        inner.persist_or_log(&updated).await;
        book.jobs.insert(job_id, updated.clone());

        // subscribers see the failure store already updated
        let duration = updated.processing_duration();
        match &failure {
            None => {
                if let Err(e) = inner.failures.remove(job_id).await {
                    warn!(error = %e, "could not drop failed request");
                }
                inner
                    .stats
                    .record_success(duration, updated.served_from_cache);
            }
            Some(e) => {
                if let Err(store_err) = inner.failures.record(&updated, e).await {
                    error!(error = %store_err, "could not record failed request");
                }
                inner.stats.record_failure(duration);
            }
        }

        let snapshot = updated.snapshot();
        inner.emit(QueueEvent::JobStateChanged {
            job: snapshot.clone(),
            from: JobState::Processing,
            to: snapshot.state,
        });
        if snapshot.state == JobState::Completed {
            inner.emit(QueueEvent::JobCompleted { job: snapshot });
        }
    }
}
