//! HousekeepingLoop - 定期メンテナンス
//!
//! # フロー（1 tick）
//! 1. リトライ上限に達した失敗リクエストを削除
//! 2. リトライ可能になった失敗リクエストを再投入（Failed → Queued）
//! 3. 保持期間を過ぎた Completed / Cancelled ジョブを削除
//! 4. 期限切れのキャッシュエントリを削除

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::ProcessingQueue;
use crate::domain::JobState;

/// What one housekeeping pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HousekeepingReport {
    pub purged: usize,
    pub retried: usize,
    pub pruned: usize,
    pub cache_expired: usize,
}

pub(super) async fn housekeeping_loop(queue: ProcessingQueue, run: CancellationToken) {
    let mut ticker = tokio::time::interval(queue.config().housekeeping_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = run.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let report = queue.run_housekeeping().await;
        if report != HousekeepingReport::default() {
            debug!(?report, "housekeeping");
        }
    }
}

impl ProcessingQueue {
    /// One housekeeping pass. Errors are logged, never returned.
    pub async fn run_housekeeping(&self) -> HousekeepingReport {
        let inner = &self.inner;
        let mut report = HousekeepingReport::default();

        match inner.failures.purge_exhausted().await {
            Ok(purged) => report.purged = purged.len(),
            Err(e) => warn!(error = %e, "could not purge failed requests"),
        }

        if inner.config.auto_retry {
            report.retried = self.retry_eligible().await;
        }
        report.pruned = self.prune_retained().await;

        match inner.cache.cleanup_expired().await {
            Ok(n) => report.cache_expired = n,
            Err(e) => warn!(error = %e, "cache cleanup failed"),
        }
        report
    }

    async fn retry_eligible(&self) -> usize {
        let inner = &self.inner;
        let mut retried = 0;

        for request in inner.failures.eligible().await {
            let job_id = request.request_id;
            let requeued = {
                let mut book = inner.book.lock().await;
                let current = book.jobs.get(&job_id).cloned();
                match current {
                    Some(job) if job.state == JobState::Failed => {
                        Some(self.requeue_locked(&mut book, job).await)
                    }
                    // already requeued by hand
                    Some(job) if !job.state.is_terminal() => None,
                    _ => {
                        drop(book);
                        if let Err(e) = inner.failures.remove(job_id).await {
                            warn!(%job_id, error = %e, "could not drop stale failed request");
                        }
                        continue;
                    }
                }
            };

            match requeued {
                Some(Ok(snapshot)) => {
                    if let Err(e) = inner.failures.mark_retry_attempt(job_id).await {
                        warn!(%job_id, error = %e, "could not update retry bookkeeping");
                    }
                    info!(%job_id, retry_count = snapshot.retry_count, "automatic retry");
                    retried += 1;
                }
                Some(Err(e)) => warn!(%job_id, error = %e, "automatic retry failed"),
                None => {}
            }
        }

        if retried > 0 {
            inner.wake.notify_one();
        }
        retried
    }

    async fn prune_retained(&self) -> usize {
        let inner = &self.inner;
        let retention = chrono::Duration::from_std(inner.config.completed_retention())
            .unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = inner.clock.now().checked_sub_signed(retention) else {
            return 0;
        };

        let mut book = inner.book.lock().await;
        let expired: Vec<_> = book
            .jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Completed | JobState::Cancelled))
            .filter(|j| j.completed_at.is_some_and(|t| t <= cutoff))
            .map(|j| j.job_id)
            .collect();
        for job_id in &expired {
            inner.forget(*job_id).await;
            book.jobs.remove(job_id);
        }
        expired.len()
    }
}
