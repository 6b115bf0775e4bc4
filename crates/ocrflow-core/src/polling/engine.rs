//! PollingEngine - 終端状態までステータスを問い合わせ続ける
//!
//! # アルゴリズム
//! 1. キャンセル確認 → 操作を実行（実行中もキャンセルと競合させる）
//! 2. 進捗コールバック → 完了判定なら返す
//! 3. 試行回数・経過時間の上限を確認
//! 4. `min(initial * multiplier^attempt, max_interval)` だけ待つ（待機中もキャンセルを監視）
//!
//! 待機は残り時間で切り詰めるので、期限ちょうどに最後の 1 回を実行してから
//! `Timeout` になります。

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::config::PollingConfig;

/// Successful poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome<T> {
    pub value: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Why polling stopped without a complete value.
#[derive(Debug, Error)]
pub enum PollError<T, E> {
    #[error("polling timed out after {elapsed:?} ({attempts} attempts)")]
    Timeout {
        elapsed: Duration,
        attempts: u32,
        last: Option<T>,
    },

    #[error("polling gave up after {attempts} attempts")]
    AttemptsExhausted {
        elapsed: Duration,
        attempts: u32,
        last: Option<T>,
    },

    #[error("polling cancelled after {elapsed:?}")]
    Cancelled { elapsed: Duration, attempts: u32 },

    #[error("poll operation failed: {0}")]
    Operation(E),
}

impl<T, E> PollError<T, E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PollError::Cancelled { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PollingEngine {
    config: PollingConfig,
}

impl PollingEngine {
    pub fn new(config: PollingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    pub async fn poll<T, E, F, Fut, C>(
        &self,
        operation: F,
        is_complete: C,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome<T>, PollError<T, E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&T) -> bool,
    {
        self.poll_with_progress(operation, is_complete, |_| {}, cancel)
            .await
    }

    /// Like [`poll`](Self::poll), but `on_progress` sees every status
    /// (including the final one) before the completion check.
    pub async fn poll_with_progress<T, E, F, Fut, C, P>(
        &self,
        mut operation: F,
        is_complete: C,
        mut on_progress: P,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome<T>, PollError<T, E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&T) -> bool,
        P: FnMut(&T),
    {
        let started = Instant::now();
        let max_duration = self.config.max_duration();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(PollError::Cancelled {
                    elapsed: started.elapsed(),
                    attempts,
                });
            }

            let value = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(PollError::Cancelled { elapsed: started.elapsed(), attempts });
                }
                result = operation() => result.map_err(PollError::Operation)?,
            };
            attempts += 1;
            on_progress(&value);

            if is_complete(&value) {
                let elapsed = started.elapsed();
                debug!(attempts, ?elapsed, "poll complete");
                return Ok(PollOutcome {
                    value,
                    attempts,
                    elapsed,
                });
            }

            if let Some(max_attempts) = self.config.max_attempts
                && attempts >= max_attempts
            {
                return Err(PollError::AttemptsExhausted {
                    elapsed: started.elapsed(),
                    attempts,
                    last: Some(value),
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= max_duration {
                debug!(attempts, ?elapsed, "poll timed out");
                return Err(PollError::Timeout {
                    elapsed,
                    attempts,
                    last: Some(value),
                });
            }

            let delay = self
                .config
                .delay_for(attempts - 1)
                .min(max_duration - elapsed);
            trace!(attempts, ?delay, "waiting for next poll");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(PollError::Cancelled { elapsed: started.elapsed(), attempts });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
