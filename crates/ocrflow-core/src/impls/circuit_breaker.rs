//! CircuitBreakerBackend - OcrBackend を包むサーキットブレーカー
//!
//! 一時的な失敗が `failure_threshold` 回連続したら `cooldown` の間 open になり、
//! バックエンドを呼ばずに `Unavailable` を返します。cooldown 明けは 1 回だけ
//! 呼び出しを通し（half-open）、その結果が出るまで他の呼び出しは即座に失敗します。
//! 試しの呼び出しが応答すれば closed、一時的な失敗なら再び open です。
//! 結果が返らないまま cooldown が過ぎたら、次の呼び出しを新しい試しとして通します。
//!
//! 恒久的な失敗（内容の拒否など）はバックエンドの健全性とは無関係なので数えません。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{FailureClass, OcrError, OcrRequest, OcrStatus, TrackingId};
use crate::ports::{Clock, OcrBackend};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: DateTime<Utc> },
    /// One probe call is in flight.
    HalfOpen { probe_started: DateTime<Utc> },
}

pub struct CircuitBreakerBackend<B> {
    inner: B,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

impl<B: OcrBackend> CircuitBreakerBackend<B> {
    pub fn new(inner: B, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            config,
            clock,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub async fn state(&self) -> BreakerState {
        *self.state.lock().await
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.cooldown()).unwrap_or(chrono::Duration::zero())
    }

    async fn before_call(&self) -> Result<(), OcrError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        match *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { until } if now < until => {
                Err(OcrError::Unavailable("circuit open".to_string()))
            }
            BreakerState::HalfOpen { probe_started } if now < probe_started + self.cooldown() => {
                Err(OcrError::Unavailable("circuit half-open".to_string()))
            }
            BreakerState::Open { .. } | BreakerState::HalfOpen { .. } => {
                info!("circuit half-open, probing backend");
                *state = BreakerState::HalfOpen { probe_started: now };
                Ok(())
            }
        }
    }

    async fn after_call<T>(&self, result: &Result<T, OcrError>) {
        let mut state = self.state.lock().await;
        match result {
            Ok(_) => {
                if *state != (BreakerState::Closed { consecutive_failures: 0 }) {
                    info!("circuit closed");
                }
                *state = BreakerState::Closed {
                    consecutive_failures: 0,
                };
            }
            Err(e) if e.failure_class() == FailureClass::Transient => {
                let failures = match *state {
                    BreakerState::Closed {
                        consecutive_failures,
                    } => consecutive_failures + 1,
                    // a failed probe re-opens immediately
                    BreakerState::HalfOpen { .. } | BreakerState::Open { .. } => {
                        self.config.failure_threshold
                    }
                };
                if failures >= self.config.failure_threshold {
                    let until = self.clock.now() + self.cooldown();
                    warn!(failures, %until, error = %e, "circuit opened");
                    *state = BreakerState::Open { until };
                } else {
                    *state = BreakerState::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            // the backend answered, it just refused this request
            Err(_) => {
                if matches!(*state, BreakerState::HalfOpen { .. }) {
                    info!("circuit closed");
                    *state = BreakerState::Closed {
                        consecutive_failures: 0,
                    };
                }
            }
        }
    }
}

#[async_trait]
impl<B: OcrBackend> OcrBackend for CircuitBreakerBackend<B> {
    async fn submit(&self, request: &OcrRequest) -> Result<TrackingId, OcrError> {
        self.before_call().await?;
        let result = self.inner.submit(request).await;
        self.after_call(&result).await;
        result
    }

    async fn get_status(&self, tracking_id: &TrackingId) -> Result<OcrStatus, OcrError> {
        self.before_call().await?;
        let result = self.inner.get_status(tracking_id).await;
        self.after_call(&result).await;
        result
    }
}
