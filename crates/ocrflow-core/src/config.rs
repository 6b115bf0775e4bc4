//! Config - 構築時に渡す設定
//!
//! すべて `#[serde(default)]` なので、JSON では変えたい項目だけを書けば済みます。
//! 時間は `*_ms`（ミリ秒）で表し、各設定型の `Duration` アクセサで読みます。
//!
//! ```json
//! { "queue": { "concurrency": 4 }, "retry": { "max_retries": 5 } }
//! ```

use serde::{Deserialize, Serialize};

use crate::app::QueueConfig;
use crate::cache::CacheConfig;
use crate::impls::CircuitBreakerConfig;
use crate::polling::PollingConfig;
use crate::processors::RegistryConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrflowConfig {
    pub queue: QueueConfig,
    pub polling: PollingConfig,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub processors: RegistryConfig,
    /// Wrap the backend in a circuit breaker. Off when absent.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl OcrflowConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
