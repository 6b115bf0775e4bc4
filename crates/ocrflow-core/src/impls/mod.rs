//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryStore** / **FileStore**: DurableStore（テスト用 / ローカル永続化）
//! - **BroadcastSink** / **TracingSink**: EventSink
//! - **ScriptedBackend**: 台本どおりに応答する OcrBackend（テスト・デモ用）
//! - **CircuitBreakerBackend**: 任意の OcrBackend を包むサーキットブレーカー
//!
//! 実際の OCR サービスへのクライアントはこのクレートには含めません。

pub mod circuit_breaker;
pub mod file_store;
pub mod inmem_store;
pub mod scripted_backend;
pub mod sinks;

pub use self::circuit_breaker::{BreakerState, CircuitBreakerBackend, CircuitBreakerConfig};
pub use self::file_store::FileStore;
pub use self::inmem_store::InMemoryStore;
pub use self::scripted_backend::{ScriptStep, ScriptedBackend};
pub use self::sinks::{BroadcastSink, TracingSink};
