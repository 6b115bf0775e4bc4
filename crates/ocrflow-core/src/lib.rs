//! ocrflow-core
//!
//! Orchestration core for asynchronous OCR document processing.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, submission, job, state, ocr, events, errors）
//! - **ports**: 抽象化レイヤー（OcrBackend, DurableStore, EventSink, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryStore, FileStore, BroadcastSink, ScriptedBackend, CircuitBreakerBackend）
//! - **polling**: 指数バックオフのステータスポーリング
//! - **retry**: 失敗の分類・リトライ方針・失敗リクエストの保存
//! - **cache**: fingerprint をキーにした結果キャッシュ
//! - **processors**: ドキュメント種別ごとの構造化（レジストリ + 組み込みプロセッサ）
//! - **app**: ProcessingQueue と実行ループ、PipelineBuilder
//! - **config**: 構築時の設定
//!
//! # 使用例
//! ```ignore
//! let queue = PipelineBuilder::new()
//!     .backend(Arc::new(my_backend))
//!     .store(Arc::new(FileStore::new("./data")))
//!     .with_builtin_processors()
//!     .build()
//!     .await?;
//! queue.restore().await?;
//! queue.start().await?;
//! let job_id = queue.enqueue(Submission::new(bytes), Priority::High).await?;
//! ```

pub mod app;
pub mod cache;
pub mod config;
pub mod domain;
pub mod impls;
pub mod polling;
pub mod ports;
pub mod processors;
pub mod retry;
