//! Ports - 抽象化レイヤー
//!
//! 外部の協調者（OCR バックエンド、永続ストア、通知の購読者、時計）への
//! インターフェースを定義し、実装の詳細を隠蔽します。

pub mod clock;
pub mod durable_store;
pub mod event_sink;
pub mod id_generator;
pub mod ocr_backend;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::durable_store::{CACHE_NAMESPACE, DurableStore, FAILED_NAMESPACE, JOBS_NAMESPACE};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::ocr_backend::OcrBackend;
