//! App - アプリケーション層
//!
//! このモジュールは、ports と各コンポーネントを組み合わせてキューを実装します。
//!
//! # 主要コンポーネント
//! - **PipelineBuilder**: キューの構築とワイヤリング（起動時検証つき）
//! - **ProcessingQueue**: 投入・状態遷移・ライフサイクル
//! - **WorkerLoop**: ジョブ実行ループ（cache → submit → poll → extract）
//! - **HousekeepingLoop**: 自動リトライ、上限到達分の削除、保持期間、キャッシュ掃除
//! - **Status**: 状態別の件数と処理統計

pub mod builder;
pub mod housekeeping_loop;
pub mod queue;
mod ready;
pub mod status;
mod worker_loop;

#[cfg(test)]
mod scenarios;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, PipelineBuilder};
pub use self::housekeeping_loop::HousekeepingReport;
pub use self::queue::{ProcessingQueue, QueueConfig, RestoreReport};
pub use self::status::{QueueCounts, QueueStatistics};
