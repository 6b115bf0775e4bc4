//! Processors - 認識済みテキストをドキュメント種別ごとの構造化データに変換
//!
//! # 構成
//! - **processor**: `DocumentProcessor`（型付き）/ `DynProcessor`（型消去）
//! - **registry**: 種別キー → プロセッサの登録、明示・自動解決
//! - **receipt / w4 / form1040**: 組み込みプロセッサ
//! - **fields**: キーワード確信度、金額・申告区分の解析ヘルパー

pub mod fields;
pub mod form1040;
pub mod processor;
pub mod receipt;
pub mod registry;
pub mod w4;

pub use self::fields::FilingStatus;
pub use self::form1040::{Form1040Data, Form1040Processor};
pub use self::processor::{DocumentProcessor, DynProcessor, ProcessorError, ProcessorMetadata, TypedProcessor};
pub use self::receipt::{LineItem, ReceiptData, ReceiptProcessor};
pub use self::registry::{Candidate, ProcessorRegistry, RegistryConfig, RegistryError};
pub use self::w4::{W4Data, W4Processor};

/// Register the receipt, W-4 and Form 1040 processors.
pub async fn register_builtin(registry: &ProcessorRegistry) -> Result<(), ProcessorError> {
    registry.register(ReceiptProcessor::new()?).await;
    registry.register(W4Processor::new()?).await;
    registry.register(Form1040Processor::new()?).await;
    Ok(())
}
