//! DocumentProcessor trait - 生テキストを型付きの抽出結果に変換する
//!
//! # 二層構造
//! - **表層（Typed）**: `DocumentProcessor` - 出力型が静的に決まる
//! - **内部（Dyn）**: `DynProcessor` - object-safe、出力は JSON に消去
//!
//! `TypedProcessor<P>` が前者を後者に変換するので、レジストリは
//! `Arc<dyn DynProcessor>` だけを扱えばよくなります。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure inside a processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("required field missing: {0}")]
    MissingField(&'static str),

    #[error("could not parse {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("output encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Display metadata of a registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorMetadata {
    pub name: String,
    pub version: String,
    /// Higher is consulted first during auto-detection.
    pub priority: i32,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub supported_extensions: Vec<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl ProcessorMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            priority,
            capabilities: Vec::new(),
            supported_extensions: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.supported_extensions = extensions.iter().map(|e| e.to_string()).collect();
        self
    }
}

/// A typed document processor.
///
/// # 使用例
/// ```ignore
/// struct InvoiceProcessor;
///
/// #[async_trait]
/// impl DocumentProcessor for InvoiceProcessor {
///     const DOCUMENT_TYPE: &'static str = "invoice";
///     type Output = InvoiceData;
///
///     fn metadata(&self) -> ProcessorMetadata { ProcessorMetadata::new("Invoice", "1.0.0", 10) }
///     fn detect(&self, raw: &str) -> f32 { keyword_score(raw, &[("invoice", 0.8)]) }
///     async fn process(&self, raw: &str) -> Result<InvoiceData, ProcessorError> { ... }
/// }
/// ```
#[async_trait]
pub trait DocumentProcessor: Send + Sync + 'static {
    /// Registry key (lowercase).
    const DOCUMENT_TYPE: &'static str;

    type Output: Serialize + Send;

    fn metadata(&self) -> ProcessorMetadata;

    /// Confidence in `[0, 1]` that `raw` is this document type.
    fn detect(&self, raw: &str) -> f32;

    async fn process(&self, raw: &str) -> Result<Self::Output, ProcessorError>;
}

/// Object-safe processor with the output erased to JSON.
#[async_trait]
pub trait DynProcessor: Send + Sync {
    fn document_type(&self) -> &str;

    fn metadata(&self) -> ProcessorMetadata;

    fn detect(&self, raw: &str) -> f32;

    async fn process_dyn(&self, raw: &str) -> Result<serde_json::Value, ProcessorError>;
}

pub struct TypedProcessor<P> {
    processor: P,
}

impl<P: DocumentProcessor> TypedProcessor<P> {
    pub fn new(processor: P) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl<P: DocumentProcessor> DynProcessor for TypedProcessor<P> {
    fn document_type(&self) -> &str {
        P::DOCUMENT_TYPE
    }

    fn metadata(&self) -> ProcessorMetadata {
        self.processor.metadata()
    }

    fn detect(&self, raw: &str) -> f32 {
        self.processor.detect(raw).clamp(0.0, 1.0)
    }

    async fn process_dyn(&self, raw: &str) -> Result<serde_json::Value, ProcessorError> {
        let output = self.processor.process(raw).await?;
        Ok(serde_json::to_value(output)?)
    }
}
