//! PipelineBuilder - キューの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 省略された協調者には開発用の既定実装を使う

use std::sync::Arc;

use crate::cache::ResultCache;
use crate::config::OcrflowConfig;
use crate::domain::DocumentType;
use crate::impls::{CircuitBreakerBackend, InMemoryStore};
use crate::polling::PollingEngine;
use crate::ports::{Clock, DurableStore, EventSink, IdGenerator, OcrBackend, SystemClock, UlidGenerator};
use crate::processors::{
    DocumentProcessor, DynProcessor, ProcessorError, ProcessorMetadata, ProcessorRegistry,
    TypedProcessor, register_builtin,
};
use crate::retry::FailedRequestStore;

use super::queue::{ProcessingQueue, QueueParts};

/// PipelineBuilder は ProcessingQueue を構築
///
/// # 使用例
/// ```ignore
/// let queue = PipelineBuilder::new()
///     .backend(Arc::new(MyBackend::new()))
///     .with_builtin_processors()
///     .expect_processors(&["receipt", "w4"])
///     .build()
///     .await?;
/// ```
///
/// # Fail-fast 設計
/// - expect_processors() で期待されるドキュメント種別を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
///
/// # 既定値
/// - store: `InMemoryStore`
/// - clock: `SystemClock`
/// - id generator: `UlidGenerator`
pub struct PipelineBuilder {
    config: OcrflowConfig,
    backend: Option<Arc<dyn OcrBackend>>,
    store: Option<Arc<dyn DurableStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    sinks: Vec<Arc<dyn EventSink>>,
    processors: Vec<(Arc<dyn DynProcessor>, ProcessorMetadata)>,
    builtin_processors: bool,
    expected_processors: Option<Vec<String>>,
}

/// BuildError はキュー構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("No OCR backend configured. Call PipelineBuilder::backend() before build().")]
    MissingBackend,

    #[error("Missing processors: {0:?}. These document types were expected but not registered.")]
    MissingProcessors(Vec<String>),

    #[error("processor failed to initialize: {0}")]
    Processor(#[from] ProcessorError),
}

impl PipelineBuilder {
    /// 新しい PipelineBuilder を作成
    pub fn new() -> Self {
        Self {
            config: OcrflowConfig::default(),
            backend: None,
            store: None,
            clock: None,
            ids: None,
            sinks: Vec::new(),
            processors: Vec::new(),
            builtin_processors: false,
            expected_processors: None,
        }
    }

    pub fn with_config(mut self, config: OcrflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config_mut(&mut self) -> &mut OcrflowConfig {
        &mut self.config
    }

    pub fn backend(mut self, backend: Arc<dyn OcrBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// 通知の購読者を追加（broadcast チャネルとは別に同期的に呼ばれる）
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Processor を登録
    ///
    /// # Example
    /// ```ignore
    /// builder.register(InvoiceProcessor::new())
    /// ```
    pub fn register<P: DocumentProcessor>(mut self, processor: P) -> Self {
        let metadata = processor.metadata();
        self.processors
            .push((Arc::new(TypedProcessor::new(processor)), metadata));
        self
    }

    /// receipt / w4 / form1040 を登録
    pub fn with_builtin_processors(mut self) -> Self {
        self.builtin_processors = true;
        self
    }

    /// 期待されるドキュメント種別のリストを設定
    ///
    /// # Example
    /// ```ignore
    /// builder.expect_processors(&["receipt", "w4"])
    /// ```
    pub fn expect_processors(mut self, document_types: &[&str]) -> Self {
        self.expected_processors = Some(
            document_types
                .iter()
                .map(|t| DocumentType::new(*t).as_str().to_string())
                .collect(),
        );
        self
    }

    /// PipelineBuilder を構築して ProcessingQueue を生成
    ///
    /// # 検証
    /// - backend() が呼ばれているかチェック
    /// - expect_processors() で設定された種別が全て登録されているかチェック
    ///
    /// キューは Stopped 状態で返ります。必要なら `restore()` してから `start()` します。
    pub async fn build(self) -> Result<ProcessingQueue, BuildError> {
        let backend = self.backend.ok_or(BuildError::MissingBackend)?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store: Arc<dyn DurableStore> = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let backend: Arc<dyn OcrBackend> = match &self.config.circuit_breaker {
            Some(breaker) => Arc::new(CircuitBreakerBackend::new(
                backend,
                breaker.clone(),
                Arc::clone(&clock),
            )),
            None => backend,
        };

        let registry = ProcessorRegistry::new(self.config.processors.clone());
        if self.builtin_processors {
            register_builtin(&registry).await?;
        }
        for (processor, metadata) in self.processors {
            registry.register_dyn(processor, metadata).await;
        }

        if let Some(expected) = &self.expected_processors {
            let mut missing = Vec::new();
            for document_type in expected {
                if !registry
                    .contains(&DocumentType::new(document_type.as_str()))
                    .await
                {
                    missing.push(document_type.clone());
                }
            }
            if !missing.is_empty() {
                return Err(BuildError::MissingProcessors(missing));
            }
        }

        let config = self.config;
        Ok(ProcessingQueue::from_parts(QueueParts {
            polling: PollingEngine::new(config.polling.clone()),
            failures: FailedRequestStore::new(
                config.retry.clone(),
                Arc::clone(&store),
                Arc::clone(&clock),
            ),
            cache: ResultCache::new(config.cache.clone(), Arc::clone(&store), Arc::clone(&clock)),
            registry: Arc::new(registry),
            config: config.queue,
            backend,
            store,
            clock,
            ids,
            sinks: self.sinks,
        }))
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
