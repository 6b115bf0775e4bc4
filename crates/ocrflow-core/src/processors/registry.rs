//! ProcessorRegistry - ドキュメント種別ごとのプロセッサの登録と解決
//!
//! # 解決モード
//! - **明示**: 呼び出し側が種別を指定（`force` で適用判定を無視できる）
//! - **自動**: 有効なプロセッサに優先度の高い順に尋ね、しきい値を超えた最初のものを使う
//!
//! 同じ優先度なら種別キーの辞書順で決めるので、解決結果は常に決定的です。
//! 無効化したプロセッサは自動解決から外れるだけで、明示指定なら使えます。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use super::processor::{DocumentProcessor, DynProcessor, ProcessorError, ProcessorMetadata, TypedProcessor};
use crate::domain::{DocumentType, Extraction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Minimum detection confidence for automatic resolution and for
    /// non-forced explicit processing.
    pub confidence_threshold: f32,
    /// Candidates returned when nothing is confident enough.
    pub top_n: usize,
    /// Priority overrides by document type, applied at registration.
    pub priorities: HashMap<String, i32>,
    /// Document types registered disabled.
    pub disabled: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            top_n: 3,
            priorities: HashMap::new(),
            disabled: Vec::new(),
        }
    }
}

/// One auto-detection answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub document_type: DocumentType,
    pub confidence: f32,
    pub priority: i32,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no processor registered for '{0}'")]
    NotRegistered(DocumentType),

    #[error("processor '{document_type}' does not apply (confidence {confidence:.2})")]
    NotApplicable {
        document_type: DocumentType,
        confidence: f32,
    },

    #[error("no processor is confident enough ({} candidates)", .candidates.len())]
    NoConfidentMatch { candidates: Vec<Candidate> },

    #[error("processor '{document_type}' failed: {source}")]
    Processing {
        document_type: DocumentType,
        #[source]
        source: ProcessorError,
    },
}

struct Registration {
    processor: Arc<dyn DynProcessor>,
    metadata: ProcessorMetadata,
}

pub struct ProcessorRegistry {
    entries: RwLock<BTreeMap<DocumentType, Registration>>,
    config: RegistryConfig,
}

impl ProcessorRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a typed processor with its own metadata. Replaces (and
    /// returns the metadata of) any previous binding for the same type.
    pub async fn register<P: DocumentProcessor>(&self, processor: P) -> Option<ProcessorMetadata> {
        let metadata = processor.metadata();
        self.register_dyn(Arc::new(TypedProcessor::new(processor)), metadata)
            .await
    }

    /// Register an already type-erased processor with explicit metadata.
    pub async fn register_dyn(
        &self,
        processor: Arc<dyn DynProcessor>,
        mut metadata: ProcessorMetadata,
    ) -> Option<ProcessorMetadata> {
        let document_type = DocumentType::new(processor.document_type());
        if let Some(priority) = self.config.priorities.get(document_type.as_str()) {
            metadata.priority = *priority;
        }
        if self
            .config
            .disabled
            .iter()
            .any(|d| DocumentType::new(d.as_str()) == document_type)
        {
            metadata.enabled = false;
        }

        debug!(%document_type, name = %metadata.name, priority = metadata.priority, "processor registered");
        self.entries
            .write()
            .await
            .insert(
                document_type,
                Registration {
                    processor,
                    metadata,
                },
            )
            .map(|previous| previous.metadata)
    }

    pub async fn unregister(&self, document_type: &DocumentType) -> bool {
        self.entries.write().await.remove(document_type).is_some()
    }

    pub async fn set_enabled(
        &self,
        document_type: &DocumentType,
        enabled: bool,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(document_type)
            .ok_or_else(|| RegistryError::NotRegistered(document_type.clone()))?;
        entry.metadata.enabled = enabled;
        Ok(())
    }

    pub async fn set_priority(
        &self,
        document_type: &DocumentType,
        priority: i32,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(document_type)
            .ok_or_else(|| RegistryError::NotRegistered(document_type.clone()))?;
        entry.metadata.priority = priority;
        Ok(())
    }

    pub async fn contains(&self, document_type: &DocumentType) -> bool {
        self.entries.read().await.contains_key(document_type)
    }

    pub async fn metadata(&self, document_type: &DocumentType) -> Option<ProcessorMetadata> {
        self.entries
            .read()
            .await
            .get(document_type)
            .map(|r| r.metadata.clone())
    }

    /// All registrations in resolution order (priority desc, then key).
    pub async fn registered(&self) -> Vec<(DocumentType, ProcessorMetadata)> {
        let entries = self.entries.read().await;
        let mut all: Vec<(DocumentType, ProcessorMetadata)> = entries
            .iter()
            .map(|(k, r)| (k.clone(), r.metadata.clone()))
            .collect();
        all.sort_by(|a, b| b.1.priority.cmp(&a.1.priority).then_with(|| a.0.cmp(&b.0)));
        all
    }

    /// Enabled processors in resolution order.
    async fn enabled_in_order(&self) -> Vec<(DocumentType, i32, Arc<dyn DynProcessor>)> {
        let entries = self.entries.read().await;
        let mut enabled: Vec<_> = entries
            .iter()
            .filter(|(_, r)| r.metadata.enabled)
            .map(|(k, r)| (k.clone(), r.metadata.priority, Arc::clone(&r.processor)))
            .collect();
        // BTreeMap iteration is already key-ordered; stable sort keeps it
        enabled.sort_by(|a, b| b.1.cmp(&a.1));
        enabled
    }

    /// First enabled processor, in priority order, whose confidence reaches
    /// the threshold.
    pub async fn detect(&self, raw: &str) -> Option<Candidate> {
        self.enabled_in_order()
            .await
            .into_iter()
            .find_map(|(document_type, priority, processor)| {
                let confidence = processor.detect(raw);
                (confidence >= self.config.confidence_threshold).then_some(Candidate {
                    document_type,
                    confidence,
                    priority,
                })
            })
    }

    /// Every enabled processor's confidence, best first (ties: priority,
    /// then key), truncated to `top_n` (default from config).
    pub async fn candidates(&self, raw: &str, top_n: Option<usize>) -> Vec<Candidate> {
        let mut all: Vec<Candidate> = self
            .enabled_in_order()
            .await
            .into_iter()
            .map(|(document_type, priority, processor)| Candidate {
                confidence: processor.detect(raw),
                document_type,
                priority,
            })
            .collect();
        all.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then(b.priority.cmp(&a.priority))
                .then_with(|| a.document_type.cmp(&b.document_type))
        });
        all.truncate(top_n.unwrap_or(self.config.top_n));
        all
    }

    /// Explicit mode. Without `force`, a processor whose own detection is
    /// below the threshold refuses the input.
    pub async fn process_as(
        &self,
        document_type: &DocumentType,
        raw: &str,
        force: bool,
    ) -> Result<Extraction, RegistryError> {
        let (processor, metadata) = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(document_type)
                .ok_or_else(|| RegistryError::NotRegistered(document_type.clone()))?;
            (Arc::clone(&entry.processor), entry.metadata.clone())
        };

        let confidence = processor.detect(raw);
        if !force && confidence < self.config.confidence_threshold {
            return Err(RegistryError::NotApplicable {
                document_type: document_type.clone(),
                confidence,
            });
        }
        run(processor.as_ref(), &metadata, document_type, confidence, raw).await
    }

    /// Automatic mode. When nothing is confident, the error carries the
    /// top candidates so the caller can disambiguate.
    pub async fn process_auto(&self, raw: &str) -> Result<Extraction, RegistryError> {
        let Some(best) = self.detect(raw).await else {
            return Err(RegistryError::NoConfidentMatch {
                candidates: self.candidates(raw, None).await,
            });
        };

        let (processor, metadata) = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(&best.document_type)
                .ok_or_else(|| RegistryError::NotRegistered(best.document_type.clone()))?;
            (Arc::clone(&entry.processor), entry.metadata.clone())
        };
        run(processor.as_ref(), &metadata, &best.document_type, best.confidence, raw).await
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

async fn run(
    processor: &dyn DynProcessor,
    metadata: &ProcessorMetadata,
    document_type: &DocumentType,
    confidence: f32,
    raw: &str,
) -> Result<Extraction, RegistryError> {
    let data = processor
        .process_dyn(raw)
        .await
        .map_err(|source| RegistryError::Processing {
            document_type: document_type.clone(),
            source,
        })?;
    Ok(Extraction {
        document_type: document_type.clone(),
        processor: metadata.name.clone(),
        processor_version: metadata.version.clone(),
        confidence,
        data,
    })
}
