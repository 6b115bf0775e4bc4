//! FileStore - 1 レコード = 1 JSON ファイルの DurableStore
//!
//! レイアウト: `{root}/{namespace}/{key}.json`
//! 書き込みは一時ファイル + rename なので、途中で落ちても壊れたレコードは残りません。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::StoreError;
use crate::ports::DurableStore;

const EXTENSION: &str = "json";

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, namespace: &str, key: &str) -> Result<PathBuf, StoreError> {
        validate_segment(namespace)?;
        validate_segment(key)?;
        Ok(self
            .root
            .join(namespace)
            .join(format!("{key}.{EXTENSION}")))
    }
}

fn validate_segment(segment: &str) -> Result<(), StoreError> {
    let ok = !segment.is_empty()
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(segment.to_string()))
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let path = self.record_path(namespace, key)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.record_path(namespace, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let path = self.record_path(namespace, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        validate_segment(namespace)?;
        let dir = self.root.join(namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let bytes = tokio::fs::read(&path).await?;
            out.push((key.to_string(), bytes));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_survive_a_new_store_instance() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::new(dir.path());
            store.put("jobs", "job-1", b"{}".to_vec()).await.unwrap();
            store.put("jobs", "job-2", b"[]".to_vec()).await.unwrap();
        }

        let store = FileStore::new(dir.path());
        let mut listed = store.list("jobs").await.unwrap();
        listed.sort();
        assert_eq!(
            listed,
            vec![
                ("job-1".to_string(), b"{}".to_vec()),
                ("job-2".to_string(), b"[]".to_vec()),
            ]
        );

        assert!(store.delete("jobs", "job-1").await.unwrap());
        assert_eq!(store.get("jobs", "job-1").await.unwrap(), None);
        assert!(!store.delete("jobs", "job-1").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let err = store.put("jobs", "../escape", vec![]).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
        assert!(store.get("", "x").await.is_err());
    }

    #[tokio::test]
    async fn missing_namespace_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.list("cache").await.unwrap().is_empty());
    }
}
