//! DurableStore port - キューとキャッシュの状態をプロセス再起動後も残す
//!
//! "namespace + key -> serialized record" 以上のスキーマは要求しません。

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::StoreError;

pub const JOBS_NAMESPACE: &str = "jobs";
pub const FAILED_NAMESPACE: &str = "failed";
pub const CACHE_NAMESPACE: &str = "cache";

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError>;

    /// All records in a namespace (order unspecified).
    async fn list(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

/// JSON helpers on top of the byte-level port.
pub(crate) async fn put_json<T: Serialize + ?Sized>(
    store: &dyn DurableStore,
    namespace: &str,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    store.put(namespace, key, bytes).await
}

/// Decode every record of a namespace. Records that fail to decode are
/// skipped and reported back by key so the caller can log them.
pub(crate) async fn list_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    namespace: &str,
) -> Result<(Vec<T>, Vec<String>), StoreError> {
    let mut values = Vec::new();
    let mut broken = Vec::new();
    for (key, bytes) in store.list(namespace).await? {
        match serde_json::from_slice(&bytes) {
            Ok(v) => values.push(v),
            Err(_) => broken.push(key),
        }
    }
    Ok((values, broken))
}
