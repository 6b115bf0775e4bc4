//! ResultCache - 内容フィンガープリントをキーにした OCR 結果キャッシュ
//!
//! - キーは常に Fingerprint（ジョブ ID ではない）。同じ内容なら別ジョブでも共有
//! - 期限切れは読み取り時に遅延削除し、`cleanup_expired` でもまとめて削除
//! - 上限を超えたら最も古い（stored_at が最小の）エントリから追い出す
//! - 同一キーへの書き込みは後勝ち（同じ内容なら結果も同じ）

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheStats};
use crate::domain::{DocumentType, Fingerprint, OcrStatus, StoreError};
use crate::ports::durable_store::{list_json, put_json};
use crate::ports::{CACHE_NAMESPACE, Clock, DurableStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 24 * 60 * 60 * 1000,
            max_entries: 1000,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

pub struct ResultCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ResultCache {
    pub fn new(config: CacheConfig, store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
            clock,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Cached status for `fingerprint`. An expired entry counts as a miss
    /// and is evicted on the spot.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<OcrStatus> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;

        match entries.get_mut(fingerprint) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) if !entry.is_expired(now) => {
                entry.hit_count = entry.hit_count.saturating_add(1);
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = fingerprint.short(), hits = entry.hit_count, "cache hit");
                return Some(entry.status.clone());
            }
            Some(_) => {}
        }

        entries.remove(fingerprint);
        self.expirations.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = fingerprint.short(), "cache miss (expired)");
        if let Err(e) = self.store.delete(CACHE_NAMESPACE, fingerprint.as_str()).await {
            warn!(fingerprint = fingerprint.short(), error = %e, "failed to delete expired cache record");
        }
        None
    }

    /// Store a status under `fingerprint`, replacing any previous entry.
    /// `ttl` overrides the configured default for this entry only.
    pub async fn put(
        &self,
        fingerprint: Fingerprint,
        document_type: Option<DocumentType>,
        status: OcrStatus,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        let expires_at = now
            .checked_add_signed(chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
        let size_bytes = serde_json::to_vec(&status)?.len();

        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            document_type,
            status,
            stored_at: now,
            expires_at,
            size_bytes,
            hit_count: 0,
        };

        let mut entries = self.entries.write().await;
        if !entries.contains_key(&fingerprint) {
            self.make_room(&mut entries, now).await?;
        }
        put_json(self.store.as_ref(), CACHE_NAMESPACE, fingerprint.as_str(), &entry).await?;
        entries.insert(fingerprint, entry);
        Ok(())
    }

    /// Drop expired entries first, then the oldest ones, until there is room
    /// for one more.
    async fn make_room(
        &self,
        entries: &mut HashMap<Fingerprint, CacheEntry>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StoreError> {
        let max = self.config.max_entries.max(1);
        if entries.len() < max {
            return Ok(());
        }

        let expired: Vec<Fingerprint> = entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.fingerprint.clone())
            .collect();
        for fp in expired {
            entries.remove(&fp);
            self.store.delete(CACHE_NAMESPACE, fp.as_str()).await?;
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }

        while entries.len() >= max {
            let Some(oldest) = entries
                .values()
                .min_by_key(|e| e.stored_at)
                .map(|e| e.fingerprint.clone())
            else {
                break;
            };
            entries.remove(&oldest);
            self.store.delete(CACHE_NAMESPACE, oldest.as_str()).await?;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = oldest.short(), "cache eviction (capacity)");
        }
        Ok(())
    }

    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        if entries.remove(fingerprint).is_none() {
            return Ok(false);
        }
        self.store.delete(CACHE_NAMESPACE, fingerprint.as_str()).await?;
        Ok(true)
    }

    /// Remove every entry stored for `document_type`.
    pub async fn invalidate_document_type(
        &self,
        document_type: &DocumentType,
    ) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        let matching: Vec<Fingerprint> = entries
            .values()
            .filter(|e| e.document_type.as_ref() == Some(document_type))
            .map(|e| e.fingerprint.clone())
            .collect();
        for fp in &matching {
            entries.remove(fp);
            self.store.delete(CACHE_NAMESPACE, fp.as_str()).await?;
        }
        debug!(%document_type, removed = matching.len(), "cache invalidated by document type");
        Ok(matching.len())
    }

    /// Drop every entry. On a store error the entries already deleted are
    /// gone from memory too; the rest stay in both.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        let keys: Vec<Fingerprint> = entries.keys().cloned().collect();
        let mut removed = 0;
        for fp in keys {
            self.store.delete(CACHE_NAMESPACE, fp.as_str()).await?;
            entries.remove(&fp);
            removed += 1;
        }
        Ok(removed)
    }

    /// Proactive expiry sweep. Returns the number of entries removed.
    pub async fn cleanup_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let expired: Vec<Fingerprint> = entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.fingerprint.clone())
            .collect();
        for fp in &expired {
            entries.remove(fp);
            self.store.delete(CACHE_NAMESPACE, fp.as_str()).await?;
        }
        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        if !expired.is_empty() {
            debug!(removed = expired.len(), "cache cleanup");
        }
        Ok(expired.len())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Entry metadata without touching the hit/miss counters.
    pub async fn peek(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.entries.read().await.get(fingerprint).cloned()
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_size_bytes: usize = entries.values().map(|e| e.size_bytes).sum();
        let lookups = hits + misses;

        CacheStats {
            entries: entries.len(),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            average_entry_size: if entries.is_empty() {
                0.0
            } else {
                total_size_bytes as f64 / entries.len() as f64
            },
            total_size_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Reload entries from the durable store, dropping the ones that expired
    /// while the process was down. Returns how many live entries were loaded.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let (records, broken) = list_json::<CacheEntry>(self.store.as_ref(), CACHE_NAMESPACE).await?;
        for key in broken {
            warn!(%key, "dropping unreadable cache record");
            self.store.delete(CACHE_NAMESPACE, &key).await?;
        }

        let mut entries = self.entries.write().await;
        let mut loaded = 0;
        for record in records {
            if record.is_expired(now) {
                self.store
                    .delete(CACHE_NAMESPACE, record.fingerprint.as_str())
                    .await?;
                continue;
            }
            entries.insert(record.fingerprint.clone(), record);
            loaded += 1;
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OcrResult, TrackingId};
    use crate::impls::InMemoryStore;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        clock: Arc<FixedClock>,
        backing: Arc<InMemoryStore>,
        cache: ResultCache,
    }

    fn fixture(config: CacheConfig) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        ));
        let backing = Arc::new(InMemoryStore::new());
        let cache = ResultCache::new(config, backing.clone(), clock.clone());
        Fixture {
            clock,
            backing,
            cache,
        }
    }

    fn completed(text: &str) -> OcrStatus {
        OcrStatus::completed(TrackingId::new("trk-1"), OcrResult::new(text, 0.9, 2))
    }

    #[tokio::test]
    async fn round_trip_then_expiry_is_a_miss() {
        let f = fixture(CacheConfig::default());
        let fp = Fingerprint::of(b"invoice");
        f.cache
            .put(fp.clone(), None, completed("TOTAL 12.00"), None)
            .await
            .unwrap();

        assert_eq!(f.cache.get(&fp).await, Some(completed("TOTAL 12.00")));

        f.clock.advance(Duration::from_secs(24 * 60 * 60));
        assert_eq!(f.cache.get(&fp).await, None);
        assert!(f.cache.is_empty().await);
        assert_eq!(f.backing.len(CACHE_NAMESPACE).await, 0);

        let stats = f.cache.stats().await;
        assert_eq!((stats.hits, stats.misses, stats.expirations), (1, 1, 1));
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[tokio::test]
    async fn per_entry_ttl_override() {
        let f = fixture(CacheConfig::default());
        let short = Fingerprint::of(b"short");
        let long = Fingerprint::of(b"long");
        f.cache
            .put(short.clone(), None, completed("a"), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        f.cache.put(long.clone(), None, completed("b"), None).await.unwrap();

        f.clock.advance(Duration::from_secs(61));
        assert!(f.cache.get(&short).await.is_none());
        assert!(f.cache.get(&long).await.is_some());
        assert_eq!(
            f.cache.peek(&long).await.unwrap().ttl(),
            Duration::from_secs(24 * 60 * 60)
        );
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let f = fixture(CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        });
        let fps: Vec<Fingerprint> = ["one", "two", "three"]
            .iter()
            .map(|s| Fingerprint::of(s.as_bytes()))
            .collect();
        for (i, fp) in fps.iter().enumerate() {
            f.cache
                .put(fp.clone(), None, completed(&i.to_string()), None)
                .await
                .unwrap();
            f.clock.advance(Duration::from_secs(1));
        }

        assert_eq!(f.cache.len().await, 2);
        assert!(f.cache.peek(&fps[0]).await.is_none());
        assert!(f.cache.peek(&fps[2]).await.is_some());
        assert_eq!(f.cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn overwriting_a_key_does_not_evict() {
        let f = fixture(CacheConfig {
            max_entries: 1,
            ..CacheConfig::default()
        });
        let fp = Fingerprint::of(b"same");
        f.cache.put(fp.clone(), None, completed("x"), None).await.unwrap();
        f.cache.put(fp.clone(), None, completed("y"), None).await.unwrap();

        assert_eq!(f.cache.get(&fp).await, Some(completed("y")));
        assert_eq!(f.cache.stats().await.evictions, 0);
    }

    #[tokio::test]
    async fn invalidation_by_key_type_and_all() {
        let f = fixture(CacheConfig::default());
        let receipt = DocumentType::new("receipt");
        let w4 = DocumentType::new("w4");
        for (body, ty) in [("r1", &receipt), ("r2", &receipt), ("w", &w4)] {
            f.cache
                .put(Fingerprint::of(body.as_bytes()), Some(ty.clone()), completed(body), None)
                .await
                .unwrap();
        }
        f.cache
            .put(Fingerprint::of(b"untyped"), None, completed("u"), None)
            .await
            .unwrap();

        assert_eq!(f.cache.invalidate_document_type(&receipt).await.unwrap(), 2);
        assert!(f.cache.invalidate(&Fingerprint::of(b"w")).await.unwrap());
        assert!(!f.cache.invalidate(&Fingerprint::of(b"w")).await.unwrap());
        assert_eq!(f.cache.clear().await.unwrap(), 1);
        assert_eq!(f.backing.len(CACHE_NAMESPACE).await, 0);
    }

    /// Fails every delete after the first `allowed`.
    struct FlakyDeletes {
        inner: InMemoryStore,
        allowed: AtomicU64,
    }

    #[async_trait::async_trait]
    impl DurableStore for FlakyDeletes {
        async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            self.inner.put(namespace, key, value).await
        }

        async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(namespace, key).await
        }

        async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
            let left = self.allowed.load(Ordering::SeqCst);
            if left == 0 {
                return Err(StoreError::Io(std::io::Error::other("disk unplugged")));
            }
            self.allowed.store(left - 1, Ordering::SeqCst);
            self.inner.delete(namespace, key).await
        }

        async fn list(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
            self.inner.list(namespace).await
        }
    }

    #[tokio::test]
    async fn failed_clear_keeps_memory_in_step_with_the_store() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        ));
        let backing = Arc::new(FlakyDeletes {
            inner: InMemoryStore::new(),
            allowed: AtomicU64::new(1),
        });
        let cache = ResultCache::new(CacheConfig::default(), backing.clone(), clock);
        for body in ["a", "b", "c"] {
            cache
                .put(Fingerprint::of(body.as_bytes()), None, completed(body), None)
                .await
                .unwrap();
        }

        assert!(cache.clear().await.is_err());
        assert_eq!(cache.len().await, 2);
        assert_eq!(backing.inner.len(CACHE_NAMESPACE).await, 2);

        backing.allowed.store(10, Ordering::SeqCst);
        assert_eq!(cache.clear().await.unwrap(), 2);
        assert!(cache.is_empty().await);
        assert_eq!(backing.inner.len(CACHE_NAMESPACE).await, 0);
    }

    #[tokio::test]
    async fn cleanup_counts_removed_entries() {
        let f = fixture(CacheConfig::default());
        f.cache
            .put(Fingerprint::of(b"a"), None, completed("a"), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        f.cache
            .put(Fingerprint::of(b"b"), None, completed("b"), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        f.cache
            .put(Fingerprint::of(b"c"), None, completed("c"), None)
            .await
            .unwrap();

        assert_eq!(f.cache.cleanup_expired().await.unwrap(), 0);
        f.clock.advance(Duration::from_secs(10));
        assert_eq!(f.cache.cleanup_expired().await.unwrap(), 2);
        assert_eq!(f.cache.len().await, 1);
    }

    #[tokio::test]
    async fn average_entry_size_tracks_payloads() {
        let f = fixture(CacheConfig::default());
        f.cache
            .put(Fingerprint::of(b"a"), None, completed("a"), None)
            .await
            .unwrap();
        let stats = f.cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert!(stats.average_entry_size > 0.0);
        assert_eq!(stats.average_entry_size, stats.total_size_bytes as f64);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[tokio::test]
    async fn restore_skips_entries_that_expired_offline() {
        let f = fixture(CacheConfig::default());
        f.cache
            .put(Fingerprint::of(b"old"), None, completed("old"), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        f.cache
            .put(Fingerprint::of(b"new"), None, completed("new"), None)
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(6));

        let reloaded = ResultCache::new(CacheConfig::default(), f.backing.clone(), f.clock.clone());
        assert_eq!(reloaded.restore().await.unwrap(), 1);
        assert!(reloaded.get(&Fingerprint::of(b"new")).await.is_some());
        assert_eq!(f.backing.len(CACHE_NAMESPACE).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_on_one_key() {
        let f = fixture(CacheConfig::default());
        let cache = Arc::new(f.cache);
        let fp = Fingerprint::of(b"shared");

        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = Arc::clone(&cache);
            let fp = fp.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .put(fp, None, completed(&format!("copy {i}")), None)
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(cache.len().await, 1);
        assert!(cache.get(&fp).await.is_some());
    }
}
