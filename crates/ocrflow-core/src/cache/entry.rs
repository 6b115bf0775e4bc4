use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DocumentType, Fingerprint, OcrResult, OcrStatus};

/// Cached completed status, keyed by content fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub document_type: Option<DocumentType>,
    pub status: OcrStatus,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Serialized size of `status`.
    pub size_bytes: usize,
    #[serde(default)]
    pub hit_count: u32,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn result(&self) -> Option<&OcrResult> {
        self.status.result.as_ref()
    }

    pub fn ttl(&self) -> Duration {
        (self.expires_at - self.stored_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 before any lookup.
    pub hit_rate: f64,
    pub average_entry_size: f64,
    pub total_size_bytes: usize,
    /// Entries dropped to make room (capacity), not by expiry.
    pub evictions: u64,
    pub expirations: u64,
}
