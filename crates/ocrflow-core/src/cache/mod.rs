//! Cache - 完了済み OCR 結果のキャッシュ

pub mod entry;
pub mod result_cache;

pub use self::entry::{CacheEntry, CacheStats};
pub use self::result_cache::{CacheConfig, ResultCache};
