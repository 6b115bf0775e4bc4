//! Retry - 失敗の分類、バックオフ、失敗リクエストの保管

pub mod policy;
pub mod record;
pub mod store;

pub use self::policy::RetryPolicy;
pub use self::record::FailedRequest;
pub use self::store::FailedRequestStore;
