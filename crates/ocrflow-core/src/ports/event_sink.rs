//! EventSink port - 通知の購読者
//!
//! キューは特定の購読者（UI、ログ）に結合せず、登録された sink 全てに
//! 同じイベントを配ります。

use crate::domain::QueueEvent;

/// Must not block: called on the queue's hot path.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &QueueEvent);
}
