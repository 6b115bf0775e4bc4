//! Polling - 指数的に間隔を伸ばすステータスポーリング

pub mod config;
pub mod engine;

pub use self::config::PollingConfig;
pub use self::engine::{PollError, PollOutcome, PollingEngine};
