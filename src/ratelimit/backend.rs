//! Counter store trait for abstracting local and distributed implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// State of a counter immediately after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    /// Count including the increment that produced this state
    pub count: u64,
    /// When the current window ends
    pub window_expires_at: DateTime<Utc>,
}

/// Trait for counter store implementations.
///
/// This trait abstracts over both the in-process `LocalCounterStore` and the
/// shared `RedisCounterStore` so the decision engine can work with either.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter for `key`.
    ///
    /// Starts a fresh window with `count == 1` when no record exists or the
    /// existing one has expired; otherwise increments the count and leaves
    /// the expiry untouched. The returned state includes this call's own
    /// increment.
    async fn increment_and_check(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<CounterState, StoreError>;

    /// Short name for logging.
    fn store_type(&self) -> &'static str;
}
