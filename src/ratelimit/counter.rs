//! In-process counter store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::{CounterState, CounterStore};
use super::rules::MAX_WINDOW_SECONDS;
use crate::error::StoreError;

/// Default number of records kept before expired ones are pruned.
const DEFAULT_MAX_RECORDS: usize = 10_000;

/// Per-key counting state for one fixed window. The key lives in the map.
#[derive(Debug, Clone)]
pub struct CounterRecord {
    /// Requests counted in this window
    pub count: u64,
    /// When this window ends
    pub window_expires_at: Instant,
}

impl CounterRecord {
    /// Start a new window holding a single request.
    fn fresh(now: Instant, window: Duration) -> Self {
        let window = window.min(Duration::from_secs(MAX_WINDOW_SECONDS));
        Self {
            count: 1,
            window_expires_at: now
                .checked_add(window)
                .unwrap_or_else(|| now + Duration::from_secs(1)),
        }
    }

    /// Whether the window of this record has ended.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.window_expires_at
    }
}

/// A counter store local to this process.
///
/// Each increment runs under the `DashMap` shard lock for its key, so the
/// expiry check and the increment happen atomically with respect to other
/// tasks in the same process. No cross-process guarantee is made.
pub struct LocalCounterStore {
    records: DashMap<String, CounterRecord>,
    max_records: usize,
    /// Size above which the next increment scans for expired records.
    /// Doubles the live count after each scan so a map full of live
    /// records is not rescanned on every call.
    prune_threshold: AtomicUsize,
}

impl LocalCounterStore {
    /// Create a new local store with default settings.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_RECORDS)
    }

    /// Create a new local store that prunes expired records once it holds
    /// more than `max_records` entries.
    pub fn with_capacity(max_records: usize) -> Self {
        let max_records = max_records.max(1);
        Self {
            records: DashMap::new(),
            max_records,
            prune_threshold: AtomicUsize::new(max_records),
        }
    }

    /// Get the live count for a key, if its window has not ended.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.records
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.count)
    }

    /// Get the number of records held, expired ones included.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    fn prune_expired(&self, now: Instant) {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let after = self.records.len();

        let threshold = self.max_records.max(after.saturating_mul(2));
        self.prune_threshold.store(threshold, Ordering::Relaxed);
        debug!(
            before = before,
            after = after,
            next_scan_above = threshold,
            "Pruned expired local counters"
        );
    }
}

impl Default for LocalCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    async fn increment_and_check(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<CounterState, StoreError> {
        let now = Instant::now();
        let window = Duration::from_secs(window_seconds);

        let (count, expires_at) = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_expired(now) {
                    trace!(key = %key, "Window expired, starting a new one");
                    entry.insert(CounterRecord::fresh(now, window));
                } else {
                    entry.get_mut().count += 1;
                }
                let record = entry.get();
                (record.count, record.window_expires_at)
            }
            Entry::Vacant(entry) => {
                let record = entry.insert(CounterRecord::fresh(now, window));
                (record.count, record.window_expires_at)
            }
        };

        if self.records.len() > self.prune_threshold.load(Ordering::Relaxed) {
            self.prune_expired(now);
        }

        let until_reset = chrono::Duration::from_std(expires_at.saturating_duration_since(now))
            .unwrap_or_else(|_| chrono::Duration::zero());

        Ok(CounterState {
            count,
            window_expires_at: Utc::now() + until_reset,
        })
    }

    fn store_type(&self) -> &'static str {
        "local"
    }
}
