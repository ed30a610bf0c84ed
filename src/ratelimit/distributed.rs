//! Distributed counter store backed by Redis.
//!
//! This module provides a counter store shared by every replica of a
//! service. The increment, the expiry check and the TTL assignment run in a
//! single Lua script, so concurrent callers on any number of instances never
//! lose an update.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use super::backend::{CounterState, CounterStore};
use crate::error::{StoreError, TurnstileError};

/// Default key namespace in the shared store.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// Increments the key and arms its TTL when a new window starts.
///
/// A key that somehow lost its TTL is re-armed too, so a record can never
/// outlive its window. Returns `{count, remaining_ttl_ms}`.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// A counter store backed by a Redis server.
///
/// The connection is established on first use, so an unreachable server at
/// startup surfaces as `StoreError::Unavailable` on the first check rather
/// than preventing the process from starting.
pub struct RedisCounterStore {
    /// Redis client holding the parsed connection info.
    client: redis::Client,
    /// Lazily established connection manager.
    conn: OnceCell<ConnectionManager>,
    /// Upper bound for connecting and for each response.
    timeout: Duration,
    /// Key namespace.
    prefix: String,
    script: redis::Script,
}

impl RedisCounterStore {
    /// Create a new Redis store.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `url` is not a valid Redis URL.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, TurnstileError> {
        let client = redis::Client::open(url)
            .map_err(|e| TurnstileError::Config(format!("Invalid store URL: {}", e)))?;

        Ok(Self {
            client,
            conn: OnceCell::new(),
            timeout,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            script: redis::Script::new(INCREMENT_SCRIPT),
        })
    }

    /// Create a new Redis store with a custom key prefix.
    pub fn with_prefix(
        url: &str,
        timeout: Duration,
        prefix: impl Into<String>,
    ) -> Result<Self, TurnstileError> {
        let mut store = Self::new(url, timeout)?;
        store.prefix = prefix.into();
        Ok(store)
    }

    /// Get the full key with prefix.
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| async move {
                debug!(prefix = %self.prefix, "Connecting to Redis counter store");
                let config = ConnectionManagerConfig::new()
                    .set_connection_timeout(self.timeout)
                    .set_response_timeout(self.timeout)
                    .set_number_of_retries(1);
                ConnectionManager::new_with_config(self.client.clone(), config).await
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_check(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<CounterState, StoreError> {
        let full_key = self.key(key);
        let window_ms = window_seconds.saturating_mul(1000);

        let mut conn = self.connection().await?;
        let (count, ttl_ms): (u64, i64) = self
            .script
            .key(&full_key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %full_key, count = count, ttl_ms = ttl_ms, "Redis counter incremented");

        Ok(CounterState {
            count,
            window_expires_at: Utc::now() + chrono::Duration::milliseconds(ttl_ms.max(0)),
        })
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .field("connected", &self.conn.initialized())
            .finish()
    }
}
