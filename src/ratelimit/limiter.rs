//! Core rate limiter implementation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::backend::CounterStore;
use super::descriptor::KeyDeriver;
use super::rules::{PolicyResolver, RateLimitPolicy, MAX_WINDOW_SECONDS};
use crate::error::StoreError;

/// Default upper bound for a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request without quota headers
    #[default]
    FailOpen,
    /// Reject the request
    FailClosed,
}

/// How a decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The request was counted against its quota
    Counted,
    /// The path is exempt from rate limiting
    Bypassed,
    /// The store failed and the failure policy decided
    StoreUnavailable,
}

/// The result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Limit of the governing policy
    pub limit: u64,
    /// Window of the governing policy
    pub window_seconds: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
    /// How the decision was reached
    pub outcome: Outcome,
}

impl Decision {
    fn uncounted(allowed: bool, policy: &RateLimitPolicy, outcome: Outcome) -> Self {
        let window = policy.window_seconds.min(MAX_WINDOW_SECONDS) as i64;
        Self {
            allowed,
            limit: policy.limit,
            window_seconds: policy.window_seconds,
            remaining: policy.limit,
            reset_at: Utc::now() + chrono::Duration::seconds(window),
            outcome,
        }
    }

    /// Whether quota headers describe this decision.
    ///
    /// Only counted requests report quota; bypassed paths and store
    /// failures consume nothing.
    pub fn reports_quota(&self) -> bool {
        self.outcome == Outcome::Counted
    }

    /// Seconds a denied client should wait, for counted denials.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<u64> {
        if self.allowed || self.outcome != Outcome::Counted {
            return None;
        }
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        Some(millis.div_ceil(1000).max(1))
    }
}

/// The decision engine.
///
/// Combines policy resolution, key derivation and the counter store into a
/// single `check` call. This struct is thread-safe and can be shared across
/// multiple tasks.
pub struct RateLimiter {
    /// Path to policy mapping
    resolver: PolicyResolver,
    /// Key derivation strategy
    keys: KeyDeriver,
    /// Counter store
    store: Arc<dyn CounterStore>,
    /// Paths exempt from rate limiting
    bypass_paths: HashSet<String>,
    /// Behaviour when the store fails
    failure_policy: FailurePolicy,
    /// Bound for each store call
    store_timeout: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter with default settings.
    pub fn new(resolver: PolicyResolver, store: Arc<dyn CounterStore>) -> Self {
        Self {
            resolver,
            keys: KeyDeriver::new(),
            store,
            bypass_paths: HashSet::new(),
            failure_policy: FailurePolicy::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Use a custom key deriver.
    pub fn with_key_deriver(mut self, keys: KeyDeriver) -> Self {
        self.keys = keys;
        self
    }

    /// Add paths that bypass rate limiting.
    pub fn with_bypass_paths(mut self, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.bypass_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Set the store failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the bound for each store call.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Check and count a request from `identifier` to `path`.
    ///
    /// Never fails: store errors and timeouts are turned into a decision by
    /// the configured failure policy.
    pub async fn check(&self, identifier: &str, path: &str) -> Decision {
        let policy = self.resolver.resolve(path);

        if self.is_bypassed(path) {
            trace!(path = %path, "Path bypasses rate limiting");
            return Decision::uncounted(true, policy, Outcome::Bypassed);
        }

        let key = self.keys.derive(identifier, path, policy);

        trace!(
            key = %key,
            policy = %policy.path_pattern,
            limit = policy.limit,
            "Checking rate limit"
        );

        let result = match tokio::time::timeout(
            self.store_timeout,
            self.store.increment_and_check(&key, policy.window_seconds),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        };

        match result {
            Ok(state) => {
                let allowed = state.count <= policy.limit;
                if !allowed {
                    debug!(
                        key = %key,
                        count = state.count,
                        limit = policy.limit,
                        "Rate limit exceeded"
                    );
                }

                Decision {
                    allowed,
                    limit: policy.limit,
                    window_seconds: policy.window_seconds,
                    remaining: policy.limit.saturating_sub(state.count),
                    reset_at: state.window_expires_at,
                    outcome: Outcome::Counted,
                }
            }
            Err(err) => {
                let allowed = self.failure_policy == FailurePolicy::FailOpen;
                warn!(
                    error = %err,
                    key = %key,
                    store = self.store.store_type(),
                    failure_policy = ?self.failure_policy,
                    allowed = allowed,
                    "Counter store unavailable, applying failure policy"
                );
                Decision::uncounted(allowed, policy, Outcome::StoreUnavailable)
            }
        }
    }

    /// Whether `path` is exempt from rate limiting.
    pub fn is_bypassed(&self, path: &str) -> bool {
        self.bypass_paths.contains(path)
    }

    /// Get the configured failure policy.
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Get the policy resolver.
    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    /// Get the name of the counter store in use.
    pub fn store_type(&self) -> &'static str {
        self.store.store_type()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("resolver", &self.resolver)
            .field("keys", &self.keys)
            .field("store", &self.store.store_type())
            .field("bypass_paths", &self.bypass_paths)
            .field("failure_policy", &self.failure_policy)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::backend::CounterState;
    use crate::ratelimit::counter::LocalCounterStore;
    use crate::ratelimit::rules::{KeyScope, LimitConfig, PolicyConfig};
    use async_trait::async_trait;

    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn increment_and_check(&self, _key: &str, _window_seconds: u64) -> Result<CounterState, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn store_type(&self) -> &'static str {
            "unreachable"
        }
    }

    struct HangingStore;

    #[async_trait]
    impl CounterStore for HangingStore {
        async fn increment_and_check(&self, _key: &str, _window_seconds: u64) -> Result<CounterState, StoreError> {
            std::future::pending().await
        }

        fn store_type(&self) -> &'static str {
            "hanging"
        }
    }

    fn resolver() -> PolicyResolver {
        PolicyResolver::from_config(
            Some(&LimitConfig {
                limit: 10,
                window_seconds: 60,
                key_scope: KeyScope::PerPath,
            }),
            &[
                PolicyConfig {
                    path: "/api/limited".to_string(),
                    limit: 3,
                    window_seconds: 60,
                    key_scope: KeyScope::PerPath,
                },
                PolicyConfig {
                    path: "/short/*".to_string(),
                    limit: 2,
                    window_seconds: 5,
                    key_scope: KeyScope::PerPath,
                },
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_boundary_invariant() {
        let limiter = RateLimiter::new(resolver(), Arc::new(LocalCounterStore::new()));

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check("client-a", "/api/limited").await;
            assert!(decision.allowed);
            assert_eq!(decision.outcome, Outcome::Counted);
            assert_eq!(decision.limit, 3);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let decision = limiter.check("client-a", "/api/limited").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.retry_after(Utc::now()).is_some());
    }

    #[tokio::test]
    async fn test_clients_and_paths_counted_separately() {
        let limiter = RateLimiter::new(resolver(), Arc::new(LocalCounterStore::new()));

        for _ in 0..3 {
            limiter.check("client-a", "/api/limited").await;
        }
        assert!(!limiter.check("client-a", "/api/limited").await.allowed);
        assert!(limiter.check("client-b", "/api/limited").await.allowed);
        assert!(limiter.check("client-a", "/api/other").await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_after_denials() {
        let limiter = RateLimiter::new(resolver(), Arc::new(LocalCounterStore::new()));

        for _ in 0..2 {
            assert!(limiter.check("c", "/short/x").await.allowed);
        }
        for _ in 0..20 {
            assert!(!limiter.check("c", "/short/x").await.allowed);
        }

        tokio::time::advance(Duration::from_secs(5)).await;

        let decision = limiter.check("c", "/short/x").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn test_bypass_paths_never_consume_quota() {
        let store = Arc::new(LocalCounterStore::new());
        let limiter = RateLimiter::new(resolver(), store.clone()).with_bypass_paths(["/healthz"]);

        for _ in 0..25 {
            let decision = limiter.check("c", "/healthz").await;
            assert!(decision.allowed);
            assert_eq!(decision.outcome, Outcome::Bypassed);
            assert!(!decision.reports_quota());
            assert_eq!(decision.remaining, decision.limit);
        }
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn test_bypass_skips_unreachable_store() {
        let limiter = RateLimiter::new(resolver(), Arc::new(UnreachableStore))
            .with_bypass_paths(["/healthz"])
            .with_failure_policy(FailurePolicy::FailClosed);

        let decision = limiter.check("c", "/healthz").await;
        assert!(decision.allowed);
        assert_eq!(decision.outcome, Outcome::Bypassed);
    }

    #[tokio::test]
    async fn test_fail_open() {
        let limiter = RateLimiter::new(resolver(), Arc::new(UnreachableStore))
            .with_failure_policy(FailurePolicy::FailOpen);

        for _ in 0..1000 {
            let decision = limiter.check("c", "/api/limited").await;
            assert!(decision.allowed);
            assert_eq!(decision.outcome, Outcome::StoreUnavailable);
            assert!(!decision.reports_quota());
        }
    }

    #[tokio::test]
    async fn test_fail_closed() {
        let limiter = RateLimiter::new(resolver(), Arc::new(UnreachableStore))
            .with_failure_policy(FailurePolicy::FailClosed);
        assert_eq!(limiter.failure_policy(), FailurePolicy::FailClosed);

        for _ in 0..1000 {
            let decision = limiter.check("c", "/api/limited").await;
            assert!(!decision.allowed);
            assert_eq!(decision.outcome, Outcome::StoreUnavailable);
            assert_eq!(decision.retry_after(Utc::now()), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_applies_failure_policy() {
        let open = RateLimiter::new(resolver(), Arc::new(HangingStore))
            .with_store_timeout(Duration::from_millis(50));
        let decision = open.check("c", "/api/limited").await;
        assert!(decision.allowed);
        assert_eq!(decision.outcome, Outcome::StoreUnavailable);

        let closed = RateLimiter::new(resolver(), Arc::new(HangingStore))
            .with_store_timeout(Duration::from_millis(50))
            .with_failure_policy(FailurePolicy::FailClosed);
        let decision = closed.check("c", "/api/limited").await;
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_custom_key_deriver_shares_quota() {
        let limiter = RateLimiter::new(resolver(), Arc::new(LocalCounterStore::new())).with_key_deriver(
            KeyDeriver::with_key_fn(|_identifier: &str, path: &str, _policy: &RateLimitPolicy| {
                format!("shared|{}", path)
            }),
        );

        for client in ["a", "b", "c"] {
            assert!(limiter.check(client, "/api/limited").await.allowed);
        }
        assert!(!limiter.check("d", "/api/limited").await.allowed);
    }

    #[tokio::test]
    async fn test_longest_window_checks_without_overflow() {
        let resolver = PolicyResolver::from_config(
            Some(&LimitConfig {
                limit: 1,
                window_seconds: MAX_WINDOW_SECONDS,
                key_scope: KeyScope::PerPath,
            }),
            &[],
        )
        .unwrap();
        let limiter = RateLimiter::new(resolver, Arc::new(LocalCounterStore::new())).with_bypass_paths(["/healthz"]);

        assert!(limiter.check("c", "/x").await.allowed);
        assert!(!limiter.check("c", "/x").await.allowed);
        assert_eq!(limiter.check("c", "/healthz").await.outcome, Outcome::Bypassed);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc::now();
        let decision = Decision {
            allowed: false,
            limit: 3,
            window_seconds: 60,
            remaining: 0,
            reset_at: now + chrono::Duration::milliseconds(1500),
            outcome: Outcome::Counted,
        };
        assert_eq!(decision.retry_after(now), Some(2));

        let expired = Decision {
            reset_at: now - chrono::Duration::seconds(1),
            ..decision
        };
        assert_eq!(expired.retry_after(now), Some(1));
    }
}
