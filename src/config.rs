//! Configuration management for Turnstile.
//!
//! Configuration is read from an optional YAML file and then overridden by
//! environment variables prefixed with `TURNSTILE__`, e.g.
//! `TURNSTILE__RATE_LIMITING__FAILURE_POLICY=fail_closed`.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    CounterStore, FailurePolicy, KeyScope, LimitConfig, LocalCounterStore, PolicyConfig, PolicyResolver,
    RateLimiter, RedisCounterStore, DEFAULT_KEY_PREFIX,
};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Fallback policy. Defaults to 100 requests per 60 seconds; an explicit
    /// `default: null` leaves it unset, which `build_limiter` rejects.
    #[serde(default = "default_limit_config")]
    pub default: Option<LimitConfig>,

    /// Path-specific policies
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,

    /// Paths exempt from rate limiting
    #[serde(default = "default_bypass_paths")]
    pub bypass_paths: Vec<String>,

    /// Behaviour when the counter store is unavailable
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Counter store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Records kept by the local store before expired ones are pruned
    #[serde(default = "default_cache_size")]
    pub local_cache_size: usize,

    /// Take the client address from `X-Forwarded-For`
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default: default_limit_config(),
            policies: Vec::new(),
            bypass_paths: default_bypass_paths(),
            failure_policy: FailurePolicy::default(),
            store: StoreConfig::default(),
            local_cache_size: default_cache_size(),
            trust_forwarded_for: false,
        }
    }
}

/// Counter store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL; the local store is used when unset
    #[serde(default)]
    pub url: Option<String>,

    /// Namespace for keys in the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound for each store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_limit_config() -> Option<LimitConfig> {
    Some(LimitConfig {
        limit: default_limit(),
        window_seconds: default_window_seconds(),
        key_scope: KeyScope::default(),
    })
}

fn default_limit() -> u64 {
    100
}

fn default_window_seconds() -> u64 {
    60
}

fn default_bypass_paths() -> Vec<String> {
    ["/healthz", "/ping", "/metrics"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_cache_size() -> usize {
    10000
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    100
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(File::new(path, FileFormat::Yaml));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("TURNSTILE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a YAML file path only.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))
    }
}

impl RateLimitingConfig {
    /// Bound for each store call.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    /// Validate the policies and build the decision engine.
    ///
    /// Uses the Redis store when `store.url` is set and the local store
    /// otherwise.
    pub fn build_limiter(&self) -> Result<RateLimiter> {
        let resolver = PolicyResolver::from_config(self.default.as_ref(), &self.policies)?;

        if self.store.timeout_ms == 0 {
            return Err(TurnstileError::Config("store timeout must be positive".to_string()));
        }
        for path in &self.bypass_paths {
            if !path.starts_with('/') {
                return Err(TurnstileError::Config(format!(
                    "bypass path {:?} must start with '/'",
                    path
                )));
            }
        }

        let store: Arc<dyn CounterStore> = match &self.store.url {
            Some(url) => Arc::new(RedisCounterStore::with_prefix(
                url,
                self.store_timeout(),
                self.store.key_prefix.clone(),
            )?),
            None => Arc::new(LocalCounterStore::with_capacity(self.local_cache_size)),
        };

        info!(
            store = store.store_type(),
            failure_policy = ?self.failure_policy,
            bypass_paths = ?self.bypass_paths,
            "Rate limiter configured"
        );

        Ok(RateLimiter::new(resolver, store)
            .with_bypass_paths(self.bypass_paths.iter().cloned())
            .with_failure_policy(self.failure_policy)
            .with_store_timeout(self.store_timeout()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.rate_limiting.failure_policy, FailurePolicy::FailOpen);
        assert!(config.rate_limiting.bypass_paths.contains(&"/healthz".to_string()));
        assert_eq!(config.rate_limiting.store_timeout(), Duration::from_millis(100));

        let limiter = config.rate_limiting.build_limiter().unwrap();
        assert_eq!(limiter.store_type(), "local");
        assert_eq!(limiter.resolver().default_policy().limit, 100);
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
server:
  listen_addr: "127.0.0.1:9000"
rate_limiting:
  default:
    limit: 50
    window_seconds: 30
  policies:
    - path: /api/limited
      limit: 3
      window_seconds: 60
    - path: /api/*
      limit: 100
      window_seconds: 60
      key_scope: per_policy
  bypass_paths: ["/healthz"]
  failure_policy: fail_closed
  store:
    url: "redis://127.0.0.1:6379"
    key_prefix: svc
    timeout_ms: 25
  trust_forwarded_for: true
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);

        let rl = &config.rate_limiting;
        assert_eq!(rl.default.unwrap().limit, 50);
        assert_eq!(rl.policies.len(), 2);
        assert_eq!(rl.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(rl.store.key_prefix, "svc");
        assert_eq!(rl.store_timeout(), Duration::from_millis(25));
        assert!(rl.trust_forwarded_for);
        assert_eq!(rl.local_cache_size, 10000);

        let limiter = rl.build_limiter().unwrap();
        assert_eq!(limiter.store_type(), "redis");
        assert_eq!(limiter.failure_policy(), FailurePolicy::FailClosed);
        assert!(limiter.is_bypassed("/healthz"));
        assert!(!limiter.is_bypassed("/ping"));
    }

    #[test]
    fn test_partial_section_keeps_builtin_default() {
        let yaml = r#"
rate_limiting:
  policies:
    - path: /a
      limit: 1
      window_seconds: 1
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        let limiter = config.rate_limiting.build_limiter().unwrap();
        assert_eq!(limiter.resolver().default_policy().limit, 100);
        assert_eq!(limiter.resolver().default_policy().window_seconds, 60);
    }

    #[test]
    fn test_null_default_is_config_error() {
        let yaml = r#"
rate_limiting:
  default: null
  policies:
    - path: /a
      limit: 1
      window_seconds: 1
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert!(config.rate_limiting.default.is_none());
        assert!(matches!(
            config.rate_limiting.build_limiter(),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_pattern_is_config_error() {
        let yaml = r#"
rate_limiting:
  default: { limit: 10, window_seconds: 60 }
  policies:
    - { path: "/api/*/x", limit: 1, window_seconds: 1 }
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert!(config.rate_limiting.build_limiter().is_err());
    }

    #[test]
    fn test_relative_bypass_path_rejected() {
        let mut config = RateLimitingConfig::default();
        config.bypass_paths = vec!["healthz".to_string()];
        assert!(config.build_limiter().is_err());
    }

    #[test]
    fn test_unknown_failure_policy_rejected() {
        let yaml = r#"
rate_limiting:
  failure_policy: maybe
"#;
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TurnstileConfig::load(None).unwrap();
        assert!(config.rate_limiting.default.is_some());
    }

    #[test]
    fn test_env_override_keeps_builtin_default() {
        std::env::set_var("TURNSTILE__RATE_LIMITING__FAILURE_POLICY", "fail_closed");
        let loaded = TurnstileConfig::load(None);
        std::env::remove_var("TURNSTILE__RATE_LIMITING__FAILURE_POLICY");

        let config = loaded.unwrap();
        assert_eq!(config.rate_limiting.failure_policy, FailurePolicy::FailClosed);

        let limiter = config.rate_limiting.build_limiter().unwrap();
        assert_eq!(limiter.failure_policy(), FailurePolicy::FailClosed);
        assert_eq!(limiter.resolver().default_policy().limit, 100);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("turnstile-config-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "rate_limiting:\n  default: { limit: 7, window_seconds: 10 }\n  failure_policy: fail_closed\n",
        )
        .unwrap();

        let loaded = TurnstileConfig::from_file(path.to_str().unwrap());
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.rate_limiting.default.unwrap().limit, 7);
        assert_eq!(config.rate_limiting.failure_policy, FailurePolicy::FailClosed);

        assert!(matches!(
            TurnstileConfig::from_file("/nonexistent/turnstile.yaml"),
            Err(TurnstileError::Io(_))
        ));
    }
}
