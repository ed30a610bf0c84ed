//! Rate limit policy configuration and path matching.
//!
//! Policies are matched against the request path in a fixed order: exact
//! literal first, then the wildcard pattern with the longest literal prefix,
//! then the default policy.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Marker terminating a wildcard pattern.
const WILDCARD: char = '*';

/// Longest accepted window: one year.
pub const MAX_WINDOW_SECONDS: u64 = 365 * 24 * 60 * 60;

/// How the counting key is scoped for a policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// One quota per client per request path
    #[default]
    PerPath,
    /// One quota per client shared by every path the policy matches
    PerPolicy,
    /// One quota per client across every path using this scope
    Global,
}

/// A configured limit and window, as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Maximum requests allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Key scoping rule
    #[serde(default)]
    pub key_scope: KeyScope,
}

/// A path-specific policy entry, as written in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Exact path, or a literal prefix followed by `*`
    pub path: String,
    /// Maximum requests allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Key scoping rule
    #[serde(default)]
    pub key_scope: KeyScope,
}

/// A parsed path pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathPattern {
    /// Matches one path exactly
    Exact(String),
    /// Matches every path starting with the literal prefix
    Prefix(String),
    /// The default policy; matches every path
    Fallback,
}

impl PathPattern {
    /// Parse a raw pattern such as `/health` or `/api/*`.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(TurnstileError::Config("empty path pattern".to_string()));
        }

        match raw.find(WILDCARD) {
            None => Ok(PathPattern::Exact(raw.to_string())),
            Some(idx) if idx == raw.len() - 1 => Ok(PathPattern::Prefix(raw[..idx].to_string())),
            Some(_) => Err(TurnstileError::Config(format!(
                "malformed path pattern {:?}: '*' is only allowed as the final character",
                raw
            ))),
        }
    }

    /// Check whether a request path matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(exact) => exact == path,
            PathPattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathPattern::Fallback => true,
        }
    }

    /// Length of the literal part of the pattern.
    pub fn literal_len(&self) -> usize {
        match self {
            PathPattern::Exact(s) | PathPattern::Prefix(s) => s.len(),
            PathPattern::Fallback => 0,
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Exact(exact) => write!(f, "{}", exact),
            PathPattern::Prefix(prefix) => write!(f, "{}{}", prefix, WILDCARD),
            PathPattern::Fallback => write!(f, "<default>"),
        }
    }
}

/// An immutable rate limit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Paths this policy applies to
    pub path_pattern: PathPattern,
    /// Maximum requests allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Key scoping rule
    pub key_scope: KeyScope,
}

impl RateLimitPolicy {
    /// Build a validated policy.
    pub fn new(path_pattern: PathPattern, limit: u64, window_seconds: u64, key_scope: KeyScope) -> Result<Self> {
        if limit == 0 {
            return Err(TurnstileError::Config(format!(
                "policy {} must have a positive limit",
                path_pattern
            )));
        }
        if window_seconds == 0 {
            return Err(TurnstileError::Config(format!(
                "policy {} must have a positive window",
                path_pattern
            )));
        }
        if window_seconds > MAX_WINDOW_SECONDS {
            return Err(TurnstileError::Config(format!(
                "policy {} window of {}s exceeds the maximum of {}s",
                path_pattern, window_seconds, MAX_WINDOW_SECONDS
            )));
        }

        Ok(Self {
            path_pattern,
            limit,
            window_seconds,
            key_scope,
        })
    }

    fn from_config(config: &PolicyConfig) -> Result<Self> {
        Self::new(
            PathPattern::parse(&config.path)?,
            config.limit,
            config.window_seconds,
            config.key_scope,
        )
    }
}

/// Maps request paths to the policy that governs them.
///
/// Read-only after construction; safe to share across tasks without locking.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    /// Exact-path policies
    exact: HashMap<String, RateLimitPolicy>,
    /// Wildcard policies, longest literal prefix first
    wildcards: Vec<RateLimitPolicy>,
    /// Fallback policy
    default: RateLimitPolicy,
}

impl PolicyResolver {
    /// Build a resolver from configuration.
    ///
    /// Fails if no default is configured, a pattern is malformed or
    /// duplicated, or a limit or window is zero.
    pub fn from_config(default: Option<&LimitConfig>, policies: &[PolicyConfig]) -> Result<Self> {
        let default = default
            .ok_or_else(|| TurnstileError::Config("no default rate limit policy configured".to_string()))?;
        let default = RateLimitPolicy::new(
            PathPattern::Fallback,
            default.limit,
            default.window_seconds,
            default.key_scope,
        )?;

        let mut seen = HashSet::new();
        let mut exact = HashMap::new();
        let mut wildcards = Vec::new();

        for config in policies {
            let policy = RateLimitPolicy::from_config(config)?;
            if !seen.insert(policy.path_pattern.clone()) {
                return Err(TurnstileError::Config(format!(
                    "duplicate path pattern {:?}",
                    config.path
                )));
            }

            match &policy.path_pattern {
                PathPattern::Exact(path) => {
                    exact.insert(path.clone(), policy);
                }
                PathPattern::Prefix(_) | PathPattern::Fallback => wildcards.push(policy),
            }
        }

        // Two distinct prefixes of equal length never match the same path,
        // so ordering by length alone is deterministic.
        wildcards.sort_by(|a, b| b.path_pattern.literal_len().cmp(&a.path_pattern.literal_len()));

        info!(
            exact = exact.len(),
            wildcard = wildcards.len(),
            default_limit = default.limit,
            default_window_seconds = default.window_seconds,
            "Loaded rate limit policies"
        );

        Ok(Self {
            exact,
            wildcards,
            default,
        })
    }

    /// Find the policy for a request path.
    pub fn resolve(&self, path: &str) -> &RateLimitPolicy {
        if let Some(policy) = self.exact.get(path) {
            return policy;
        }

        self.wildcards
            .iter()
            .find(|policy| policy.path_pattern.matches(path))
            .unwrap_or(&self.default)
    }

    /// The fallback policy.
    pub fn default_policy(&self) -> &RateLimitPolicy {
        &self.default
    }

    /// Number of path-specific policies.
    pub fn policy_count(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }
}
