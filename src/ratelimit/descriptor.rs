//! Counting key derivation.
//!
//! A key is the scope tag, the client identifier and (depending on the
//! scope) the request path or policy pattern, joined with `|`. Components
//! containing `|` or `%` are percent-escaped so two distinct inputs can
//! never produce the same key.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use super::rules::{KeyScope, PathPattern, RateLimitPolicy};
use crate::error::KeyError;

/// Separator between key components.
pub const KEY_SEPARATOR: char = '|';
/// Escape character for reserved characters inside a component.
const ESCAPE: char = '%';

/// Custom key derivation, e.g. per API key or per tenant.
pub trait KeyFunction: Send + Sync {
    /// Build the counting key for a request.
    fn derive(&self, identifier: &str, path: &str, policy: &RateLimitPolicy) -> String;
}

impl<F> KeyFunction for F
where
    F: Fn(&str, &str, &RateLimitPolicy) -> String + Send + Sync,
{
    fn derive(&self, identifier: &str, path: &str, policy: &RateLimitPolicy) -> String {
        self(identifier, path, policy)
    }
}

/// Builds counting keys from identifiers and policies.
#[derive(Clone, Default)]
pub struct KeyDeriver {
    custom: Option<Arc<dyn KeyFunction>>,
}

impl KeyDeriver {
    /// Create a deriver using each policy's key scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a deriver that delegates to a custom key function.
    pub fn with_key_fn(key_fn: impl KeyFunction + 'static) -> Self {
        Self {
            custom: Some(Arc::new(key_fn)),
        }
    }

    /// Derive the counting key for `identifier` requesting `path` under `policy`.
    pub fn derive(&self, identifier: &str, path: &str, policy: &RateLimitPolicy) -> String {
        if let Some(custom) = &self.custom {
            return custom.derive(identifier, path, policy);
        }

        match policy.key_scope {
            KeyScope::PerPath => join(&["path", identifier, path]),
            // The default policy gets its own tag so it never shares a
            // counter with a configured `*` pattern.
            KeyScope::PerPolicy => match &policy.path_pattern {
                PathPattern::Fallback => join(&["default", identifier]),
                pattern => join(&["policy", identifier, &pattern.to_string()]),
            },
            KeyScope::Global => join(&["global", identifier]),
        }
    }
}

impl fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

/// Check that a component holds no reserved character.
pub fn check_component(component: &str) -> Result<(), KeyError> {
    if component.contains(KEY_SEPARATOR) || component.contains(ESCAPE) {
        return Err(KeyError::CollisionRisk {
            component: component.to_string(),
        });
    }
    Ok(())
}

fn encode_component(component: &str) -> Cow<'_, str> {
    match check_component(component) {
        Ok(()) => Cow::Borrowed(component),
        Err(err) => {
            warn!(error = %err, "Escaping reserved characters in rate limit key");
            let mut escaped = String::with_capacity(component.len() + 4);
            for c in component.chars() {
                match c {
                    ESCAPE => escaped.push_str("%25"),
                    KEY_SEPARATOR => escaped.push_str("%7C"),
                    other => escaped.push(other),
                }
            }
            Cow::Owned(escaped)
        }
    }
}

fn join(components: &[&str]) -> String {
    let mut key = String::new();
    for (i, component) in components.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(&encode_component(component));
    }
    key
}
