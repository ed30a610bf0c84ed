//! Error types for the Turnstile rate limiter.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Errors raised by a counter store.
///
/// The decision engine absorbs both variants through its failure policy;
/// they never reach an HTTP client.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or rejected the operation
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured bound
    #[error("Counter store timed out after {0:?}")]
    Timeout(Duration),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Errors raised while deriving a counting key.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    /// A key component contains the reserved separator or escape character
    #[error("Key component {component:?} contains a reserved character")]
    CollisionRisk { component: String },
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
