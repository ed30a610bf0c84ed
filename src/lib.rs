//! Turnstile - Request Rate Limiting
//!
//! This crate implements fixed-window request rate limiting for HTTP
//! services. Counters live either in process memory or in Redis, so every
//! replica of a service can enforce the same shared quota. Requests are
//! checked by a tower middleware or through a standalone decision service.
//!
//! ```
//! use std::sync::Arc;
//! use turnstile::ratelimit::{LimitConfig, LocalCounterStore, PolicyConfig, PolicyResolver, RateLimiter};
//!
//! # tokio_test::block_on(async {
//! let resolver = PolicyResolver::from_config(
//!     Some(&LimitConfig { limit: 100, window_seconds: 60, key_scope: Default::default() }),
//!     &[PolicyConfig {
//!         path: "/api/login".to_string(),
//!         limit: 1,
//!         window_seconds: 60,
//!         key_scope: Default::default(),
//!     }],
//! )?;
//! let limiter = RateLimiter::new(resolver, Arc::new(LocalCounterStore::new()));
//!
//! assert!(limiter.check("203.0.113.9", "/api/login").await.allowed);
//! assert!(!limiter.check("203.0.113.9", "/api/login").await.allowed);
//! # Ok::<(), turnstile::error::TurnstileError>(())
//! # }).unwrap();
//! ```
//!
//! To guard an axum application, wrap its router in
//! [`http::RateLimitLayer`] and serve it with
//! `into_make_service_with_connect_info::<SocketAddr>()` so the peer address
//! is available.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
