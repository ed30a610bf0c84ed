//! Rate limiting middleware for axum and tower services.
//!
//! The layer runs the decision engine before the wrapped service. Denied
//! requests are answered with `429 Too Many Requests` without reaching the
//! handler; admitted requests get quota headers added to their response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::future::BoxFuture;
use http::header::RETRY_AFTER;
use tower::{Layer, Service};
use tracing::{info, trace};

use crate::ratelimit::{Decision, RateLimiter};

/// Header reporting the policy limit.
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Header reporting requests left in the window.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Header reporting the window end in epoch seconds.
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Identifier used when no client address is known.
const UNKNOWN_CLIENT: &str = "unknown";

/// Client identifier resolved by an upstream layer, e.g. an API key or
/// tenant id. Takes precedence over the connection address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

/// Explicit hooks run around each decision.
pub trait CheckHooks: Send + Sync {
    /// Called before the decision engine runs.
    fn before_check(&self, _identifier: &str, _path: &str) {}

    /// Called with the decision and the time the engine took.
    fn after_check(&self, _identifier: &str, _path: &str, _decision: &Decision, _elapsed: Duration) {}
}

/// Hooks that log every decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHooks;

impl CheckHooks for TracingHooks {
    fn after_check(&self, identifier: &str, path: &str, decision: &Decision, elapsed: Duration) {
        if decision.allowed {
            trace!(
                client = %identifier,
                path = %path,
                remaining = decision.remaining,
                outcome = ?decision.outcome,
                elapsed_us = elapsed.as_micros() as u64,
                "Request admitted"
            );
        } else {
            info!(
                client = %identifier,
                path = %path,
                limit = decision.limit,
                outcome = ?decision.outcome,
                elapsed_us = elapsed.as_micros() as u64,
                "Request rejected"
            );
        }
    }
}

/// Layer applying rate limiting to a service.
#[derive(Clone)]
pub struct RateLimitLayer {
    /// The decision engine
    limiter: Arc<RateLimiter>,
    /// Pre/post decision hooks
    hooks: Arc<dyn CheckHooks>,
    /// Whether `X-Forwarded-For` identifies the client
    trust_forwarded_for: bool,
}

impl RateLimitLayer {
    /// Create a new layer around a decision engine.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            hooks: Arc::new(TracingHooks),
            trust_forwarded_for: false,
        }
    }

    /// Replace the decision hooks.
    pub fn with_hooks(mut self, hooks: impl CheckHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Identify clients by the first `X-Forwarded-For` entry when present.
    ///
    /// Only enable behind a proxy that sets the header.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    layer: RateLimitLayer,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // The clone may not be ready; swap so the polled service handles this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();

        Box::pin(async move {
            let identifier = client_identifier(&request, layer.trust_forwarded_for);
            let path = request.uri().path().to_string();

            layer.hooks.before_check(&identifier, &path);
            let started = Instant::now();
            let decision = layer.limiter.check(&identifier, &path).await;
            layer.hooks.after_check(&identifier, &path, &decision, started.elapsed());

            if !decision.allowed {
                return Ok(too_many_requests(&decision));
            }

            let mut response = inner.call(request).await?;
            if decision.reports_quota() {
                apply_quota_headers(response.headers_mut(), &decision);
            }
            Ok(response)
        })
    }
}

/// Resolve the identifier a request is counted under.
pub fn client_identifier<B>(request: &Request<B>, trust_forwarded_for: bool) -> String {
    if let Some(ClientIdentity(identity)) = request.extensions().get::<ClientIdentity>() {
        return identity.clone();
    }

    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(client) = forwarded {
            return client.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Attach `X-RateLimit-*` headers describing a counted decision.
pub fn apply_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(HEADER_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(HEADER_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(HEADER_RESET, HeaderValue::from(decision.reset_at.timestamp()));
}

/// Build the `429` response for a denied request.
pub fn too_many_requests(decision: &Decision) -> Response {
    let body = serde_json::json!({
        "detail": "Rate limit exceeded",
        "limit": decision.limit,
        "window_seconds": decision.window_seconds,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    if let Some(retry_after) = decision.retry_after(Utc::now()) {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(retry_after));
    }
    response
}
