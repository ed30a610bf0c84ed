//! Decision service handlers.
//!
//! Exposes the decision engine over HTTP so services that cannot embed the
//! middleware can still share the limiter.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::ratelimit::{Decision, Outcome, RateLimiter};

/// Body of a `POST /v1/check` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Pre-resolved client identifier
    pub identifier: String,
    /// Request path to check
    pub path: String,
}

/// Body of a `POST /v1/check` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResponse {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Window end in epoch seconds
    pub reset: i64,
    pub window_seconds: u64,
    pub outcome: String,
}

impl From<&Decision> for CheckResponse {
    fn from(decision: &Decision) -> Self {
        let outcome = match decision.outcome {
            Outcome::Counted => "counted",
            Outcome::Bypassed => "bypassed",
            Outcome::StoreUnavailable => "store_unavailable",
        };

        Self {
            allowed: decision.allowed,
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset_at.timestamp(),
            window_seconds: decision.window_seconds,
            outcome: outcome.to_string(),
        }
    }
}

/// A rejected decision service request.
#[derive(Debug)]
pub struct InvalidRequest(&'static str);

impl IntoResponse for InvalidRequest {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "detail": self.0 })),
        )
            .into_response()
    }
}

/// Build the decision service router.
pub fn routes(limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/check", post(check))
        .with_state(limiter)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Decide whether `identifier` may request `path`, counting the request.
#[instrument(skip_all)]
async fn check(
    State(limiter): State<Arc<RateLimiter>>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, InvalidRequest> {
    if request.identifier.is_empty() {
        warn!("Received check request with empty identifier");
        return Err(InvalidRequest("identifier is required"));
    }
    if !request.path.starts_with('/') {
        warn!("Received check request with a relative path");
        return Err(InvalidRequest("path must start with '/'"));
    }

    let decision = limiter.check(&request.identifier, &request.path).await;
    debug!(
        identifier = %request.identifier,
        path = %request.path,
        allowed = decision.allowed,
        outcome = ?decision.outcome,
        "Rate limit decision made"
    );

    Ok(Json(CheckResponse::from(&decision)))
}
