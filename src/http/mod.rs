//! HTTP integration: rate limiting middleware and the decision service.

mod middleware;
mod server;
mod service;

pub use middleware::{
    apply_quota_headers, client_identifier, too_many_requests, CheckHooks, ClientIdentity, RateLimitLayer,
    RateLimitService, TracingHooks, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
};
pub use server::HttpServer;
pub use service::{routes, CheckRequest, CheckResponse};
