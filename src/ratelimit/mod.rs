//! Rate limiting logic and state management.

mod backend;
mod counter;
mod descriptor;
mod distributed;
mod limiter;
mod rules;

pub use backend::{CounterState, CounterStore};
pub use counter::{CounterRecord, LocalCounterStore};
pub use descriptor::{check_component, KeyDeriver, KeyFunction, KEY_SEPARATOR};
pub use distributed::{RedisCounterStore, DEFAULT_KEY_PREFIX};
pub use limiter::{Decision, FailurePolicy, Outcome, RateLimiter, DEFAULT_STORE_TIMEOUT};
pub use rules::{
    KeyScope, LimitConfig, PathPattern, PolicyConfig, PolicyResolver, RateLimitPolicy, MAX_WINDOW_SECONDS,
};
