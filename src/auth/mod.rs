//! Bearer-token admission and per-remote rate limiting.

/// Bearer-token middleware.
pub mod middleware;
/// Token-bucket rate limiting.
pub mod rate_limit;

pub use middleware::{AuthState, bearer_auth_middleware};
pub use rate_limit::{RateLimitState, rate_limit_middleware};
