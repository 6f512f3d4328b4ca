//! Per-remote request rate limiting: a keyed token bucket over the peer IP.

use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{DefaultKeyedRateLimiter, Quota};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Shared state for the rate-limit middleware.
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<DefaultKeyedRateLimiter<IpAddr>>,
    retry_after_secs: u64,
}

impl std::fmt::Debug for RateLimitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitState").finish_non_exhaustive()
    }
}

impl RateLimitState {
    /// Token bucket allowing `max` requests per `window` per remote.
    #[must_use]
    pub fn new(max: u32, window: Duration) -> Self {
        let max = NonZeroU32::new(max.max(1)).unwrap_or(NonZeroU32::MIN);
        let replenish = window
            .checked_div(max.get())
            .unwrap_or(Duration::from_millis(1))
            .max(Duration::from_millis(1));
        let quota = Quota::with_period(replenish)
            .unwrap_or_else(|| Quota::per_second(max))
            .allow_burst(max);
        Self {
            limiter: Arc::new(DefaultKeyedRateLimiter::keyed(quota)),
            retry_after_secs: window.as_secs().max(1),
        }
    }

    /// Whether a request from `remote` is admitted right now.
    #[must_use]
    pub fn admit(&self, remote: IpAddr) -> bool {
        self.limiter.check_key(&remote).is_ok()
    }
}

/// Reject over-rate remotes with 429 and a `Retry-After` hint.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::LOCALHOST), |info| info.0.ip());

    if state.admit(remote) {
        next.run(request).await
    } else {
        tracing::debug!(%remote, "rate limited");
        (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", state.retry_after_secs.to_string())],
            Json(json!({"error": "rate limit exceeded"})),
        )
            .into_response()
    }
}
