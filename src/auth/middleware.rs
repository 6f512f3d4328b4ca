//! Bearer-token gate.
//!
//! A single configured token is accepted either in the `Authorization`
//! header or, for stream-open paths that cannot set headers (EventSource,
//! browser WebSocket), as a `?token=` query parameter. Rejections carry a
//! distinguishable code. Health endpoints live outside the gated router.

use axum::{
    Json,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;

/// Shared state for the auth middleware.
#[derive(Debug, Clone)]
pub struct AuthState {
    /// The configured bearer token.
    pub token: Arc<String>,
}

impl AuthState {
    /// Wrap a configured token.
    #[must_use]
    pub fn new(token: &str) -> Self {
        Self {
            token: Arc::new(token.to_owned()),
        }
    }
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Missing,
    Malformed,
    Wrong,
}

impl Rejection {
    const fn code(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Malformed => "malformed",
            Self::Wrong => "wrong",
        }
    }
}

/// Gate every request behind the bearer token.
pub async fn bearer_auth_middleware(
    State(state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    match check(&state, &request) {
        Ok(()) => next.run(request).await,
        Err(rejection) => {
            tracing::debug!(code = rejection.code(), uri = %request.uri(), "rejected request");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "unauthorized",
                    "code": rejection.code(),
                })),
            )
                .into_response()
        }
    }
}

fn check(state: &AuthState, request: &Request) -> Result<(), Rejection> {
    if let Some(header) = request.headers().get(axum::http::header::AUTHORIZATION) {
        let value = header.to_str().map_err(|_| Rejection::Malformed)?;
        let token = value.strip_prefix("Bearer ").ok_or(Rejection::Malformed)?;
        return if token == state.token.as_str() {
            Ok(())
        } else {
            Err(Rejection::Wrong)
        };
    }

    if let Some(token) = query_token(request.uri().query()) {
        return if token == state.token.as_str() {
            Ok(())
        } else {
            Err(Rejection::Wrong)
        };
    }

    Err(Rejection::Missing)
}

/// Pull `token=` out of a query string. Gateway tokens are opaque strings
/// without reserved URI characters, so no percent-decoding is attempted.
fn query_token(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == "token")
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(uri: &str, auth_header: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(value) = auth_header {
            builder = builder.header("authorization", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_header_token_accepted() {
        let state = AuthState::new("tok");
        assert!(check(&state, &request("/v1/sessions", Some("Bearer tok"))).is_ok());
    }

    #[test]
    fn test_query_token_accepted() {
        let state = AuthState::new("tok");
        assert!(check(&state, &request("/v1/sessions/abc/ws?token=tok", None)).is_ok());
    }

    #[test]
    fn test_missing_vs_malformed_vs_wrong() {
        let state = AuthState::new("tok");
        assert_eq!(
            check(&state, &request("/v1/sessions", None)),
            Err(Rejection::Missing)
        );
        assert_eq!(
            check(&state, &request("/v1/sessions", Some("Basic dXNlcg=="))),
            Err(Rejection::Malformed)
        );
        assert_eq!(
            check(&state, &request("/v1/sessions", Some("Bearer nope"))),
            Err(Rejection::Wrong)
        );
        assert_eq!(
            check(&state, &request("/v1/sessions?token=nope", None)),
            Err(Rejection::Wrong)
        );
    }

    #[test]
    fn test_header_wins_over_query() {
        let state = AuthState::new("tok");
        // A wrong header is not rescued by a correct query parameter.
        assert_eq!(
            check(&state, &request("/x?token=tok", Some("Bearer nope"))),
            Err(Rejection::Wrong)
        );
    }
}
