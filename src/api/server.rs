//! Router assembly and the listener loop.

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{self, AppState};
use super::sse::sse_events_handler;
use super::ws::ws_session_handler;
use crate::auth::{
    AuthState, RateLimitState, bearer_auth_middleware, rate_limit_middleware,
};

/// Build the full router: public health endpoints plus the gated v1 API.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let auth_state = AuthState::new(&state.config.api_token);
    let rate_state = RateLimitState::new(
        state.config.rate_limit_max,
        state.config.rate_limit_window,
    );

    // Everything except health/readiness goes through rate limiting and
    // the bearer gate. route_layer ordering: the last layer added runs
    // first, so rate limiting rejects floods before auth does any work.
    let protected = Router::new()
        .route("/v1/sessions", post(handlers::create_session))
        .route("/v1/sessions", get(handlers::list_sessions))
        .route("/v1/sessions/resumable", get(handlers::list_resumable))
        .route("/v1/sessions/{id}", get(handlers::get_session))
        .route("/v1/sessions/{id}", delete(handlers::delete_session))
        .route("/v1/sessions/{id}/connect", post(handlers::connect_session))
        .route("/v1/sessions/{id}/messages", get(handlers::list_messages))
        .route("/v1/sessions/{id}/ws", get(ws_session_handler))
        .route("/v1/sessions/{id}/events", get(sse_events_handler))
        .route("/v1/credentials", post(handlers::create_credential))
        .route("/v1/credentials", get(handlers::list_credentials))
        .route("/v1/credentials/{id}", delete(handlers::delete_credential))
        .route_layer(from_fn_with_state(auth_state, bearer_auth_middleware))
        .route_layer(from_fn_with_state(rate_state, rate_limit_middleware));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves, then drain
/// connections gracefully.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(
    addr: &str,
    router: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "gateway listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}
