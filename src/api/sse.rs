//! One-way event stream (SSE).
//!
//! GET-style consumers (EventSource) get an initial `connected` sentinel,
//! then the session's live events, with periodic keep-alives. The stream
//! ends when the session does. Delivery is skip-on-overflow: a consumer
//! that falls behind its bounded buffer is dropped by the runtime, and the
//! client is expected to reconnect and re-read persisted state.

use axum::{
    extract::{Path, State},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

use super::handlers::{AppError, AppState, parse_session_id};

/// Keep-alive interval for proxies that reap quiet connections.
const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Handler for `/v1/sessions/{id}/events`.
pub async fn sse_events_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let session_id = parse_session_id(&id)?;

    let Some(runtime) = state.manager.get_runtime(session_id).await else {
        return Err(AppError::NotFound(format!(
            "session not found: {session_id}"
        )));
    };

    let Ok((subscriber_id, events)) = runtime.subscribe().await else {
        return Err(AppError::NotFound(format!(
            "session has ended: {session_id}"
        )));
    };

    tracing::info!(
        session_id = %session_id,
        subscriber_id = %subscriber_id,
        "event stream open"
    );

    let connected = stream::once(async move {
        Ok::<_, Infallible>(
            Event::default()
                .event("connected")
                .data(json!({"sessionId": session_id}).to_string()),
        )
    });

    let live = ReceiverStream::new(events).map(|event| {
        let data = serde_json::to_string(&event)
            .unwrap_or_else(|_| json!({"type": "error", "payload": {"message": "unserializable event", "recoverable": true}}).to_string());
        Ok::<_, Infallible>(Event::default().data(data))
    });

    // Dropping the stream drops the receiver; the runtime notices the
    // closed channel on its next send and detaches the subscriber.
    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(connected.chain(live));

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
        .into_response())
}
