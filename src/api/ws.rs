//! Bidirectional frame channel (WebSocket).
//!
//! Each connection subscribes to exactly one session. Inbound frames are
//! measured before parsing, dispatched through the command table, and
//! answered with `result`/`error` frames; outbound session events are
//! forwarded from the runtime's bounded subscription. A client that cannot
//! keep up with the write deadline is closed as a slow consumer.

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket},
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use super::handlers::{AppState, parse_session_id, validate_images};
use super::protocol::{
    ClientCommand, ERR_FRAME_TOO_LARGE, ERR_INVALID_PARAMS, ERR_PARSE, ERR_UNKNOWN_COMMAND,
    ServerFrame,
};
use crate::agents::traits::TreeQuery;
use crate::core::errors::RuntimeError;
use crate::core::runtime::SessionRuntime;
use crate::core::session::AgentKind;

/// Close code for sessions that do not exist.
const CLOSE_NOT_FOUND: u16 = 1008;

/// Close code for slow consumers.
const CLOSE_SLOW_CONSUMER: u16 = 1013;

/// Deadline for one outbound write before the peer counts as slow.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Upgrade handler for `/v1/sessions/{id}/ws`.
pub async fn ws_session_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_session_socket(socket, id, state))
}

async fn handle_session_socket(mut socket: WebSocket, raw_id: String, state: AppState) {
    let Ok(session_id) = parse_session_id(&raw_id) else {
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_NOT_FOUND,
                reason: Utf8Bytes::from_static("invalid session id"),
            })))
            .await;
        return;
    };

    let Some(runtime) = state.manager.get_runtime(session_id).await else {
        tracing::debug!(session_id = %session_id, "frame channel to unknown session");
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_NOT_FOUND,
                reason: Utf8Bytes::from_static("session not found"),
            })))
            .await;
        return;
    };

    let Ok((subscriber_id, mut events)) = runtime.subscribe().await else {
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_NOT_FOUND,
                reason: Utf8Bytes::from_static("session has ended"),
            })))
            .await;
        return;
    };

    tracing::info!(session_id = %session_id, subscriber_id = %subscriber_id, "frame channel open");

    let (mut sink, mut stream) = socket.split();

    // Replay the latest persisted state before live events so reconnecting
    // clients can render without waiting for the next turn.
    if let Ok(status) = runtime.status().await {
        let message = state.store.latest_message(session_id).await.ok().flatten();
        if send_frame(&mut sink, &ServerFrame::Replay { status, message })
            .await
            .is_err()
        {
            runtime.unsubscribe(subscriber_id).await;
            return;
        }
    }

    let max_frame_bytes = state.config.max_message_size_bytes;
    let mut slow_consumer = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(payload) => payload,
                            Err(err) => {
                                tracing::error!(error = %err, "unserializable session event");
                                continue;
                            }
                        };
                        let write = sink.send(WsMessage::Text(payload.into()));
                        match tokio::time::timeout(WRITE_DEADLINE, write).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => break,
                            Err(_) => {
                                // Peer is not draining; cut it loose rather
                                // than stall the event pump.
                                slow_consumer = true;
                                break;
                            }
                        }
                    }
                    // Runtime closed the stream: session ended.
                    None => break,
                }
            }

            inbound = stream.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        let reply = handle_frame(&runtime, &state, text.as_str(), max_frame_bytes).await;
                        if send_frame(&mut sink, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        // Frames are JSON text; measure then reject.
                        let reply = if bytes.len() > max_frame_bytes {
                            oversize_frame(bytes.len(), max_frame_bytes)
                        } else {
                            ServerFrame::error(ERR_PARSE, "binary frames are not supported")
                        };
                        if send_frame(&mut sink, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                    Some(Err(err)) => {
                        tracing::debug!(session_id = %session_id, error = %err, "frame channel error");
                        break;
                    }
                }
            }
        }
    }

    // Client-close cancels the subscription but never the session.
    runtime.unsubscribe(subscriber_id).await;

    if slow_consumer {
        tracing::warn!(
            session_id = %session_id,
            subscriber_id = %subscriber_id,
            "closing slow consumer"
        );
        let _ = sink
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_SLOW_CONSUMER,
                reason: Utf8Bytes::from_static("slow consumer"),
            })))
            .await;
    }

    tracing::info!(session_id = %session_id, subscriber_id = %subscriber_id, "frame channel closed");
}

async fn send_frame(
    sink: &mut futures::stream::SplitSink<WebSocket, WsMessage>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(frame).unwrap_or_else(|_| {
        r#"{"type":"error","code":-32603,"message":"unserializable frame"}"#.to_owned()
    });
    sink.send(WsMessage::Text(payload.into())).await
}

fn oversize_frame(actual: usize, limit: usize) -> ServerFrame {
    ServerFrame::error(
        ERR_FRAME_TOO_LARGE,
        format!("frame of {actual} bytes exceeds limit of {limit} bytes"),
    )
}

/// Size-check, parse, and dispatch one inbound frame.
async fn handle_frame(
    runtime: &SessionRuntime,
    state: &AppState,
    text: &str,
    max_frame_bytes: usize,
) -> ServerFrame {
    // Measured pre-parse; over-size frames are never handed to the parser.
    if text.len() > max_frame_bytes {
        return oversize_frame(text.len(), max_frame_bytes);
    }

    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(err) => {
            return if serde_json::from_str::<serde_json::Value>(text).is_ok() {
                ServerFrame::error(ERR_UNKNOWN_COMMAND, format!("unknown command: {err}"))
            } else {
                ServerFrame::error(ERR_PARSE, format!("invalid json: {err}"))
            };
        }
    };

    dispatch_command(runtime, state, command).await
}

/// The command table: one arm per inbound command type.
pub async fn dispatch_command(
    runtime: &SessionRuntime,
    state: &AppState,
    command: ClientCommand,
) -> ServerFrame {
    match command {
        ClientCommand::UserMessage { content, images } => {
            if let Err(reason) = validate_images(&images) {
                return ServerFrame::error(ERR_INVALID_PARAMS, reason);
            }
            reply(runtime.send_prompt(content, images).await)
        }

        ClientCommand::PermissionResponse {
            tool_call_id,
            option_id,
            answers,
        } => reply(
            runtime
                .respond_to_permission(tool_call_id, option_id, answers)
                .await,
        ),

        ClientCommand::Cancel => reply(runtime.cancel_prompt().await),
        ClientCommand::Interrupt => reply(runtime.interrupt().await),

        ClientCommand::SetPermissionMode { mode } => reply(runtime.set_permission_mode(mode).await),
        ClientCommand::SetModel { model } => reply(runtime.set_model(model).await),
        ClientCommand::SetThinkingTokens { tokens } => {
            reply(runtime.set_max_thinking_tokens(tokens).await)
        }

        // Advisory operations with no backend counterpart yet: acknowledged
        // so clients need no special-casing.
        ClientCommand::RewindFiles { .. }
        | ClientCommand::SetMcpServers { .. }
        | ClientCommand::UpdateConfig { .. } => ServerFrame::ok(),

        ClientCommand::GetMcpStatus => ServerFrame::result(json!({"servers": []})),

        ClientCommand::GetAccountInfo => match state
            .manager
            .get_session(runtime.session_id())
            .await
        {
            Ok(Some(session)) => ServerFrame::result(json!({
                "agent": session.agent,
                "auth": session.auth.redacted(),
            })),
            Ok(None) => ServerFrame::error(-32603, "session record missing"),
            Err(err) => ServerFrame::error(-32603, err.to_string()),
        },

        ClientCommand::GetSupportedModels => match runtime.agent() {
            AgentKind::ClaudeSdk => {
                ServerFrame::result(json!({"models": ["sonnet", "opus", "haiku"]}))
            }
            AgentKind::PiSdk => match runtime.tree_query(TreeQuery::Models).await {
                Ok(models) => ServerFrame::result(json!({"models": models})),
                Err(err) => frame_error(&err),
            },
        },

        ClientCommand::GetSupportedCommands => {
            ServerFrame::result(json!({"commands": ClientCommand::supported()}))
        }

        // The Pi family maps onto the generic runtime surface; the runtime
        // rejects them on Claude.
        ClientCommand::PiSteer { content } => reply(runtime.steer(content).await),
        ClientCommand::PiFollowUp { content } => reply(runtime.follow_up(content).await),
        ClientCommand::PiCompact { instructions } => reply(runtime.compact(instructions).await),
        ClientCommand::PiFork { entry_id } => reply(runtime.fork(entry_id).await),
        ClientCommand::PiNavigate { entry_id } => reply(runtime.navigate(entry_id).await),
        ClientCommand::PiSetModel { model } => reply(runtime.set_model(model).await),
        ClientCommand::PiCycleModel => reply(runtime.cycle_model().await),
        ClientCommand::PiSetThinkingLevel { level } => {
            reply(runtime.set_thinking_level(level).await)
        }
        ClientCommand::PiCycleThinking => reply(runtime.cycle_thinking_level().await),
        ClientCommand::PiNewSession => reply(runtime.new_session().await),

        ClientCommand::PiGetTree => tree_reply(runtime.tree_query(TreeQuery::Tree).await),
        ClientCommand::PiGetForkable => tree_reply(runtime.tree_query(TreeQuery::Forkable).await),
        ClientCommand::PiGetStats => tree_reply(runtime.tree_query(TreeQuery::Stats).await),
        ClientCommand::PiGetModels => tree_reply(runtime.tree_query(TreeQuery::Models).await),
    }
}

fn reply(result: Result<(), RuntimeError>) -> ServerFrame {
    match result {
        Ok(()) => ServerFrame::ok(),
        Err(err) => frame_error(&err),
    }
}

fn tree_reply(result: Result<serde_json::Value, RuntimeError>) -> ServerFrame {
    match result {
        Ok(value) => ServerFrame::result(value),
        Err(err) => frame_error(&err),
    }
}

fn frame_error(err: &RuntimeError) -> ServerFrame {
    ServerFrame::error(err.code(), err.to_string())
}
