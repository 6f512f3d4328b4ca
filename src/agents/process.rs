//! Newline-delimited JSON subprocess transport shared by the SDK adapters.
//!
//! The SDK binary is spawned with a clean environment and piped stdio. A
//! writer task serializes outbound messages to stdin; a reader task parses
//! stdout lines into JSON values; stderr is drained into the log. On top of
//! the transport, [`SdkSessionCore`] pumps wire messages into [`AgentEvent`]s
//! for the runtime, guaranteeing the stream always ends with one `Exit`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::traits::AgentEvent;
use crate::core::events::StatusSnapshot;
use crate::core::session::{ContentBlock, PermissionOption};

/// Channel buffer size for outbound messages.
const WRITE_CHANNEL_SIZE: usize = 64;

/// Channel buffer size for inbound wire messages.
const WIRE_CHANNEL_SIZE: usize = 256;

/// Channel buffer size for translated agent events.
const EVENT_CHANNEL_SIZE: usize = 256;

/// Resolve an SDK binary: absolute paths are checked directly, bare names
/// are searched on `PATH`.
#[must_use]
pub fn resolve_binary(program: &Path) -> Option<PathBuf> {
    if program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Messages both SDKs emit on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SdkWireMessage {
    /// Handshake complete; carries the durable backend session id when the
    /// SDK has one.
    Init {
        /// Durable backend session id.
        session_id: Option<String>,
    },

    /// Assistant text delta.
    TextDelta {
        /// The delta.
        text: String,
    },

    /// Thinking delta.
    ThinkingDelta {
        /// The delta.
        text: String,
    },

    /// Tool call started.
    ToolStart {
        /// Tool call id.
        id: String,
        /// Tool name.
        name: String,
        /// Tool input.
        input: Value,
    },

    /// Tool call finished.
    ToolEnd {
        /// Tool call id.
        id: String,
        /// Result payload.
        result: Value,
    },

    /// The agent needs a permission answer.
    PermissionRequest {
        /// Tool call id.
        id: String,
        /// Human-readable description.
        description: String,
        /// Presented options.
        options: Vec<PermissionOption>,
    },

    /// A permission request was resolved.
    PermissionResolved {
        /// Tool call id.
        id: String,
        /// Chosen option.
        option_id: Option<String>,
        /// Whether the call was denied.
        #[serde(default)]
        denied: bool,
    },

    /// End of turn with the assembled assistant content.
    TurnEnd {
        /// Content blocks of the assistant message.
        content: Vec<ContentBlock>,
        /// Tokens consumed so far.
        #[serde(default)]
        tokens_used: u64,
    },

    /// Model switched (acknowledgement of a setter or a cycle).
    ModelChanged {
        /// The new model.
        model: String,
    },

    /// Thinking level switched.
    ThinkingLevelChanged {
        /// The new level.
        level: String,
    },

    /// Conversation tree state (Pi).
    TreeUpdate {
        /// The tree.
        tree: Value,
    },

    /// Forkable entries (Pi).
    ForkableUpdate {
        /// The entries.
        entries: Value,
    },

    /// Session statistics (Pi).
    StatsUpdate {
        /// The stats.
        stats: Value,
    },

    /// Available models (Pi).
    ModelsUpdate {
        /// The models.
        models: Value,
    },

    /// The SDK reported an error.
    Error {
        /// Description.
        message: String,
        /// Whether the session survives.
        #[serde(default)]
        recoverable: bool,
    },

    /// The SDK is exiting.
    Exit {
        /// Why.
        reason: String,
    },
}

/// A spawned SDK process speaking NDJSON on stdio.
pub struct SdkProcess {
    write_tx: mpsc::Sender<Value>,
    wire_rx: Mutex<Option<mpsc::Receiver<Value>>>,
    cancel: CancellationToken,
    child: Mutex<Child>,
}

impl std::fmt::Debug for SdkProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkProcess").finish_non_exhaustive()
    }
}

impl SdkProcess {
    /// Spawn the SDK binary.
    ///
    /// The child environment is exactly `env`: the parent environment is
    /// cleared so nothing leaks past the isolation layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or its stdio pipes
    /// cannot be taken.
    pub fn spawn(
        program: &Path,
        args: &[String],
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("sdk process has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("sdk process has no stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("sdk process has no stderr"))?;

        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_SIZE);
        let (wire_tx, wire_rx) = mpsc::channel(WIRE_CHANNEL_SIZE);
        let cancel = CancellationToken::new();

        tokio::spawn(writer_loop(stdin, write_rx, cancel.clone()));
        tokio::spawn(reader_loop(stdout, wire_tx, cancel.clone()));
        tokio::spawn(stderr_loop(stderr, cancel.clone()));

        Ok(Self {
            write_tx,
            wire_rx: Mutex::new(Some(wire_rx)),
            cancel,
            child: Mutex::new(child),
        })
    }

    /// Send one message to the SDK.
    ///
    /// # Errors
    ///
    /// Returns an error when the process has exited.
    pub async fn send(&self, message: Value) -> anyhow::Result<()> {
        self.write_tx
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("sdk process stdin closed"))
    }

    /// Take the inbound wire stream. Returns `None` after the first call.
    pub async fn take_wire_stream(&self) -> Option<mpsc::Receiver<Value>> {
        self.wire_rx.lock().await.take()
    }

    /// Stop the transport tasks and kill the child if it is still running.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(?status, "sdk process already exited");
            }
            _ => {
                if let Err(err) = child.kill().await {
                    tracing::warn!(error = %err, "failed to kill sdk process");
                }
            }
        }
    }
}

async fn writer_loop(
    mut stdin: tokio::process::ChildStdin,
    mut write_rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            message = write_rx.recv() => {
                let Some(message) = message else { break };
                let mut line = message.to_string();
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

async fn reader_loop(
    stdout: tokio::process::ChildStdout,
    wire_tx: mpsc::Sender<Value>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(value) => {
                                if wire_tx.send(value).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "unparseable sdk wire line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "sdk stdout read error");
                        break;
                    }
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

async fn stderr_loop(stderr: tokio::process::ChildStderr, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !line.trim().is_empty() {
                            tracing::warn!(target: "aperture::sdk_stderr", "{line}");
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

/// Cached Pi tree state, refreshed from wire updates.
#[derive(Debug, Default)]
pub struct TreeState {
    /// Conversation tree.
    pub tree: Mutex<Value>,
    /// Forkable entries.
    pub forkable: Mutex<Value>,
    /// Session statistics.
    pub stats: Mutex<Value>,
    /// Available models.
    pub models: Mutex<Value>,
}

/// Shared driver for an SDK-backed session: pumps wire messages into agent
/// events, maintains the status snapshot, and guarantees the event stream
/// terminates with exactly one `Exit`.
pub struct SdkSessionCore {
    process: Arc<SdkProcess>,
    event_tx: mpsc::Sender<AgentEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<AgentEvent>>>,
    status: Arc<Mutex<StatusSnapshot>>,
    tree_state: Arc<TreeState>,
    exited: Arc<AtomicBool>,
}

impl std::fmt::Debug for SdkSessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkSessionCore").finish_non_exhaustive()
    }
}

impl SdkSessionCore {
    /// Wrap a spawned process and start the pump task.
    pub async fn start(process: SdkProcess) -> Self {
        let process = Arc::new(process);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let status = Arc::new(Mutex::new(StatusSnapshot::default()));
        let tree_state = Arc::new(TreeState::default());
        let exited = Arc::new(AtomicBool::new(false));

        if let Some(wire_rx) = process.take_wire_stream().await {
            tokio::spawn(pump_loop(
                wire_rx,
                event_tx.clone(),
                Arc::clone(&status),
                Arc::clone(&tree_state),
                Arc::clone(&exited),
            ));
        }

        Self {
            process,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            status,
            tree_state,
            exited,
        }
    }

    /// Send one message to the SDK.
    ///
    /// # Errors
    ///
    /// Returns an error when the process has exited.
    pub async fn send(&self, message: Value) -> anyhow::Result<()> {
        self.process.send(message).await
    }

    /// Hand out the event stream once.
    ///
    /// # Errors
    ///
    /// Returns an error on a second call.
    pub async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<AgentEvent>> {
        self.event_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("backend session already has a subscriber"))
    }

    /// Current status snapshot.
    pub async fn status(&self) -> StatusSnapshot {
        self.status.lock().await.clone()
    }

    /// Cached Pi tree state.
    #[must_use]
    pub fn tree_state(&self) -> &TreeState {
        &self.tree_state
    }

    /// Tear down: emit the final `Exit` (if the SDK has not already) and
    /// kill the process.
    pub async fn dispose(&self, reason: &str) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            let _ = self
                .event_tx
                .send(AgentEvent::Exit {
                    reason: reason.to_owned(),
                })
                .await;
        }
        self.process.shutdown().await;
    }
}

async fn pump_loop(
    mut wire_rx: mpsc::Receiver<Value>,
    event_tx: mpsc::Sender<AgentEvent>,
    status: Arc<Mutex<StatusSnapshot>>,
    tree_state: Arc<TreeState>,
    exited: Arc<AtomicBool>,
) {
    while let Some(value) = wire_rx.recv().await {
        let message = match serde_json::from_value::<SdkWireMessage>(value) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "unknown sdk wire message");
                continue;
            }
        };

        apply_to_status(&status, &message).await;
        apply_to_tree(&tree_state, &message).await;

        let is_exit = matches!(message, SdkWireMessage::Exit { .. });
        if is_exit && exited.swap(true, Ordering::SeqCst) {
            break;
        }
        if let Some(event) = translate(message) {
            if event_tx.send(event).await.is_err() {
                break;
            }
        }
        if is_exit {
            break;
        }
    }

    // The SDK went away without saying goodbye.
    if !exited.swap(true, Ordering::SeqCst) {
        let _ = event_tx
            .send(AgentEvent::Exit {
                reason: "backend stream closed".to_owned(),
            })
            .await;
    }
}

async fn apply_to_status(status: &Mutex<StatusSnapshot>, message: &SdkWireMessage) {
    let mut status = status.lock().await;
    match message {
        SdkWireMessage::Init { session_id } => {
            status.backend_session_id.clone_from(session_id);
            status.resumable = session_id.is_some();
        }
        SdkWireMessage::TextDelta { .. }
        | SdkWireMessage::ThinkingDelta { .. }
        | SdkWireMessage::ToolStart { .. } => {
            status.streaming = true;
        }
        SdkWireMessage::TurnEnd { tokens_used, .. } => {
            status.streaming = false;
            status.tokens_used = *tokens_used;
        }
        SdkWireMessage::ModelChanged { model } => {
            status.model = Some(model.clone());
        }
        SdkWireMessage::ThinkingLevelChanged { level } => {
            status.thinking_level = Some(level.clone());
        }
        SdkWireMessage::Error { recoverable, .. } => {
            if !recoverable {
                status.streaming = false;
            }
        }
        SdkWireMessage::Exit { .. } => {
            status.streaming = false;
        }
        _ => {}
    }
}

async fn apply_to_tree(tree_state: &TreeState, message: &SdkWireMessage) {
    match message {
        SdkWireMessage::TreeUpdate { tree } => {
            *tree_state.tree.lock().await = tree.clone();
        }
        SdkWireMessage::ForkableUpdate { entries } => {
            *tree_state.forkable.lock().await = entries.clone();
        }
        SdkWireMessage::StatsUpdate { stats } => {
            *tree_state.stats.lock().await = stats.clone();
        }
        SdkWireMessage::ModelsUpdate { models } => {
            *tree_state.models.lock().await = models.clone();
        }
        _ => {}
    }
}

/// Map a wire message to the runtime-facing event, or `None` for messages
/// that only update cached state.
fn translate(message: SdkWireMessage) -> Option<AgentEvent> {
    match message {
        SdkWireMessage::Init { session_id } => Some(AgentEvent::Started {
            backend_session_id: session_id,
        }),
        SdkWireMessage::TextDelta { text } => Some(AgentEvent::MessageDelta { text }),
        SdkWireMessage::ThinkingDelta { text } => Some(AgentEvent::ThinkingDelta { text }),
        SdkWireMessage::ToolStart { id, name, input } => Some(AgentEvent::ToolCallStarted {
            tool_call_id: id,
            name,
            input,
        }),
        SdkWireMessage::ToolEnd { id, result } => Some(AgentEvent::ToolCallCompleted {
            tool_call_id: id,
            content: result,
        }),
        SdkWireMessage::PermissionRequest {
            id,
            description,
            options,
        } => Some(AgentEvent::PermissionRequested {
            tool_call_id: id,
            description,
            options,
        }),
        SdkWireMessage::PermissionResolved {
            id,
            option_id,
            denied,
        } => Some(AgentEvent::PermissionResolved {
            tool_call_id: id,
            option_id,
            denied,
        }),
        SdkWireMessage::TurnEnd {
            content,
            tokens_used,
        } => Some(AgentEvent::TurnComplete {
            content,
            tokens_used,
        }),
        SdkWireMessage::Error {
            message,
            recoverable,
        } => Some(AgentEvent::Error {
            message,
            recoverable,
        }),
        SdkWireMessage::Exit { reason } => Some(AgentEvent::Exit { reason }),
        SdkWireMessage::ModelChanged { .. }
        | SdkWireMessage::ThinkingLevelChanged { .. }
        | SdkWireMessage::TreeUpdate { .. }
        | SdkWireMessage::ForkableUpdate { .. }
        | SdkWireMessage::StatsUpdate { .. }
        | SdkWireMessage::ModelsUpdate { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_tags() {
        let message: SdkWireMessage =
            serde_json::from_str(r#"{"type":"text_delta","text":"hi"}"#).unwrap();
        assert!(matches!(message, SdkWireMessage::TextDelta { .. }));

        let message: SdkWireMessage =
            serde_json::from_str(r#"{"type":"init","session_id":"bk-1"}"#).unwrap();
        assert!(matches!(
            message,
            SdkWireMessage::Init {
                session_id: Some(_)
            }
        ));

        let message: SdkWireMessage =
            serde_json::from_str(r#"{"type":"turn_end","content":[{"type":"text","text":"x"}]}"#)
                .unwrap();
        assert!(matches!(message, SdkWireMessage::TurnEnd { tokens_used: 0, .. }));
    }

    #[test]
    fn test_translate_drops_cache_only_messages() {
        assert!(
            translate(SdkWireMessage::TreeUpdate {
                tree: Value::Null
            })
            .is_none()
        );
        assert!(
            translate(SdkWireMessage::TextDelta {
                text: "x".to_owned()
            })
            .is_some()
        );
    }
}
