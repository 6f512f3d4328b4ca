//! Per-session runtime: owns the backend session, runs the streaming state
//! machine, fans events out to subscribers, enforces the idle timeout, and
//! persists terminal events.
//!
//! The runtime is a single tokio task. The public [`SessionRuntime`] handle
//! sends commands (each carrying a oneshot reply) into the task's inbox, so
//! commands from one connection are processed in send order and the task
//! never holds a lock across a backend call. Subscribers get bounded
//! channels; a slow subscriber is dropped rather than allowed to stall the
//! backend or its peers.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::agents::traits::{AgentEvent, BackendSession, PromptOptions, TreeQuery};
use crate::core::errors::RuntimeError;
use crate::core::events::{SessionEvent, SessionEventKind, StatusSnapshot};
use crate::core::session::{
    AgentKind, ContentBlock, ImageAttachment, Message, MessageContent, MessageRole,
    PendingPermission,
};
use crate::store::Store;

/// Default per-subscriber event buffer.
pub const SUBSCRIBER_BUFFER: usize = 128;

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Idle timeout; fires only in the idle state.
    pub idle_timeout: Duration,
    /// Deadline for operations awaiting backend completion.
    pub rpc_timeout: Duration,
    /// Deadline for backend disposal on terminate/shutdown.
    pub shutdown_deadline: Duration,
    /// Per-subscriber buffered events before the subscriber is dropped.
    pub subscriber_buffer: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            rpc_timeout: Duration::from_secs(300),
            shutdown_deadline: Duration::from_secs(10),
            subscriber_buffer: SUBSCRIBER_BUFFER,
        }
    }
}

/// Runtime state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Streaming,
    AwaitingPermission,
    Ended,
}

impl Phase {
    const fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::AwaitingPermission => "awaiting_permission",
            Self::Ended => "ended",
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, RuntimeError>>;

/// Commands accepted by the runtime task.
enum Command {
    Prompt {
        text: String,
        images: Vec<ImageAttachment>,
        reply: Reply<()>,
    },
    Steer {
        text: String,
        reply: Reply<()>,
    },
    FollowUp {
        text: String,
        reply: Reply<()>,
    },
    CancelPrompt {
        reply: Reply<()>,
    },
    Interrupt {
        reply: Reply<()>,
    },
    RespondToPermission {
        tool_call_id: String,
        option_id: Option<String>,
        answers: Option<Value>,
        reply: Reply<()>,
    },
    CancelPermission {
        tool_call_id: String,
        reply: Reply<()>,
    },
    Setter {
        operation: &'static str,
        setter: Setter,
        reply: Reply<()>,
    },
    Compact {
        instructions: Option<String>,
        reply: Reply<()>,
    },
    Tree {
        operation: &'static str,
        op: TreeOp,
        reply: Reply<()>,
    },
    TreeQuery {
        query: TreeQuery,
        reply: Reply<Value>,
    },
    Subscribe {
        buffer: Option<usize>,
        reply: Reply<(Uuid, mpsc::Receiver<SessionEvent>)>,
    },
    Unsubscribe {
        subscriber_id: Uuid,
    },
    Status {
        reply: Reply<StatusSnapshot>,
    },
    Terminate {
        reply: Reply<()>,
    },
}

/// Advisory state changes; last writer wins.
enum Setter {
    Model(String),
    PermissionMode(String),
    MaxThinkingTokens(u32),
    ThinkingLevel(String),
    CycleModel,
    CycleThinkingLevel,
}

/// Pi-only tree mutations.
enum TreeOp {
    Fork(String),
    Navigate(String),
    NewSession,
}

/// Handle to a running session runtime. Cloneable; all clones talk to the
/// same task.
#[derive(Clone)]
pub struct SessionRuntime {
    session_id: Uuid,
    agent: AgentKind,
    cmd_tx: mpsc::Sender<Command>,
    rpc_timeout: Duration,
}

impl std::fmt::Debug for SessionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRuntime")
            .field("session_id", &self.session_id)
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

impl SessionRuntime {
    /// Start a runtime for an already-opened backend session. Takes the
    /// backend's event stream and spawns the runtime task; on return the
    /// runtime is in the idle state and accepting commands.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend's event stream was already taken.
    pub async fn start(
        session_id: Uuid,
        agent: AgentKind,
        backend: Box<dyn BackendSession>,
        store: Arc<dyn Store>,
        options: RuntimeOptions,
    ) -> anyhow::Result<Self> {
        let backend_rx = backend.subscribe().await?;
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let rpc_timeout = options.rpc_timeout;

        let task = RuntimeTask {
            session_id,
            agent,
            phase: Phase::Idle,
            backend,
            backend_rx,
            cmd_rx,
            store,
            subscribers: HashMap::new(),
            subscriber_buffer: options.subscriber_buffer,
            seq: 0,
            idle_timeout: options.idle_timeout,
            idle_deadline: Instant::now() + options.idle_timeout,
            shutdown_deadline: options.shutdown_deadline,
            pending_permissions: HashMap::new(),
            assembler: TurnAssembler::default(),
            exit_waiters: Vec::new(),
        };
        tokio::spawn(task.run());

        Ok(Self {
            session_id,
            agent,
            cmd_tx,
            rpc_timeout,
        })
    }

    /// Session id this runtime serves.
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Agent kind this runtime drives.
    #[must_use]
    pub const fn agent(&self) -> AgentKind {
        self.agent
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| RuntimeError::Ended)?;
        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RuntimeError::Ended),
            Err(_) => Err(RuntimeError::Timeout { operation }),
        }
    }

    /// Enqueue one user turn.
    ///
    /// # Errors
    ///
    /// Rejected while another prompt is in flight.
    pub async fn send_prompt(
        &self,
        text: String,
        images: Vec<ImageAttachment>,
    ) -> Result<(), RuntimeError> {
        self.call("prompt", |reply| Command::Prompt {
            text,
            images,
            reply,
        })
        .await
    }

    /// Interrupt the current generation with redirecting content.
    ///
    /// # Errors
    ///
    /// Valid only while streaming.
    pub async fn steer(&self, text: String) -> Result<(), RuntimeError> {
        self.call("steer", |reply| Command::Steer { text, reply }).await
    }

    /// Queue a post-turn message while streaming.
    ///
    /// # Errors
    ///
    /// Valid only while streaming.
    pub async fn follow_up(&self, text: String) -> Result<(), RuntimeError> {
        self.call("follow_up", |reply| Command::FollowUp { text, reply })
            .await
    }

    /// Abort the current turn.
    ///
    /// # Errors
    ///
    /// Valid while streaming or awaiting permission.
    pub async fn cancel_prompt(&self) -> Result<(), RuntimeError> {
        self.call("cancel", |reply| Command::CancelPrompt { reply })
            .await
    }

    /// Hard-interrupt the current turn.
    ///
    /// # Errors
    ///
    /// Valid while streaming or awaiting permission.
    pub async fn interrupt(&self) -> Result<(), RuntimeError> {
        self.call("interrupt", |reply| Command::Interrupt { reply })
            .await
    }

    /// Answer a pending permission request.
    ///
    /// # Errors
    ///
    /// Unknown tool call ids are rejected.
    pub async fn respond_to_permission(
        &self,
        tool_call_id: String,
        option_id: Option<String>,
        answers: Option<Value>,
    ) -> Result<(), RuntimeError> {
        self.call("permission_response", |reply| Command::RespondToPermission {
            tool_call_id,
            option_id,
            answers,
            reply,
        })
        .await
    }

    /// Withdraw a pending permission request.
    ///
    /// # Errors
    ///
    /// Unknown tool call ids are rejected.
    pub async fn cancel_permission(&self, tool_call_id: String) -> Result<(), RuntimeError> {
        self.call("permission_cancel", |reply| Command::CancelPermission {
            tool_call_id,
            reply,
        })
        .await
    }

    /// Advisory model switch.
    ///
    /// # Errors
    ///
    /// Rejected after the session ended.
    pub async fn set_model(&self, model: String) -> Result<(), RuntimeError> {
        self.setter("set_model", Setter::Model(model)).await
    }

    /// Advisory permission-mode switch.
    ///
    /// # Errors
    ///
    /// Rejected after the session ended.
    pub async fn set_permission_mode(&self, mode: String) -> Result<(), RuntimeError> {
        self.setter("set_permission_mode", Setter::PermissionMode(mode))
            .await
    }

    /// Advisory thinking-token cap.
    ///
    /// # Errors
    ///
    /// Rejected after the session ended.
    pub async fn set_max_thinking_tokens(&self, tokens: u32) -> Result<(), RuntimeError> {
        self.setter("set_thinking_tokens", Setter::MaxThinkingTokens(tokens))
            .await
    }

    /// Advisory thinking-level switch.
    ///
    /// # Errors
    ///
    /// Rejected after the session ended.
    pub async fn set_thinking_level(&self, level: String) -> Result<(), RuntimeError> {
        self.setter("set_thinking_level", Setter::ThinkingLevel(level))
            .await
    }

    /// Advisory: cycle model.
    ///
    /// # Errors
    ///
    /// Rejected after the session ended.
    pub async fn cycle_model(&self) -> Result<(), RuntimeError> {
        self.setter("cycle_model", Setter::CycleModel).await
    }

    /// Advisory: cycle thinking level.
    ///
    /// # Errors
    ///
    /// Rejected after the session ended.
    pub async fn cycle_thinking_level(&self) -> Result<(), RuntimeError> {
        self.setter("cycle_thinking", Setter::CycleThinkingLevel).await
    }

    async fn setter(&self, operation: &'static str, setter: Setter) -> Result<(), RuntimeError> {
        self.call(operation, |reply| Command::Setter {
            operation,
            setter,
            reply,
        })
        .await
    }

    /// Summarize and trim backend history.
    ///
    /// # Errors
    ///
    /// Rejected unless idle (Pi may compact during streaming control).
    pub async fn compact(&self, instructions: Option<String>) -> Result<(), RuntimeError> {
        self.call("compact", |reply| Command::Compact {
            instructions,
            reply,
        })
        .await
    }

    /// Fork from an entry (Pi only).
    ///
    /// # Errors
    ///
    /// Rejected on Claude and outside idle/streaming-control.
    pub async fn fork(&self, entry_id: String) -> Result<(), RuntimeError> {
        self.call("fork", |reply| Command::Tree {
            operation: "fork",
            op: TreeOp::Fork(entry_id),
            reply,
        })
        .await
    }

    /// Navigate to an entry (Pi only).
    ///
    /// # Errors
    ///
    /// Rejected on Claude and outside idle/streaming-control.
    pub async fn navigate(&self, entry_id: String) -> Result<(), RuntimeError> {
        self.call("navigate", |reply| Command::Tree {
            operation: "navigate",
            op: TreeOp::Navigate(entry_id),
            reply,
        })
        .await
    }

    /// Start a fresh backend conversation (Pi only).
    ///
    /// # Errors
    ///
    /// Rejected on Claude and outside idle/streaming-control.
    pub async fn new_session(&self) -> Result<(), RuntimeError> {
        self.call("new_session", |reply| Command::Tree {
            operation: "new_session",
            op: TreeOp::NewSession,
            reply,
        })
        .await
    }

    /// Read tree state (Pi only).
    ///
    /// # Errors
    ///
    /// Rejected on Claude.
    pub async fn tree_query(&self, query: TreeQuery) -> Result<Value, RuntimeError> {
        self.call("tree_query", |reply| Command::TreeQuery { query, reply })
            .await
    }

    /// Subscribe to the event stream. Returns the subscriber id (for
    /// unsubscribe) and a bounded receiver; falling behind by more than the
    /// buffer drops the subscription.
    ///
    /// # Errors
    ///
    /// Rejected after the session ended.
    pub async fn subscribe(&self) -> Result<(Uuid, mpsc::Receiver<SessionEvent>), RuntimeError> {
        self.call("subscribe", |reply| Command::Subscribe {
            buffer: None,
            reply,
        })
        .await
    }

    /// Subscribe with an explicit buffer size (the mux sizes buffers to the
    /// consumer's drain characteristics).
    ///
    /// # Errors
    ///
    /// Rejected after the session ended.
    pub async fn subscribe_with_buffer(
        &self,
        buffer: usize,
    ) -> Result<(Uuid, mpsc::Receiver<SessionEvent>), RuntimeError> {
        self.call("subscribe", |reply| Command::Subscribe {
            buffer: Some(buffer),
            reply,
        })
        .await
    }

    /// Drop a subscription. Fire-and-forget; safe after the session ended.
    pub async fn unsubscribe(&self, subscriber_id: Uuid) {
        let _ = self
            .cmd_tx
            .send(Command::Unsubscribe { subscriber_id })
            .await;
    }

    /// Point-in-time status snapshot.
    ///
    /// # Errors
    ///
    /// Rejected after the session ended.
    pub async fn status(&self) -> Result<StatusSnapshot, RuntimeError> {
        self.call("status", |reply| Command::Status { reply }).await
    }

    /// Terminate the session: dispose the backend (bounded by the shutdown
    /// deadline) and wait for the final exit.
    ///
    /// # Errors
    ///
    /// Returns `Ended` if the runtime is already gone (which is fine).
    pub async fn terminate(&self) -> Result<(), RuntimeError> {
        self.call("terminate", |reply| Command::Terminate { reply })
            .await
    }
}

/// The runtime task state.
struct RuntimeTask {
    session_id: Uuid,
    agent: AgentKind,
    phase: Phase,
    backend: Box<dyn BackendSession>,
    backend_rx: mpsc::Receiver<AgentEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    store: Arc<dyn Store>,
    subscribers: HashMap<Uuid, mpsc::Sender<SessionEvent>>,
    subscriber_buffer: usize,
    seq: u64,
    idle_timeout: Duration,
    idle_deadline: Instant,
    shutdown_deadline: Duration,
    pending_permissions: HashMap<String, PendingPermission>,
    assembler: TurnAssembler,
    exit_waiters: Vec<Reply<()>>,
}

impl RuntimeTask {
    async fn run(mut self) {
        tracing::debug!(session_id = %self.session_id, "session runtime started");
        self.emit(SessionEventKind::Status(self.backend.status().await));

        loop {
            let idle_armed = self.phase == Phase::Idle;
            tokio::select! {
                Some(command) = self.cmd_rx.recv() => {
                    self.bump_idle_deadline();
                    self.handle_command(command).await;
                }
                event = self.backend_rx.recv() => {
                    self.bump_idle_deadline();
                    match event {
                        Some(event) => self.handle_backend_event(event).await,
                        None => self.finish("backend stream closed").await,
                    }
                }
                () = tokio::time::sleep_until(self.idle_deadline), if idle_armed => {
                    self.on_idle_timeout().await;
                }
            }

            if self.phase == Phase::Ended {
                break;
            }
        }

        tracing::debug!(session_id = %self.session_id, "session runtime stopped");
    }

    fn bump_idle_deadline(&mut self) {
        self.idle_deadline = Instant::now() + self.idle_timeout;
    }

    async fn handle_command(&mut self, command: Command) {
        if self.phase == Phase::Ended {
            reply_err(command, RuntimeError::Ended);
            return;
        }

        match command {
            Command::Prompt {
                text,
                images,
                reply,
            } => {
                let result = match self.phase {
                    Phase::Streaming | Phase::AwaitingPermission => {
                        Err(RuntimeError::PromptInFlight)
                    }
                    Phase::Idle => {
                        match self
                            .backend
                            .prompt(&text, &images, PromptOptions::default())
                            .await
                        {
                            Ok(()) => {
                                self.phase = Phase::Streaming;
                                self.assembler = TurnAssembler::default();
                                self.touch().await;
                                Ok(())
                            }
                            Err(source) => Err(RuntimeError::Backend { source }),
                        }
                    }
                    Phase::Ended => Err(RuntimeError::Ended),
                };
                let _ = reply.send(result);
            }

            Command::Steer { text, reply } => {
                let result = if self.phase == Phase::Streaming {
                    self.backend
                        .steer(&text)
                        .await
                        .map_err(|source| RuntimeError::Backend { source })
                } else {
                    Err(RuntimeError::InvalidState {
                        operation: "steer",
                        state: self.phase.name(),
                    })
                };
                let _ = reply.send(result);
            }

            Command::FollowUp { text, reply } => {
                // followUp is the one input explicitly allowed to queue
                // during streaming.
                let result = if self.phase == Phase::Streaming {
                    self.backend
                        .follow_up(&text)
                        .await
                        .map_err(|source| RuntimeError::Backend { source })
                } else {
                    Err(RuntimeError::InvalidState {
                        operation: "follow_up",
                        state: self.phase.name(),
                    })
                };
                let _ = reply.send(result);
            }

            Command::CancelPrompt { reply } => {
                let result = match self.phase {
                    Phase::Streaming | Phase::AwaitingPermission => self
                        .backend
                        .cancel()
                        .await
                        .map_err(|source| RuntimeError::Backend { source }),
                    _ => Err(RuntimeError::InvalidState {
                        operation: "cancel",
                        state: self.phase.name(),
                    }),
                };
                let _ = reply.send(result);
            }

            Command::Interrupt { reply } => {
                let result = match self.phase {
                    Phase::Streaming | Phase::AwaitingPermission => self
                        .backend
                        .interrupt()
                        .await
                        .map_err(|source| RuntimeError::Backend { source }),
                    _ => Err(RuntimeError::InvalidState {
                        operation: "interrupt",
                        state: self.phase.name(),
                    }),
                };
                let _ = reply.send(result);
            }

            Command::RespondToPermission {
                tool_call_id,
                option_id,
                answers,
                reply,
            } => {
                let result = if self.pending_permissions.remove(&tool_call_id).is_none() {
                    Err(RuntimeError::UnknownPermission { tool_call_id })
                } else {
                    self.backend
                        .respond_to_permission(&tool_call_id, option_id.as_deref(), answers)
                        .await
                        .map_err(|source| RuntimeError::Backend { source })
                };
                let _ = reply.send(result);
            }

            Command::CancelPermission {
                tool_call_id,
                reply,
            } => {
                let result = if self.pending_permissions.remove(&tool_call_id).is_none() {
                    Err(RuntimeError::UnknownPermission { tool_call_id })
                } else {
                    self.backend
                        .cancel_permission(&tool_call_id)
                        .await
                        .map_err(|source| RuntimeError::Backend { source })
                };
                let _ = reply.send(result);
            }

            Command::Setter {
                operation: _,
                setter,
                reply,
            } => {
                // Advisory; never fatal, last writer wins.
                let result = match setter {
                    Setter::Model(model) => self.backend.set_model(&model).await,
                    Setter::PermissionMode(mode) => self.backend.set_permission_mode(&mode).await,
                    Setter::MaxThinkingTokens(tokens) => {
                        self.backend.set_max_thinking_tokens(tokens).await
                    }
                    Setter::ThinkingLevel(level) => self.backend.set_thinking_level(&level).await,
                    Setter::CycleModel => self.backend.cycle_model().await,
                    Setter::CycleThinkingLevel => self.backend.cycle_thinking_level().await,
                };
                let _ = reply.send(result.map_err(|source| RuntimeError::Backend { source }));
            }

            Command::Compact {
                instructions,
                reply,
            } => {
                let result = if self.tree_ops_permitted() {
                    self.backend
                        .compact(instructions.as_deref())
                        .await
                        .map_err(|source| RuntimeError::Backend { source })
                } else {
                    Err(RuntimeError::InvalidState {
                        operation: "compact",
                        state: self.phase.name(),
                    })
                };
                let _ = reply.send(result);
            }

            Command::Tree {
                operation,
                op,
                reply,
            } => {
                let result = if self.agent != AgentKind::PiSdk {
                    Err(RuntimeError::Unsupported {
                        operation,
                        agent: self.agent,
                    })
                } else if !self.tree_ops_permitted() {
                    Err(RuntimeError::InvalidState {
                        operation,
                        state: self.phase.name(),
                    })
                } else {
                    let call = match op {
                        TreeOp::Fork(entry_id) => self.backend.fork(&entry_id).await,
                        TreeOp::Navigate(entry_id) => self.backend.navigate(&entry_id).await,
                        TreeOp::NewSession => self.backend.new_session().await,
                    };
                    call.map_err(|source| RuntimeError::Backend { source })
                };
                let _ = reply.send(result);
            }

            Command::TreeQuery { query, reply } => {
                let result = if self.agent == AgentKind::PiSdk {
                    self.backend
                        .tree_query(query)
                        .await
                        .map_err(|source| RuntimeError::Backend { source })
                } else {
                    Err(RuntimeError::Unsupported {
                        operation: "tree_query",
                        agent: self.agent,
                    })
                };
                let _ = reply.send(result);
            }

            Command::Subscribe { buffer, reply } => {
                let subscriber_id = Uuid::new_v4();
                let capacity = buffer.unwrap_or(self.subscriber_buffer).max(1);
                let (tx, rx) = mpsc::channel(capacity);
                self.subscribers.insert(subscriber_id, tx);
                tracing::debug!(
                    session_id = %self.session_id,
                    subscriber_id = %subscriber_id,
                    subscribers = self.subscribers.len(),
                    "subscriber attached"
                );
                let _ = reply.send(Ok((subscriber_id, rx)));
            }

            Command::Unsubscribe { subscriber_id } => {
                if self.subscribers.remove(&subscriber_id).is_some() {
                    tracing::debug!(
                        session_id = %self.session_id,
                        subscriber_id = %subscriber_id,
                        "subscriber detached"
                    );
                }
            }

            Command::Status { reply } => {
                let mut status = self.backend.status().await;
                status.streaming =
                    matches!(self.phase, Phase::Streaming | Phase::AwaitingPermission);
                let _ = reply.send(Ok(status));
            }

            Command::Terminate { reply } => {
                self.exit_waiters.push(reply);
                self.dispose_backend().await;
                self.finish("client request").await;
            }
        }
    }

    /// fork/navigate/new_session/compact: idle, or Pi during explicit
    /// streaming control.
    fn tree_ops_permitted(&self) -> bool {
        self.phase == Phase::Idle
            || (self.agent == AgentKind::PiSdk && self.phase == Phase::Streaming)
    }

    async fn handle_backend_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Started { backend_session_id } => {
                if let Some(backend_session_id) = backend_session_id {
                    if let Err(err) = self
                        .store
                        .set_backend_session_id(self.session_id, &backend_session_id)
                        .await
                    {
                        tracing::warn!(
                            session_id = %self.session_id,
                            error = %err,
                            "failed to record backend session id"
                        );
                    }
                }
            }

            AgentEvent::MessageDelta { text } => {
                self.assembler.push_text(&text);
                self.emit(SessionEventKind::MessageChunk { delta: text });
            }

            AgentEvent::ThinkingDelta { text } => {
                self.assembler.push_thinking(&text);
                self.emit(SessionEventKind::ThinkingChunk { delta: text });
            }

            AgentEvent::ToolCallStarted {
                tool_call_id,
                name,
                input,
            } => {
                self.emit(SessionEventKind::ToolCallStarted {
                    tool_call_id,
                    name,
                    input,
                });
            }

            AgentEvent::ToolCallCompleted {
                tool_call_id,
                content,
            } => {
                self.emit(SessionEventKind::ToolCallCompleted {
                    tool_call_id,
                    content,
                });
            }

            AgentEvent::PermissionRequested {
                tool_call_id,
                description,
                options,
            } => {
                self.pending_permissions.insert(
                    tool_call_id.clone(),
                    PendingPermission {
                        session_id: self.session_id,
                        tool_call_id: tool_call_id.clone(),
                        description: description.clone(),
                        options: options.clone(),
                        requested_at: chrono::Utc::now(),
                    },
                );
                // Idle timer is effectively paused here: it only arms in
                // the idle phase.
                self.phase = Phase::AwaitingPermission;
                self.emit_and_log(SessionEventKind::PermissionRequest {
                    tool_call_id,
                    description,
                    options,
                })
                .await;
            }

            AgentEvent::PermissionResolved {
                tool_call_id,
                option_id,
                denied,
            } => {
                self.pending_permissions.remove(&tool_call_id);
                if self.phase == Phase::AwaitingPermission {
                    self.phase = Phase::Streaming;
                }
                self.emit_and_log(SessionEventKind::PermissionResolved {
                    tool_call_id,
                    option_id,
                    denied,
                })
                .await;
            }

            AgentEvent::TurnComplete {
                content,
                tokens_used: _,
            } => {
                let content = if content.is_empty() {
                    self.assembler.blocks()
                } else {
                    content
                };
                self.assembler = TurnAssembler::default();

                let message = Message::new(
                    self.session_id,
                    MessageRole::Assistant,
                    MessageContent::Blocks(content),
                );
                if let Err(err) = self.store.save_message(&message).await {
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %err,
                        "failed to persist assistant message"
                    );
                }

                self.phase = Phase::Idle;
                self.bump_idle_deadline();
                self.emit_and_log(SessionEventKind::PromptComplete { message })
                    .await;
            }

            AgentEvent::Error {
                message,
                recoverable,
            } => {
                self.emit_and_log(SessionEventKind::Error {
                    message: message.clone(),
                    recoverable,
                })
                .await;
                if recoverable {
                    if self.phase != Phase::Ended {
                        self.phase = Phase::Idle;
                        self.bump_idle_deadline();
                    }
                } else {
                    tracing::error!(
                        session_id = %self.session_id,
                        error = %message,
                        "backend reported fatal error"
                    );
                    self.finish("backend error").await;
                }
            }

            AgentEvent::Exit { reason } => {
                self.finish(&reason).await;
            }
        }
    }

    async fn on_idle_timeout(&mut self) {
        tracing::info!(
            session_id = %self.session_id,
            timeout_secs = self.idle_timeout.as_secs(),
            "session idle timeout"
        );
        self.emit_and_log(SessionEventKind::Idle).await;
        self.dispose_backend().await;
        self.finish("idle timeout").await;
    }

    async fn dispose_backend(&mut self) {
        // A backend that ignores dispose past the deadline is abandoned;
        // the runtime still proceeds to Ended.
        match tokio::time::timeout(self.shutdown_deadline, self.backend.dispose()).await {
            Ok(Err(err)) => {
                tracing::warn!(session_id = %self.session_id, error = %err, "backend dispose failed");
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    deadline_ms = self.shutdown_deadline.as_millis() as u64,
                    "backend dispose exceeded deadline; abandoning"
                );
            }
            Ok(Ok(())) => {}
        }
    }

    /// Transition to `Ended`: one exit event, persist, release subscribers.
    async fn finish(&mut self, reason: &str) {
        if self.phase == Phase::Ended {
            return;
        }
        self.phase = Phase::Ended;
        self.pending_permissions.clear();

        self.emit_and_log(SessionEventKind::Exit {
            reason: reason.to_owned(),
        })
        .await;

        if let Err(err) = self.store.end_session(self.session_id, reason).await {
            tracing::warn!(
                session_id = %self.session_id,
                error = %err,
                "failed to mark session ended"
            );
        }

        // Closing the channels is the subscribers' end-of-stream signal.
        self.subscribers.clear();

        for waiter in self.exit_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    async fn touch(&self) {
        if let Err(err) = self.store.touch_session(self.session_id).await {
            tracing::debug!(session_id = %self.session_id, error = %err, "touch failed");
        }
    }

    async fn emit_and_log(&mut self, kind: SessionEventKind) {
        if kind.is_persisted() {
            if let Err(err) = self.store.log_event(self.session_id, &kind).await {
                tracing::warn!(
                    session_id = %self.session_id,
                    event_type = kind.name(),
                    error = %err,
                    "failed to persist session event"
                );
            }
        }
        self.emit(kind);
    }

    /// Deliver an event to every subscriber in order. A subscriber whose
    /// buffer is full is dropped and the survivors are told.
    fn emit(&mut self, kind: SessionEventKind) {
        let mut queue = VecDeque::from([kind]);
        while let Some(kind) = queue.pop_front() {
            self.seq += 1;
            let event = SessionEvent::new(self.seq, self.session_id, kind);

            let mut slow = Vec::new();
            self.subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slow.push(*id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });

            for subscriber_id in slow {
                tracing::warn!(
                    session_id = %self.session_id,
                    subscriber_id = %subscriber_id,
                    "dropping slow subscriber"
                );
                queue.push_back(SessionEventKind::SubscriberDropped { subscriber_id });
            }
        }
    }
}

fn reply_err(command: Command, error: RuntimeError) {
    match command {
        Command::Prompt { reply, .. }
        | Command::Steer { reply, .. }
        | Command::FollowUp { reply, .. }
        | Command::CancelPrompt { reply }
        | Command::Interrupt { reply }
        | Command::RespondToPermission { reply, .. }
        | Command::CancelPermission { reply, .. }
        | Command::Setter { reply, .. }
        | Command::Compact { reply, .. }
        | Command::Tree { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Command::TreeQuery { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Command::Subscribe { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Command::Status { reply } => {
            let _ = reply.send(Err(error));
        }
        Command::Terminate { reply } => {
            // Terminating an ended session is success, not failure.
            let _ = reply.send(Ok(()));
        }
        Command::Unsubscribe { .. } => {}
    }
}

/// Folds streaming deltas into the content of the final assistant message
/// when the backend does not hand one over itself.
#[derive(Debug, Default)]
struct TurnAssembler {
    text: String,
    thinking: String,
}

impl TurnAssembler {
    fn push_text(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    fn push_thinking(&mut self, delta: &str) {
        self.thinking.push_str(delta);
    }

    fn blocks(&self) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();
        if !self.thinking.is_empty() {
            blocks.push(ContentBlock::Thinking {
                thinking: self.thinking.clone(),
            });
        }
        if !self.text.is_empty() {
            blocks.push(ContentBlock::Text {
                text: self.text.clone(),
            });
        }
        blocks
    }
}
