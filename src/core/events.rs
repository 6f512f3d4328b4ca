use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typeshare::typeshare;
use uuid::Uuid;

use super::session::{Message, PermissionOption};

/// One event on a session's outbound stream.
///
/// `seq` is assigned by the runtime and is strictly increasing per session;
/// every subscriber observes a prefix of the same sequence.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    /// Monotonic per-session sequence number
    pub seq: u64,

    /// Session this event belongs to
    #[typeshare(serialized_as = "String")]
    pub session_id: Uuid,

    /// What happened
    #[serde(flatten)]
    pub kind: SessionEventKind,

    /// When the runtime emitted the event
    #[typeshare(serialized_as = "String")]
    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    /// Stamp a new event now.
    #[must_use]
    pub fn new(seq: u64, session_id: Uuid, kind: SessionEventKind) -> Self {
        Self {
            seq,
            session_id,
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Session event taxonomy, shared by live fan-out, the wire, and the audit
/// log. Streaming deltas are live-only; terminal events are also persisted.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SessionEventKind {
    /// Status snapshot (emitted on entering idle and on subscribe)
    Status(StatusSnapshot),

    /// A chunk of assistant text
    MessageChunk {
        /// Text delta
        delta: String,
    },

    /// A chunk of model thinking
    ThinkingChunk {
        /// Thinking delta
        delta: String,
    },

    /// The agent started a tool call
    #[serde(rename_all = "camelCase")]
    ToolCallStarted {
        /// Tool call id
        tool_call_id: String,
        /// Tool name
        name: String,
        /// Tool input
        input: Value,
    },

    /// A tool call finished
    #[serde(rename_all = "camelCase")]
    ToolCallCompleted {
        /// Tool call id
        tool_call_id: String,
        /// Result payload
        content: Value,
    },

    /// The agent is waiting for a permission answer
    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        /// Tool call awaiting approval
        tool_call_id: String,
        /// Human-readable description
        description: String,
        /// Options the agent presented
        options: Vec<PermissionOption>,
    },

    /// A permission request was answered or cancelled
    #[serde(rename_all = "camelCase")]
    PermissionResolved {
        /// Tool call id
        tool_call_id: String,
        /// Chosen option, if any
        option_id: Option<String>,
        /// Whether the tool call was denied
        denied: bool,
    },

    /// A turn finished; carries the assembled assistant message
    PromptComplete {
        /// The persisted message
        message: Message,
    },

    /// The backend reported an error
    Error {
        /// Error description
        message: String,
        /// Whether the session returns to idle (true) or ends (false)
        recoverable: bool,
    },

    /// The idle timer fired; the session is ending
    Idle,

    /// Terminal event: the session ended
    Exit {
        /// Why
        reason: String,
    },

    /// A slow subscriber was disconnected from the stream
    #[serde(rename_all = "camelCase")]
    SubscriberDropped {
        /// Identifier of the dropped subscriber
        #[typeshare(serialized_as = "String")]
        subscriber_id: Uuid,
    },
}

impl SessionEventKind {
    /// Stable name used for the audit log's `event_type` column.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::MessageChunk { .. } => "message_chunk",
            Self::ThinkingChunk { .. } => "thinking_chunk",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallCompleted { .. } => "tool_call_completed",
            Self::PermissionRequest { .. } => "permission_request",
            Self::PermissionResolved { .. } => "permission_resolved",
            Self::PromptComplete { .. } => "prompt_complete",
            Self::Error { .. } => "error",
            Self::Idle => "idle",
            Self::Exit { .. } => "exit",
            Self::SubscriberDropped { .. } => "subscriber_dropped",
        }
    }

    /// Whether this event is persisted to the audit log. Streaming deltas
    /// are not; only terminal and lifecycle events are worth the write.
    #[must_use]
    pub const fn is_persisted(&self) -> bool {
        matches!(
            self,
            Self::PromptComplete { .. }
                | Self::Error { .. }
                | Self::Idle
                | Self::Exit { .. }
                | Self::PermissionRequest { .. }
                | Self::PermissionResolved { .. }
        )
    }
}

/// Point-in-time view of a session's runtime state
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Whether a turn is currently streaming
    pub streaming: bool,

    /// Model in use, when the backend reports one
    pub model: Option<String>,

    /// Current permission mode
    pub permission_mode: Option<String>,

    /// Current thinking level
    pub thinking_level: Option<String>,

    /// Tokens consumed so far
    pub tokens_used: u64,

    /// Whether the backend reported a durable session id
    pub resumable: bool,

    /// The durable backend session id, when assigned
    pub backend_session_id: Option<String>,
}

/// A persisted audit-log row (see `session_events` table). The live stream
/// uses [`SessionEvent`]; this is what `listEvents` returns.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    /// Monotonic per-session sequence number assigned by the store
    pub seq: u64,

    /// Session this event belongs to
    #[typeshare(serialized_as = "String")]
    pub session_id: Uuid,

    /// Event type name
    pub event_type: String,

    /// Opaque JSON payload
    pub payload: Value,

    /// When the event was recorded
    #[typeshare(serialized_as = "String")]
    pub timestamp: DateTime<Utc>,
}
