use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use typeshare::typeshare;
use uuid::Uuid;

/// Maximum images attached to a single user message.
pub const MAX_IMAGES_PER_MESSAGE: usize = 5;

/// Maximum decoded size of a single image attachment.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Represents a single gateway session bound to one agent backend
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique identifier
    #[typeshare(serialized_as = "String")]
    pub id: Uuid,

    /// Agent backend driving this session
    pub agent: AgentKind,

    /// Lifecycle status; advances `active -> idle -> ended`, never backwards
    pub status: SessionStatus,

    /// How the session authenticates against its provider
    pub auth: SessionAuth,

    /// Workspace the session is bound to, when filesystem isolation was requested
    #[typeshare(serialized_as = "String")]
    pub workspace_id: Option<Uuid>,

    /// User-supplied environment overrides (filtered, see `agents::env`)
    pub env: HashMap<String, String>,

    /// Identifier the backend assigned on its first round-trip; enables resumption
    pub backend_session_id: Option<String>,

    /// Path of the session's isolated worktree, when one was created
    #[typeshare(serialized_as = "String")]
    pub worktree_path: Option<PathBuf>,

    /// When the session was created
    #[typeshare(serialized_as = "String")]
    pub created_at: DateTime<Utc>,

    /// Timestamp of the last inbound command or outbound event
    #[typeshare(serialized_as = "String")]
    pub last_activity_at: DateTime<Utc>,

    /// When the session ended, if it has
    #[typeshare(serialized_as = "String")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Why the session ended ("client request", "idle timeout", "server restart", ...)
    pub ended_reason: Option<String>,
}

/// Parameters for creating a new session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Agent backend to bind
    pub agent: AgentKind,
    /// Authentication record, validated before anything is persisted
    pub auth: SessionAuth,
    /// Optional workspace for filesystem isolation
    pub workspace_id: Option<Uuid>,
    /// User-supplied environment overrides
    pub env: HashMap<String, String>,
}

impl Session {
    /// Create a new session in `Active` status
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent: config.agent,
            status: SessionStatus::Active,
            auth: config.auth,
            workspace_id: config.workspace_id,
            env: config.env,
            backend_session_id: None,
            worktree_path: None,
            created_at: now,
            last_activity_at: now,
            ended_at: None,
            ended_reason: None,
        }
    }

    /// Advance the status. Backwards transitions are ignored: status is
    /// monotonic and a session is never resurrected.
    pub fn advance_status(&mut self, status: SessionStatus) {
        if status >= self.status {
            self.status = status;
        }
    }

    /// Mark the session ended with a reason.
    pub fn end(&mut self, reason: impl Into<String>) {
        self.advance_status(SessionStatus::Ended);
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
            self.ended_reason = Some(reason.into());
        }
    }

    /// Record activity.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Whether this session can be resumed after a gateway restart: the
    /// backend reported a durable id and the user never explicitly ended it.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.backend_session_id.is_some()
            && (self.ended_at.is_none()
                || matches!(
                    self.ended_reason.as_deref(),
                    Some("server restart" | "idle timeout")
                ))
    }
}

/// Session lifecycle status
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is live and able to take prompts
    Active,

    /// Session is live but has not seen activity recently
    Idle,

    /// Session has terminated; terminal state
    Ended,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "ended" => Ok(Self::Ended),
            _ => anyhow::bail!("unknown session status: {s}"),
        }
    }
}

/// Agent backend kind
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Claude-family SDK
    ClaudeSdk,

    /// Pi-family SDK
    PiSdk,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClaudeSdk => write!(f, "claude_sdk"),
            Self::PiSdk => write!(f, "pi_sdk"),
        }
    }
}

impl std::str::FromStr for AgentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude_sdk" => Ok(Self::ClaudeSdk),
            "pi_sdk" => Ok(Self::PiSdk),
            _ => anyhow::bail!("unknown agent kind: {s}"),
        }
    }
}

/// How a session authenticates against its model provider
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAuth {
    /// Authentication mode
    pub mode: AuthMode,

    /// Provider the key belongs to
    pub provider_key: ProviderKey,

    /// Where the API key comes from
    #[serde(default)]
    pub api_key_ref: ApiKeyRef,

    /// Cleartext API key; only legal with `api_key_ref = inline`, never persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Vault credential id; only legal with `api_key_ref = stored`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_credential_id: Option<String>,
}

impl SessionAuth {
    /// Copy of this record with the cleartext key removed, safe to persist.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            api_key: None,
            ..self.clone()
        }
    }
}

/// Authentication mode
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Provider API key, inline or from the vault
    ApiKey,

    /// OAuth completed out-of-band
    Oauth,
}

/// Source of an API key
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyRef {
    /// Key supplied in the creation request
    Inline,

    /// Key resolved from the credential vault
    Stored,

    /// No key (oauth)
    #[default]
    None,
}

/// Model provider
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKey {
    /// Anthropic
    Anthropic,
    /// OpenAI
    Openai,
    /// Google
    Google,
    /// Groq
    Groq,
    /// OpenRouter
    Openrouter,
}

impl ProviderKey {
    /// Environment variable the provider's key travels in.
    #[must_use]
    pub const fn env_var(self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Openai => "OPENAI_API_KEY",
            Self::Google => "GOOGLE_API_KEY",
            Self::Groq => "GROQ_API_KEY",
            Self::Openrouter => "OPENROUTER_API_KEY",
        }
    }
}

impl std::fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::Openai => write!(f, "openai"),
            Self::Google => write!(f, "google"),
            Self::Groq => write!(f, "groq"),
            Self::Openrouter => write!(f, "openrouter"),
        }
    }
}

impl std::str::FromStr for ProviderKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::Openai),
            "google" => Ok(Self::Google),
            "groq" => Ok(Self::Groq),
            "openrouter" => Ok(Self::Openrouter),
            _ => anyhow::bail!("unknown provider: {s}"),
        }
    }
}

/// A persisted conversation message
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier
    #[typeshare(serialized_as = "String")]
    pub id: Uuid,

    /// Session this message belongs to
    #[typeshare(serialized_as = "String")]
    pub session_id: Uuid,

    /// Who produced the message
    pub role: MessageRole,

    /// Plain text or an ordered list of typed blocks
    pub content: MessageContent,

    /// When the message was recorded
    #[typeshare(serialized_as = "String")]
    pub timestamp: DateTime<Utc>,

    /// Optional backend-specific metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    /// Create a message stamped now.
    #[must_use]
    pub fn new(session_id: Uuid, role: MessageRole, content: MessageContent) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            role,
            content,
            timestamp: Utc::now(),
            metadata: None,
        }
    }
}

/// Message author role
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Client-supplied turn
    User,
    /// Agent output
    Assistant,
    /// Gateway- or backend-injected content
    System,
}

/// Message content: a bare string or a list of typed blocks
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text
    Text(String),
    /// Ordered typed blocks
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated text of all textual blocks (for logging and tests).
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// A typed content block inside a message
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text
    Text {
        /// The text
        text: String,
    },

    /// Model thinking output
    Thinking {
        /// The thinking text
        thinking: String,
    },

    /// A tool invocation the agent made
    ToolUse {
        /// Tool call id
        id: String,
        /// Tool name
        name: String,
        /// Tool input
        input: Value,
    },

    /// The result of a tool invocation
    ToolResult {
        /// Id of the tool call this answers
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        /// Result payload
        content: Value,
    },

    /// An inline image attachment (base64)
    Image {
        /// Mime type (jpeg, png, gif, webp)
        #[serde(rename = "mimeType")]
        mime_type: String,
        /// Base64-encoded bytes
        data: String,
        /// Optional original filename
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
}

/// Allowed image mime types for attachments.
pub const ALLOWED_IMAGE_MIME_TYPES: &[&str] =
    &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// An image attached to a user message
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAttachment {
    /// Mime type
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Base64-encoded bytes
    pub data: String,
    /// Optional original filename
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl ImageAttachment {
    /// Validate mime type and decoded size limits.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the attachment is not acceptable.
    pub fn validate(&self) -> Result<(), String> {
        if !ALLOWED_IMAGE_MIME_TYPES.contains(&self.mime_type.as_str()) {
            return Err(format!("unsupported image mime type: {}", self.mime_type));
        }
        // Base64 expands by 4/3; bound the decoded size without decoding.
        let decoded_upper_bound = self.data.len() / 4 * 3;
        if decoded_upper_bound > MAX_IMAGE_BYTES {
            return Err(format!("image exceeds {MAX_IMAGE_BYTES} byte limit"));
        }
        Ok(())
    }
}

/// A permission request awaiting a client answer, keyed by
/// `(session_id, tool_call_id)`. Created when the agent asks, removed when
/// the client answers or the agent cancels.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermission {
    /// Session the request belongs to
    #[typeshare(serialized_as = "String")]
    pub session_id: Uuid,

    /// Tool call awaiting approval
    pub tool_call_id: String,

    /// Human-readable description of the tool call
    pub description: String,

    /// Options the agent presented
    pub options: Vec<PermissionOption>,

    /// When the agent asked
    #[typeshare(serialized_as = "String")]
    pub requested_at: DateTime<Utc>,
}

/// One selectable answer to a permission request
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionOption {
    /// Opaque option id (e.g. "allow_once", "deny")
    #[serde(rename = "optionId")]
    pub option_id: String,

    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth_session(agent: AgentKind, provider: ProviderKey) -> Session {
        Session::new(SessionConfig {
            agent,
            auth: SessionAuth {
                mode: AuthMode::Oauth,
                provider_key: provider,
                api_key_ref: ApiKeyRef::None,
                api_key: None,
                stored_credential_id: None,
            },
            workspace_id: None,
            env: HashMap::new(),
        })
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut session = oauth_session(AgentKind::ClaudeSdk, ProviderKey::Anthropic);
        assert_eq!(session.status, SessionStatus::Active);

        session.advance_status(SessionStatus::Idle);
        assert_eq!(session.status, SessionStatus::Idle);

        // No resurrection.
        session.advance_status(SessionStatus::Active);
        assert_eq!(session.status, SessionStatus::Idle);

        session.end("client request");
        assert_eq!(session.status, SessionStatus::Ended);
        assert!(session.ended_at.is_some());
        session.advance_status(SessionStatus::Active);
        assert_eq!(session.status, SessionStatus::Ended);
    }

    #[test]
    fn test_resumable_requires_backend_session_id() {
        let mut session = oauth_session(AgentKind::PiSdk, ProviderKey::Openai);
        assert!(!session.is_resumable());

        session.backend_session_id = Some("bk-1".to_owned());
        assert!(session.is_resumable());

        session.end("server restart");
        assert!(session.is_resumable());

        let mut terminated = session.clone();
        terminated.ended_reason = Some("client request".to_owned());
        assert!(!terminated.is_resumable());
    }

    #[test]
    fn test_redacted_auth_drops_cleartext() {
        let auth = SessionAuth {
            mode: AuthMode::ApiKey,
            provider_key: ProviderKey::Anthropic,
            api_key_ref: ApiKeyRef::Inline,
            api_key: Some("sk-abc".to_owned()),
            stored_credential_id: None,
        };
        let redacted = auth.redacted();
        assert!(redacted.api_key.is_none());
        assert_eq!(redacted.provider_key, ProviderKey::Anthropic);
    }

    #[test]
    fn test_message_content_serde_shapes() {
        let text: MessageContent = serde_json::from_str("\"hi\"").unwrap();
        assert_eq!(text.text(), "hi");

        let blocks: MessageContent = serde_json::from_str(
            r#"[{"type":"text","text":"a"},{"type":"thinking","thinking":"b"}]"#,
        )
        .unwrap();
        assert_eq!(blocks.text(), "a");
    }

    #[test]
    fn test_image_attachment_validation() {
        let ok = ImageAttachment {
            mime_type: "image/png".to_owned(),
            data: "aGVsbG8=".to_owned(),
            filename: None,
        };
        assert!(ok.validate().is_ok());

        let bad_mime = ImageAttachment {
            mime_type: "image/tiff".to_owned(),
            data: String::new(),
            filename: None,
        };
        assert!(bad_mime.validate().is_err());
    }

    #[test]
    fn test_agent_kind_wire_tags() {
        assert_eq!(
            serde_json::to_string(&AgentKind::ClaudeSdk).unwrap(),
            "\"claude_sdk\""
        );
        assert_eq!(serde_json::to_string(&AgentKind::PiSdk).unwrap(), "\"pi_sdk\"");
    }
}
