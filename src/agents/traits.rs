use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::errors::AuthValidationError;
use crate::core::events::StatusSnapshot;
use crate::core::session::{
    AgentKind, ApiKeyRef, AuthMode, ContentBlock, ImageAttachment, PermissionOption, ProviderKey,
    SessionAuth,
};
use crate::vault::SecretString;

/// Result of probing whether a backend's SDK is usable on this host.
#[derive(Debug, Clone)]
pub struct Readiness {
    /// Whether sessions can be opened.
    pub ready: bool,
    /// Resolved SDK binary path, when ready.
    pub resolved_path: Option<PathBuf>,
    /// Human-readable detail when not ready.
    pub detail: Option<String>,
}

/// Context for auth validation at session creation.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    /// Hosted mode: nobody can complete a browser login.
    pub hosted_mode: bool,
    /// Whether interactive auth flows are permitted.
    pub allow_interactive: bool,
    /// Whether a credential vault is configured.
    pub vault_available: bool,
}

/// Configuration handed to a backend when opening a session.
#[derive(Debug, Clone)]
pub struct BackendSessionConfig {
    /// Gateway session id.
    pub session_id: Uuid,
    /// Auth record (cleartext key already stripped; the resolved key travels
    /// separately).
    pub auth: SessionAuth,
    /// Filtered user environment overrides.
    pub env: HashMap<String, String>,
    /// Working directory for the agent, when the session has a worktree.
    pub worktree_path: Option<PathBuf>,
    /// Backend session id to resume, if any.
    pub resume_backend_session_id: Option<String>,
}

/// Optional per-prompt settings.
#[derive(Debug, Clone, Default)]
pub struct PromptOptions {
    /// Model override for this turn.
    pub model: Option<String>,
}

/// Pi-only tree queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeQuery {
    /// The conversation tree.
    Tree,
    /// Entries that can be forked from.
    Forkable,
    /// Session statistics.
    Stats,
    /// Models the backend can switch between.
    Models,
}

/// Events emitted by a backend session, drained by the runtime's single
/// reader task in arrival order.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The backend finished its handshake.
    Started {
        /// Durable backend session id, when the SDK reports one.
        backend_session_id: Option<String>,
    },

    /// A chunk of assistant text.
    MessageDelta {
        /// Text delta.
        text: String,
    },

    /// A chunk of model thinking.
    ThinkingDelta {
        /// Thinking delta.
        text: String,
    },

    /// The agent started a tool call.
    ToolCallStarted {
        /// Tool call id.
        tool_call_id: String,
        /// Tool name.
        name: String,
        /// Tool input.
        input: Value,
    },

    /// A tool call finished.
    ToolCallCompleted {
        /// Tool call id.
        tool_call_id: String,
        /// Result payload.
        content: Value,
    },

    /// The agent is waiting for a permission answer.
    PermissionRequested {
        /// Tool call awaiting approval.
        tool_call_id: String,
        /// Human-readable description.
        description: String,
        /// Options the agent presented.
        options: Vec<PermissionOption>,
    },

    /// A permission request was answered or withdrawn.
    PermissionResolved {
        /// Tool call id.
        tool_call_id: String,
        /// Chosen option, if any.
        option_id: Option<String>,
        /// Whether the tool call was denied.
        denied: bool,
    },

    /// The current turn finished.
    TurnComplete {
        /// Assembled content of the assistant message.
        content: Vec<ContentBlock>,
        /// Tokens consumed so far.
        tokens_used: u64,
    },

    /// The backend reported an error.
    Error {
        /// Error description.
        message: String,
        /// Whether the session can keep going.
        recoverable: bool,
    },

    /// Terminal: the backend is gone. Always the last event.
    Exit {
        /// Why.
        reason: String,
    },
}

/// A live backend session: the narrow, async-but-ordered interaction
/// surface of §"BackendSession" in the product doc.
///
/// Advisory setters are never fatal: a backend that does not support one
/// returns `Ok(())` without effect. Tree operations are Pi-only and error on
/// Claude.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Enqueue one user turn.
    async fn prompt(
        &self,
        text: &str,
        images: &[ImageAttachment],
        options: PromptOptions,
    ) -> anyhow::Result<()>;

    /// Interrupt the current generation and supply redirecting content.
    /// Valid only while streaming.
    async fn steer(&self, text: &str) -> anyhow::Result<()>;

    /// Enqueue a post-turn message. Valid only while streaming.
    async fn follow_up(&self, text: &str) -> anyhow::Result<()>;

    /// Abort the current turn.
    async fn cancel(&self) -> anyhow::Result<()>;

    /// Hard-interrupt the current turn.
    async fn interrupt(&self) -> anyhow::Result<()>;

    /// Advisory: switch model.
    async fn set_model(&self, model: &str) -> anyhow::Result<()>;

    /// Advisory: switch permission mode.
    async fn set_permission_mode(&self, mode: &str) -> anyhow::Result<()>;

    /// Advisory: cap thinking tokens.
    async fn set_max_thinking_tokens(&self, tokens: u32) -> anyhow::Result<()>;

    /// Advisory: set thinking level.
    async fn set_thinking_level(&self, level: &str) -> anyhow::Result<()>;

    /// Advisory: cycle to the next model.
    async fn cycle_model(&self) -> anyhow::Result<()>;

    /// Advisory: cycle the thinking level.
    async fn cycle_thinking_level(&self) -> anyhow::Result<()>;

    /// Summarize and trim backend history.
    async fn compact(&self, instructions: Option<&str>) -> anyhow::Result<()>;

    /// Fork from an entry (Pi only).
    async fn fork(&self, entry_id: &str) -> anyhow::Result<()>;

    /// Navigate to an entry (Pi only).
    async fn navigate(&self, entry_id: &str) -> anyhow::Result<()>;

    /// Start a fresh backend conversation (Pi only).
    async fn new_session(&self) -> anyhow::Result<()>;

    /// Read tree state (Pi only).
    async fn tree_query(&self, query: TreeQuery) -> anyhow::Result<Value>;

    /// Answer a pending permission request.
    async fn respond_to_permission(
        &self,
        tool_call_id: &str,
        option_id: Option<&str>,
        answers: Option<Value>,
    ) -> anyhow::Result<()>;

    /// Withdraw a pending permission request.
    async fn cancel_permission(&self, tool_call_id: &str) -> anyhow::Result<()>;

    /// Take the event stream. The only way to consume events; the receiver
    /// is handed out exactly once (the runtime's reader task) and dropping
    /// it unsubscribes. Events arrive in backend order with no concurrent
    /// delivery.
    async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<AgentEvent>>;

    /// Point-in-time status snapshot.
    async fn status(&self) -> StatusSnapshot;

    /// Release OS resources. The final `Exit` event is emitted before this
    /// returns.
    async fn dispose(&self) -> anyhow::Result<()>;
}

/// A backend implementation: validates auth, probes readiness, and opens
/// sessions.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Short human name ("claude-sdk", "pi-sdk").
    fn name(&self) -> &'static str;

    /// Which agent kind this backend serves.
    fn kind(&self) -> AgentKind;

    /// Providers this backend accepts keys for.
    fn allowed_providers(&self) -> &'static [ProviderKey];

    /// Probe whether the SDK is usable on this host.
    async fn ensure_installed(&self) -> Readiness;

    /// Validate an auth record at creation time; violations are rejected
    /// here, never at first use. Returns non-fatal warnings (e.g. hosted
    /// mode with oauth).
    ///
    /// # Errors
    ///
    /// Returns the specific violated rule.
    fn validate_auth(
        &self,
        auth: &SessionAuth,
        ctx: &AuthContext,
    ) -> Result<Vec<String>, AuthValidationError> {
        validate_auth_rules(auth, ctx, self.allowed_providers(), self.kind())
    }

    /// Open a backend session. `resolved_key` is present exactly when
    /// `auth.mode == api_key`.
    async fn open(
        &self,
        config: BackendSessionConfig,
        resolved_key: Option<SecretString>,
    ) -> anyhow::Result<Box<dyn BackendSession>>;
}

/// Shared auth-validation rules; backends differ only in their allowed
/// provider set.
pub fn validate_auth_rules(
    auth: &SessionAuth,
    ctx: &AuthContext,
    allowed: &[ProviderKey],
    agent: AgentKind,
) -> Result<Vec<String>, AuthValidationError> {
    if !allowed.contains(&auth.provider_key) {
        return Err(AuthValidationError::ProviderNotAllowed {
            provider: auth.provider_key.to_string(),
            agent,
        });
    }

    if auth.api_key.is_some() && auth.api_key_ref != ApiKeyRef::Inline {
        return Err(AuthValidationError::UnexpectedKey);
    }

    let mut warnings = Vec::new();
    match auth.mode {
        AuthMode::ApiKey => match auth.api_key_ref {
            ApiKeyRef::Inline => {
                if auth.api_key.as_deref().is_none_or(str::is_empty) {
                    return Err(AuthValidationError::MissingInlineKey);
                }
            }
            ApiKeyRef::Stored => {
                if auth.stored_credential_id.is_none() {
                    return Err(AuthValidationError::MissingCredentialId);
                }
                if !ctx.vault_available {
                    return Err(AuthValidationError::VaultUnavailable);
                }
            }
            ApiKeyRef::None => {
                return Err(AuthValidationError::MissingInlineKey);
            }
        },
        AuthMode::Oauth => {
            if ctx.hosted_mode && !ctx.allow_interactive {
                warnings.push(
                    "hosted mode: interactive login must have been completed out-of-band"
                        .to_owned(),
                );
            }
        }
    }

    Ok(warnings)
}
