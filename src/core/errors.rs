//! Error taxonomy. Each boundary translates causes into its own enum; raw
//! errors never cross subsystem boundaries.

use thiserror::Error;
use uuid::Uuid;

use super::session::AgentKind;

/// Errors surfaced by the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session not found.
    #[error("session {session_id} not found")]
    NotFound {
        /// The session id that was not found.
        session_id: Uuid,
    },

    /// The gateway is at its concurrent-session cap.
    #[error("session limit reached ({limit} concurrent sessions)")]
    LimitReached {
        /// The configured cap.
        limit: usize,
    },

    /// The creation request failed validation.
    #[error("invalid session request: {reason}")]
    Validation {
        /// Why the request was rejected.
        reason: String,
    },

    /// A stored credential could not be resolved.
    #[error("credential resolution failed: {reason}")]
    CredentialResolution {
        /// Why resolution failed.
        reason: String,
    },

    /// The requested workspace does not exist.
    #[error("workspace {workspace_id} not found")]
    WorkspaceNotFound {
        /// The missing workspace.
        workspace_id: Uuid,
    },

    /// Worktree provisioning failed.
    #[error("worktree provisioning failed for session {session_id}: {source}")]
    WorktreeFailed {
        /// The session being created.
        session_id: Uuid,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// The backend failed to open a session.
    #[error("backend {agent} failed to open session {session_id}: {source}")]
    BackendOpenFailed {
        /// The session being created.
        session_id: Uuid,
        /// The backend that failed.
        agent: AgentKind,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// The session cannot be resumed.
    #[error("session {session_id} is not resumable: {reason}")]
    NotResumable {
        /// The session id.
        session_id: Uuid,
        /// Why it cannot be resumed.
        reason: String,
    },

    /// Store operation failed.
    #[error("store operation failed: {source}")]
    Store {
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },
}

/// Errors surfaced by a session runtime for an individual operation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The operation is illegal in the current state. Distinguishable, never
    /// silently queued.
    #[error("operation '{operation}' is not valid in state {state}")]
    InvalidState {
        /// The attempted operation.
        operation: &'static str,
        /// The state the runtime was in.
        state: &'static str,
    },

    /// A prompt is already streaming.
    #[error("a prompt is already in flight")]
    PromptInFlight,

    /// The operation is not supported by this backend.
    #[error("operation '{operation}' is not supported by {agent}")]
    Unsupported {
        /// The attempted operation.
        operation: &'static str,
        /// The backend kind.
        agent: AgentKind,
    },

    /// No pending permission with that tool call id.
    #[error("no pending permission for tool call '{tool_call_id}'")]
    UnknownPermission {
        /// The unknown tool call id.
        tool_call_id: String,
    },

    /// The runtime has ended and accepts no more input.
    #[error("session has ended")]
    Ended,

    /// The operation did not complete within the RPC deadline.
    #[error("operation '{operation}' timed out")]
    Timeout {
        /// The attempted operation.
        operation: &'static str,
    },

    /// The backend reported a failure.
    #[error("backend error: {source}")]
    Backend {
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },
}

impl RuntimeError {
    /// JSON-RPC-flavoured error code used on the frame channel.
    #[must_use]
    pub const fn code(&self) -> i64 {
        match self {
            Self::InvalidState { .. } | Self::PromptInFlight => -32002,
            Self::Unsupported { .. } => -32003,
            Self::UnknownPermission { .. } => -32004,
            Self::Ended => -32005,
            Self::Timeout { .. } => -32006,
            Self::Backend { .. } => -32001,
        }
    }
}

/// Errors surfaced by the credential vault.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The vault is not configured (no master key).
    #[error("credential vault is not configured")]
    NotConfigured,

    /// The master key does not match the vault file.
    #[error("vault master key mismatch: cannot decrypt vault sentinel")]
    MasterKeyMismatch,

    /// A record failed to decode or decrypt. Never silently skipped.
    #[error("corrupt vault record at offset {offset}: {reason}")]
    CorruptRecord {
        /// Byte offset of the offending record.
        offset: u64,
        /// What went wrong.
        reason: String,
    },

    /// No credential with that id.
    #[error("credential {id} not found")]
    NotFound {
        /// The missing id.
        id: String,
    },

    /// The id was used before (tombstoned ids are never reused).
    #[error("credential id {id} already exists")]
    DuplicateId {
        /// The colliding id.
        id: String,
    },

    /// Filesystem failure.
    #[error("vault io error: {source}")]
    Io {
        /// The underlying error.
        #[from]
        source: std::io::Error,
    },
}

/// Rejection of a session auth record at creation time.
#[derive(Debug, Error)]
pub enum AuthValidationError {
    /// Inline mode without a key.
    #[error("api_key mode with inline ref requires a non-empty apiKey")]
    MissingInlineKey,

    /// Stored mode without a credential id.
    #[error("api_key mode with stored ref requires storedCredentialId")]
    MissingCredentialId,

    /// Stored mode without a configured vault.
    #[error("stored credentials require a configured vault")]
    VaultUnavailable,

    /// A key was supplied where none is legal.
    #[error("apiKey is only legal with apiKeyRef=inline")]
    UnexpectedKey,

    /// The provider is not in the backend's allowed set.
    #[error("provider '{provider}' is not supported by {agent}")]
    ProviderNotAllowed {
        /// The rejected provider.
        provider: String,
        /// The backend kind.
        agent: AgentKind,
    },
}
