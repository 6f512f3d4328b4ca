pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use typeshare::typeshare;
use uuid::Uuid;

use crate::core::events::{SessionEventKind, StoredEvent};
use crate::core::session::{Message, Session, SessionStatus};

pub use sqlite::SqliteStore;

use serde::{Deserialize, Serialize};

/// A repository a session's worktree can be carved out of
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    /// Unique identifier
    #[typeshare(serialized_as = "String")]
    pub id: Uuid,

    /// Path of the repository root
    #[typeshare(serialized_as = "String")]
    pub repo_root: PathBuf,

    /// Human label
    pub name: String,

    /// When the workspace was registered
    #[typeshare(serialized_as = "String")]
    pub created_at: DateTime<Utc>,
}

/// Binding between a workspace and a session's isolated worktree.
/// One per active session that requested isolation; worktrees intentionally
/// outlive sessions so users can inspect changes afterwards.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceAgent {
    /// Workspace the worktree belongs to
    #[typeshare(serialized_as = "String")]
    pub workspace_id: Uuid,

    /// Session the worktree was created for
    #[typeshare(serialized_as = "String")]
    pub session_id: Uuid,

    /// Branch checked out in the worktree
    pub branch: String,

    /// Path of the worktree
    #[typeshare(serialized_as = "String")]
    pub worktree_path: PathBuf,

    /// When the binding was created
    #[typeshare(serialized_as = "String")]
    pub created_at: DateTime<Utc>,
}

/// Durable session, message, event, and workspace persistence.
///
/// Implementations serialize internally (transaction discipline); callers
/// never coordinate access themselves.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a session record.
    async fn save_session(&self, session: &Session) -> anyhow::Result<()>;

    /// Get a session by id.
    async fn get_session(&self, id: Uuid) -> anyhow::Result<Option<Session>>;

    /// Mark a session ended with a reason. No-op on already-ended sessions.
    async fn end_session(&self, id: Uuid, reason: &str) -> anyhow::Result<()>;

    /// Delete a session and (via cascade) its messages, events, and bindings.
    async fn delete_session(&self, id: Uuid) -> anyhow::Result<()>;

    /// List sessions, optionally filtered by status.
    async fn list_sessions(&self, status: Option<SessionStatus>) -> anyhow::Result<Vec<Session>>;

    /// List sessions that are not ended.
    async fn list_active(&self) -> anyhow::Result<Vec<Session>>;

    /// List sessions eligible for resumption (durable backend id, not
    /// explicitly terminated by a client).
    async fn list_resumable(&self) -> anyhow::Result<Vec<Session>>;

    /// Crash recovery: demote every non-ended session to ended. Returns the
    /// number of sessions demoted.
    async fn mark_all_active_ended(&self, reason: &str) -> anyhow::Result<u64>;

    /// Update a session's last-activity timestamp.
    async fn touch_session(&self, id: Uuid) -> anyhow::Result<()>;

    /// Record the backend-assigned durable session id. Write-once: a second
    /// write with a different value is an error.
    async fn set_backend_session_id(&self, id: Uuid, backend_session_id: &str)
    -> anyhow::Result<()>;

    /// Append a message.
    async fn save_message(&self, message: &Message) -> anyhow::Result<()>;

    /// List messages ascending by timestamp.
    async fn list_messages(
        &self,
        session_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> anyhow::Result<Vec<Message>>;

    /// Count messages for a session.
    async fn count_messages(&self, session_id: Uuid) -> anyhow::Result<u64>;

    /// Most recent message for a session, if any (reconnect replay).
    async fn latest_message(&self, session_id: Uuid) -> anyhow::Result<Option<Message>>;

    /// Append an audit event; the store assigns the per-session sequence
    /// number and returns it.
    async fn log_event(&self, session_id: Uuid, kind: &SessionEventKind) -> anyhow::Result<u64>;

    /// List audit events descending (most recent first).
    async fn list_events(&self, session_id: Uuid, limit: u32) -> anyhow::Result<Vec<StoredEvent>>;

    /// Register a workspace.
    async fn save_workspace(&self, workspace: &Workspace) -> anyhow::Result<()>;

    /// Get a workspace by id.
    async fn get_workspace(&self, id: Uuid) -> anyhow::Result<Option<Workspace>>;

    /// List all workspaces.
    async fn list_workspaces(&self) -> anyhow::Result<Vec<Workspace>>;

    /// Delete a workspace.
    async fn delete_workspace(&self, id: Uuid) -> anyhow::Result<()>;

    /// Persist a workspace-agent binding.
    async fn save_workspace_agent(&self, binding: &WorkspaceAgent) -> anyhow::Result<()>;

    /// Get the binding for a session, if any.
    async fn get_workspace_agent(&self, session_id: Uuid)
    -> anyhow::Result<Option<WorkspaceAgent>>;

    /// List bindings for a workspace.
    async fn list_workspace_agents(
        &self,
        workspace_id: Uuid,
    ) -> anyhow::Result<Vec<WorkspaceAgent>>;

    /// Remove the binding for a session (creation rollback).
    async fn delete_workspace_agent(&self, session_id: Uuid) -> anyhow::Result<()>;
}
