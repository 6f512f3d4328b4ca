use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

use super::{Store, Workspace, WorkspaceAgent};
use crate::core::events::{SessionEventKind, StoredEvent};
use crate::core::session::{
    ApiKeyRef, AuthMode, Message, Session, SessionAuth, SessionStatus,
};

/// SQLite-backed session store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database at the given path and run migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or a migration
    /// fails. A failed migration aborts startup; it never half-applies.
    pub async fn new(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{display}",
            display = db_path.display()
        ))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Run migrations strictly in ascending version order, each inside a
    /// single transaction.
    async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(pool)
                .await?
                .flatten();
        let current_version = current_version.unwrap_or(0);

        if current_version < 1 {
            Self::migrate_to_v1(pool).await?;
        }

        if current_version < 2 {
            Self::migrate_to_v2(pool).await?;
        }

        if current_version < 3 {
            Self::migrate_to_v3(pool).await?;
        }

        Ok(())
    }

    /// Migration v1: sessions, messages, and event log.
    async fn migrate_to_v1(pool: &SqlitePool) -> anyhow::Result<()> {
        tracing::info!("Applying migration v1: core schema");
        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                agent TEXT NOT NULL,
                status TEXT NOT NULL,
                auth_mode TEXT NOT NULL,
                provider_key TEXT NOT NULL,
                api_key_ref TEXT NOT NULL,
                stored_credential_id TEXT,
                workspace_id TEXT,
                env TEXT NOT NULL DEFAULT '{}',
                backend_session_id TEXT,
                worktree_path TEXT,
                created_at TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                ended_at TEXT,
                ended_reason TEXT
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT,
                timestamp TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS session_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE,
                UNIQUE (session_id, seq)
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(1)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!("Migration v1 complete");
        Ok(())
    }

    /// Migration v2: workspaces and workspace-agent bindings.
    async fn migrate_to_v2(pool: &SqlitePool) -> anyhow::Result<()> {
        tracing::info!("Applying migration v2: workspaces");
        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                repo_root TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS workspace_agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id TEXT NOT NULL,
                session_id TEXT NOT NULL UNIQUE,
                branch TEXT NOT NULL,
                worktree_path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (workspace_id) REFERENCES workspaces(id) ON DELETE CASCADE,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(2)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!("Migration v2 complete");
        Ok(())
    }

    /// Migration v3: query indexes.
    async fn migrate_to_v3(pool: &SqlitePool) -> anyhow::Result<()> {
        tracing::info!("Applying migration v3: indexes");
        let mut tx = pool.begin().await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session_ts ON messages(session_id, timestamp)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_session_events_session ON session_events(session_id, seq)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)")
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(3)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!("Migration v3 complete");
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    async fn save_session(&self, session: &Session) -> anyhow::Result<()> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO sessions (
                id, agent, status, auth_mode, provider_key, api_key_ref,
                stored_credential_id, workspace_id, env, backend_session_id,
                worktree_path, created_at, last_activity_at, ended_at, ended_reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(session.id.to_string())
        .bind(session.agent.to_string())
        .bind(session.status.to_string())
        .bind(auth_mode_str(session.auth.mode))
        .bind(session.auth.provider_key.to_string())
        .bind(api_key_ref_str(session.auth.api_key_ref))
        .bind(&session.auth.stored_credential_id)
        .bind(session.workspace_id.map(|id| id.to_string()))
        .bind(serde_json::to_string(&session.env)?)
        .bind(&session.backend_session_id)
        .bind(
            session
                .worktree_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        )
        .bind(session.created_at.to_rfc3339())
        .bind(session.last_activity_at.to_rfc3339())
        .bind(session.ended_at.map(|t| t.to_rfc3339()))
        .bind(&session.ended_reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn get_session(&self, id: Uuid) -> anyhow::Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    #[instrument(skip(self), fields(session_id = %id, reason))]
    async fn end_session(&self, id: Uuid, reason: &str) -> anyhow::Result<()> {
        sqlx::query(
            r"
            UPDATE sessions
            SET status = 'ended', ended_at = ?, ended_reason = ?
            WHERE id = ? AND status != 'ended'
            ",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(reason)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn delete_session(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_sessions(&self, status: Option<SessionStatus>) -> anyhow::Result<Vec<Session>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, SessionRow>(
                    "SELECT * FROM sessions WHERE status = ? ORDER BY created_at ASC",
                )
                .bind(status.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions ORDER BY created_at ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_active(&self) -> anyhow::Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE status != 'ended' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_resumable(&self) -> anyhow::Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r"
            SELECT * FROM sessions
            WHERE backend_session_id IS NOT NULL
              AND (ended_at IS NULL OR ended_reason IN ('server restart', 'idle timeout'))
            ORDER BY created_at ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self))]
    async fn mark_all_active_ended(&self, reason: &str) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE sessions
            SET status = 'ended', ended_at = ?, ended_reason = ?
            WHERE status != 'ended'
            ",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn touch_session(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET last_activity_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn set_backend_session_id(
        &self,
        id: Uuid,
        backend_session_id: &str,
    ) -> anyhow::Result<()> {
        let existing: Option<Option<String>> =
            sqlx::query_scalar("SELECT backend_session_id FROM sessions WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        match existing {
            None => anyhow::bail!("session {id} not found"),
            Some(Some(current)) if current != backend_session_id => {
                // Once assigned the backend id never changes for this session.
                anyhow::bail!(
                    "session {id} already has backend session id '{current}'"
                );
            }
            Some(Some(_)) => Ok(()),
            Some(None) => {
                sqlx::query("UPDATE sessions SET backend_session_id = ? WHERE id = ?")
                    .bind(backend_session_id)
                    .bind(id.to_string())
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
        }
    }

    #[instrument(skip(self, message), fields(session_id = %message.session_id, message_id = %message.id))]
    async fn save_message(&self, message: &Message) -> anyhow::Result<()> {
        sqlx::query(
            r"
            INSERT INTO messages (id, session_id, role, content, metadata, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(message.id.to_string())
        .bind(message.session_id.to_string())
        .bind(serde_json::to_string(&message.role)?)
        .bind(serde_json::to_string(&message.content)?)
        .bind(
            message
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(message.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_messages(
        &self,
        session_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> anyhow::Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r"
            SELECT * FROM messages
            WHERE session_id = ?
            ORDER BY timestamp ASC, id ASC
            LIMIT ? OFFSET ?
            ",
        )
        .bind(session_id.to_string())
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn count_messages(&self, session_id: Uuid) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE session_id = ?")
            .bind(session_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn latest_message(&self, session_id: Uuid) -> anyhow::Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r"
            SELECT * FROM messages
            WHERE session_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            ",
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    #[instrument(skip(self, kind), fields(session_id = %session_id, event_type = kind.name()))]
    async fn log_event(&self, session_id: Uuid, kind: &SessionEventKind) -> anyhow::Result<u64> {
        let payload = serde_json::to_string(kind)?;
        let mut tx = self.pool.begin().await?;

        let seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM session_events WHERE session_id = ?",
        )
        .bind(session_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r"
            INSERT INTO session_events (session_id, seq, event_type, payload, timestamp)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(session_id.to_string())
        .bind(seq)
        .bind(kind.name())
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(u64::try_from(seq).unwrap_or(0))
    }

    async fn list_events(&self, session_id: Uuid, limit: u32) -> anyhow::Result<Vec<StoredEvent>> {
        // Audit consumers want tails: most recent first.
        let rows = sqlx::query_as::<_, EventRow>(
            r"
            SELECT * FROM session_events
            WHERE session_id = ?
            ORDER BY seq DESC
            LIMIT ?
            ",
        )
        .bind(session_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self, workspace), fields(workspace_id = %workspace.id))]
    async fn save_workspace(&self, workspace: &Workspace) -> anyhow::Result<()> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO workspaces (id, repo_root, name, created_at)
            VALUES (?, ?, ?, ?)
            ",
        )
        .bind(workspace.id.to_string())
        .bind(workspace.repo_root.to_string_lossy().to_string())
        .bind(&workspace.name)
        .bind(workspace.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_workspace(&self, id: Uuid) -> anyhow::Result<Option<Workspace>> {
        let row = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_workspaces(&self) -> anyhow::Result<Vec<Workspace>> {
        let rows =
            sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_workspace(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM workspaces WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, binding), fields(session_id = %binding.session_id))]
    async fn save_workspace_agent(&self, binding: &WorkspaceAgent) -> anyhow::Result<()> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO workspace_agents
                (workspace_id, session_id, branch, worktree_path, created_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(binding.workspace_id.to_string())
        .bind(binding.session_id.to_string())
        .bind(&binding.branch)
        .bind(binding.worktree_path.to_string_lossy().to_string())
        .bind(binding.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_workspace_agent(
        &self,
        session_id: Uuid,
    ) -> anyhow::Result<Option<WorkspaceAgent>> {
        let row = sqlx::query_as::<_, WorkspaceAgentRow>(
            "SELECT * FROM workspace_agents WHERE session_id = ?",
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_workspace_agents(
        &self,
        workspace_id: Uuid,
    ) -> anyhow::Result<Vec<WorkspaceAgent>> {
        let rows = sqlx::query_as::<_, WorkspaceAgentRow>(
            "SELECT * FROM workspace_agents WHERE workspace_id = ? ORDER BY created_at ASC",
        )
        .bind(workspace_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_workspace_agent(&self, session_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM workspace_agents WHERE session_id = ?")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

const fn auth_mode_str(mode: AuthMode) -> &'static str {
    match mode {
        AuthMode::ApiKey => "api_key",
        AuthMode::Oauth => "oauth",
    }
}

fn parse_auth_mode(s: &str) -> anyhow::Result<AuthMode> {
    match s {
        "api_key" => Ok(AuthMode::ApiKey),
        "oauth" => Ok(AuthMode::Oauth),
        _ => anyhow::bail!("unknown auth mode: {s}"),
    }
}

const fn api_key_ref_str(key_ref: ApiKeyRef) -> &'static str {
    match key_ref {
        ApiKeyRef::Inline => "inline",
        ApiKeyRef::Stored => "stored",
        ApiKeyRef::None => "none",
    }
}

fn parse_api_key_ref(s: &str) -> anyhow::Result<ApiKeyRef> {
    match s {
        "inline" => Ok(ApiKeyRef::Inline),
        "stored" => Ok(ApiKeyRef::Stored),
        "none" => Ok(ApiKeyRef::None),
        _ => anyhow::bail!("unknown api key ref: {s}"),
    }
}

fn parse_timestamp(name: &str, value: &str) -> anyhow::Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(Into::into)
        .map_err(|e| anyhow::anyhow!("invalid {name} '{value}': {e}"))
}

/// Row type for the sessions table.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    agent: String,
    status: String,
    auth_mode: String,
    provider_key: String,
    api_key_ref: String,
    stored_credential_id: Option<String>,
    workspace_id: Option<String>,
    env: String,
    backend_session_id: Option<String>,
    worktree_path: Option<String>,
    created_at: String,
    last_activity_at: String,
    ended_at: Option<String>,
    ended_reason: Option<String>,
}

impl TryFrom<SessionRow> for Session {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| anyhow::anyhow!("session row: invalid id '{}': {e}", row.id))?;
        let env: HashMap<String, String> = serde_json::from_str(&row.env)
            .map_err(|e| anyhow::anyhow!("session {id}: invalid env json: {e}"))?;
        let workspace_id = row
            .workspace_id
            .map(|w| {
                Uuid::parse_str(&w)
                    .map_err(|e| anyhow::anyhow!("session {id}: invalid workspace id: {e}"))
            })
            .transpose()?;

        Ok(Self {
            id,
            agent: row.agent.parse()?,
            status: row.status.parse()?,
            auth: SessionAuth {
                mode: parse_auth_mode(&row.auth_mode)?,
                provider_key: row.provider_key.parse()?,
                api_key_ref: parse_api_key_ref(&row.api_key_ref)?,
                // Cleartext keys are never persisted.
                api_key: None,
                stored_credential_id: row.stored_credential_id,
            },
            workspace_id,
            env,
            backend_session_id: row.backend_session_id,
            worktree_path: row.worktree_path.map(PathBuf::from),
            created_at: parse_timestamp("created_at", &row.created_at)?,
            last_activity_at: parse_timestamp("last_activity_at", &row.last_activity_at)?,
            ended_at: row
                .ended_at
                .map(|t| parse_timestamp("ended_at", &t))
                .transpose()?,
            ended_reason: row.ended_reason,
        })
    }
}

/// Row type for the messages table.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    role: String,
    content: String,
    metadata: Option<String>,
    timestamp: String,
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Uuid::parse_str(&row.id)?,
            session_id: Uuid::parse_str(&row.session_id)?,
            role: serde_json::from_str(&row.role)?,
            content: serde_json::from_str(&row.content)?,
            metadata: row
                .metadata
                .map(|m| serde_json::from_str(&m))
                .transpose()?,
            timestamp: parse_timestamp("timestamp", &row.timestamp)?,
        })
    }
}

/// Row type for the session_events table.
#[derive(sqlx::FromRow)]
struct EventRow {
    #[allow(dead_code)]
    id: i64,
    session_id: String,
    seq: i64,
    event_type: String,
    payload: String,
    timestamp: String,
}

impl TryFrom<EventRow> for StoredEvent {
    type Error = anyhow::Error;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            seq: u64::try_from(row.seq)?,
            session_id: Uuid::parse_str(&row.session_id)?,
            event_type: row.event_type,
            payload: serde_json::from_str(&row.payload)?,
            timestamp: parse_timestamp("timestamp", &row.timestamp)?,
        })
    }
}

/// Row type for the workspaces table.
#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    repo_root: String,
    name: String,
    created_at: String,
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = anyhow::Error;

    fn try_from(row: WorkspaceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Uuid::parse_str(&row.id)?,
            repo_root: PathBuf::from(row.repo_root),
            name: row.name,
            created_at: parse_timestamp("created_at", &row.created_at)?,
        })
    }
}

/// Row type for the workspace_agents table.
#[derive(sqlx::FromRow)]
struct WorkspaceAgentRow {
    #[allow(dead_code)]
    id: i64,
    workspace_id: String,
    session_id: String,
    branch: String,
    worktree_path: String,
    created_at: String,
}

impl TryFrom<WorkspaceAgentRow> for WorkspaceAgent {
    type Error = anyhow::Error;

    fn try_from(row: WorkspaceAgentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            workspace_id: Uuid::parse_str(&row.workspace_id)?,
            session_id: Uuid::parse_str(&row.session_id)?,
            branch: row.branch,
            worktree_path: PathBuf::from(row.worktree_path),
            created_at: parse_timestamp("created_at", &row.created_at)?,
        })
    }
}
