//! Session lifecycle: admission, the creation pipeline, restoration after
//! restarts, and bulk shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

use crate::agents::traits::{AgentBackend, AuthContext, BackendSessionConfig, Readiness};
use crate::config::Config;
use crate::core::errors::SessionError;
use crate::core::runtime::{RuntimeOptions, SessionRuntime};
use crate::core::session::{AgentKind, ApiKeyRef, AuthMode, Session, SessionConfig};
use crate::store::{Store, WorkspaceAgent};
use crate::vault::{CredentialVault, SecretString};
use crate::worktree::{WorktreeBroker, WorktreeRequest};

/// Manager tuning, distilled from [`Config`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Hard cap on concurrently live sessions.
    pub max_concurrent: usize,
    /// Hosted mode (no human for interactive logins).
    pub hosted_mode: bool,
    /// Whether interactive auth is permitted.
    pub allow_interactive: bool,
    /// Runtime knobs handed to every session runtime.
    pub runtime: RuntimeOptions,
    /// Directory session worktrees are created under.
    pub worktree_base: PathBuf,
}

impl ManagerSettings {
    /// Derive settings from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent: config.max_concurrent_sessions,
            hosted_mode: config.hosted_mode,
            allow_interactive: config.allow_interactive_auth,
            runtime: RuntimeOptions {
                idle_timeout: config.session_idle_timeout,
                rpc_timeout: config.rpc_request_timeout,
                shutdown_deadline: config.shutdown_deadline,
                ..RuntimeOptions::default()
            },
            worktree_base: config
                .database_path
                .parent()
                .map_or_else(|| PathBuf::from("worktrees"), |p| p.join("worktrees")),
        }
    }
}

/// Result of a connect: the (possibly new) session and whether a restore
/// happened.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    /// The live session to talk to.
    pub session: Session,
    /// True when a new session was spun up from a resumable record.
    pub restored: bool,
}

/// Registry entry. Admission reserves a slot before the backend handshake
/// runs; the slot is filled with the runtime on success and released on
/// failure, so the capacity check and the insert are one critical section.
#[derive(Debug, Clone)]
enum LiveEntry {
    /// Slot held while the creation pipeline is still running.
    Pending,
    /// Live runtime.
    Running(SessionRuntime),
}

/// Owns the set of live sessions and their runtimes.
pub struct SessionManager {
    store: Arc<dyn Store>,
    vault: Option<Arc<CredentialVault>>,
    broker: Arc<dyn WorktreeBroker>,
    claude: Arc<dyn AgentBackend>,
    pi: Arc<dyn AgentBackend>,
    live: RwLock<HashMap<Uuid, LiveEntry>>,
    settings: ManagerSettings,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager with injected collaborators (tests swap in mocks).
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        vault: Option<Arc<CredentialVault>>,
        broker: Arc<dyn WorktreeBroker>,
        claude: Arc<dyn AgentBackend>,
        pi: Arc<dyn AgentBackend>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            store,
            vault,
            broker,
            claude,
            pi,
            live: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Crash recovery at boot: every session still marked live in the store
    /// is demoted to ended. Nothing is resurrected automatically; resumable
    /// sessions wait for an explicit `connect`.
    ///
    /// # Errors
    ///
    /// Propagates store failures (fatal at startup).
    pub async fn restore_on_boot(&self) -> Result<u64, SessionError> {
        let demoted = self
            .store
            .mark_all_active_ended("server restart")
            .await
            .map_err(|source| SessionError::Store { source })?;
        if demoted > 0 {
            tracing::info!(count = demoted, "demoted orphaned sessions from previous run");
        }
        Ok(demoted)
    }

    fn backend_for(&self, agent: AgentKind) -> &Arc<dyn AgentBackend> {
        match agent {
            AgentKind::ClaudeSdk => &self.claude,
            AgentKind::PiSdk => &self.pi,
        }
    }

    /// Readiness of both backends, for `/readyz`.
    pub async fn backend_readiness(&self) -> Vec<(&'static str, Readiness)> {
        vec![
            (self.claude.name(), self.claude.ensure_installed().await),
            (self.pi.name(), self.pi.ensure_installed().await),
        ]
    }

    /// Whether the credential vault is configured.
    #[must_use]
    pub fn vault(&self) -> Option<&Arc<CredentialVault>> {
        self.vault.as_ref()
    }

    /// Count of live sessions, including reserved slots for creations
    /// still in flight.
    pub async fn live_count(&self) -> usize {
        self.live.read().await.len()
    }

    /// Runtime handle for a live session.
    pub async fn get_runtime(&self, id: Uuid) -> Option<SessionRuntime> {
        match self.live.read().await.get(&id) {
            Some(LiveEntry::Running(runtime)) => Some(runtime.clone()),
            _ => None,
        }
    }

    /// Durable session record.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>, SessionError> {
        self.store
            .get_session(id)
            .await
            .map_err(|source| SessionError::Store { source })
    }

    /// Sessions that are still live.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_live(&self) -> Result<Vec<Session>, SessionError> {
        self.store
            .list_active()
            .await
            .map_err(|source| SessionError::Store { source })
    }

    /// Sessions eligible for resumption.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_resumable(&self) -> Result<Vec<Session>, SessionError> {
        self.store
            .list_resumable()
            .await
            .map_err(|source| SessionError::Store { source })
    }

    /// Create a session: admission, auth validation, credential resolution,
    /// worktree provisioning, persistence, runtime start. Admission holds a
    /// reserved registry slot for the whole pipeline, so the cap cannot be
    /// exceeded by concurrent creations. Any failure after persistence
    /// rolls the partial state back (worktrees stay on disk by design).
    ///
    /// # Errors
    ///
    /// See [`SessionError`]; every rejection happens here, not at first use.
    #[instrument(skip(self, config), fields(agent = %config.agent))]
    pub async fn create(
        &self,
        config: SessionConfig,
    ) -> Result<(Session, Vec<String>), SessionError> {
        // Reap ended runtimes so stale registry entries never count
        // against the cap, then fail fast when already full. The
        // authoritative check is the slot reservation below.
        self.reap_ended().await;
        if self.live.read().await.len() >= self.settings.max_concurrent {
            return Err(SessionError::LimitReached {
                limit: self.settings.max_concurrent,
            });
        }

        let backend = Arc::clone(self.backend_for(config.agent));

        let ctx = AuthContext {
            hosted_mode: self.settings.hosted_mode,
            allow_interactive: self.settings.allow_interactive,
            vault_available: self.vault.is_some(),
        };
        let warnings =
            backend
                .validate_auth(&config.auth, &ctx)
                .map_err(|e| SessionError::Validation {
                    reason: e.to_string(),
                })?;
        for warning in &warnings {
            tracing::warn!(agent = %config.agent, "{warning}");
        }

        let resolved_key = self.resolve_key(&config).await?;

        let mut session = Session::new(SessionConfig {
            auth: config.auth.redacted(),
            ..config.clone()
        });

        // Admission: the capacity check and the slot reservation are one
        // critical section, so concurrent creations cannot race past the
        // cap while the backend handshake is in flight.
        self.reserve_slot(session.id).await?;

        match self
            .provision_and_start(&mut session, backend.as_ref(), resolved_key, None)
            .await
        {
            Ok(runtime) => {
                self.commit_slot(runtime).await;
                tracing::info!(session_id = %session.id, agent = %session.agent, "session created");
                Ok((session, warnings))
            }
            Err(err) => {
                self.release_slot(session.id).await;
                self.rollback_creation(session.id).await;
                Err(err)
            }
        }
    }

    /// Restore-if-needed: return the live session, or spin a new session up
    /// from a resumable record.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `NotResumable` when the record cannot be
    /// brought back (explicit terminate, or an inline key that was never
    /// persisted).
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn connect(&self, id: Uuid) -> Result<ConnectOutcome, SessionError> {
        self.reap_ended().await;
        if matches!(self.live.read().await.get(&id), Some(LiveEntry::Running(_))) {
            let session = self
                .get_session(id)
                .await?
                .ok_or(SessionError::NotFound { session_id: id })?;
            return Ok(ConnectOutcome {
                session,
                restored: false,
            });
        }

        let old = self
            .get_session(id)
            .await?
            .ok_or(SessionError::NotFound { session_id: id })?;

        if !old.is_resumable() {
            return Err(SessionError::NotResumable {
                session_id: id,
                reason: "session has no resumable backend state".to_owned(),
            });
        }
        if old.auth.mode == AuthMode::ApiKey && old.auth.api_key_ref == ApiKeyRef::Inline {
            // Inline keys are never persisted, so there is nothing to
            // resume with.
            return Err(SessionError::NotResumable {
                session_id: id,
                reason: "inline-key sessions cannot be resumed; create a new session".to_owned(),
            });
        }

        let backend = Arc::clone(self.backend_for(old.agent));
        let config = SessionConfig {
            agent: old.agent,
            auth: old.auth.clone(),
            workspace_id: old.workspace_id,
            env: old.env.clone(),
        };
        let resolved_key = self.resolve_key(&config).await?;

        // A resumed session is a new Session referencing the older
        // backendSessionId; the old record stays ended. It reuses the old
        // worktree, so no new provisioning happens below.
        let mut session = Session::new(config);
        session.backend_session_id = old.backend_session_id.clone();
        session.worktree_path = old.worktree_path.clone();

        // Same admission path as create: reserve under the capacity check.
        self.reserve_slot(session.id).await?;

        match self
            .provision_and_start(
                &mut session,
                backend.as_ref(),
                resolved_key,
                old.backend_session_id.clone(),
            )
            .await
        {
            Ok(runtime) => {
                self.commit_slot(runtime).await;
                tracing::info!(
                    session_id = %session.id,
                    resumed_from = %id,
                    "session restored"
                );
                Ok(ConnectOutcome {
                    session,
                    restored: true,
                })
            }
            Err(err) => {
                self.release_slot(session.id).await;
                self.rollback_creation(session.id).await;
                Err(err)
            }
        }
    }

    /// Terminate one session.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id is unknown to both registry and store.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn terminate(&self, id: Uuid) -> Result<(), SessionError> {
        let runtime = {
            let mut live = self.live.write().await;
            match live.remove(&id) {
                Some(LiveEntry::Running(runtime)) => Some(runtime),
                Some(LiveEntry::Pending) => {
                    // Creation still in flight; keep the reservation and let
                    // the store path answer.
                    live.insert(id, LiveEntry::Pending);
                    None
                }
                None => None,
            }
        };
        if let Some(runtime) = runtime {
            if let Err(err) = runtime.terminate().await {
                tracing::warn!(session_id = %id, error = %err, "terminate returned error");
            }
            return Ok(());
        }

        // Not live; still mark the record ended if it exists.
        match self.get_session(id).await? {
            Some(session) if session.ended_at.is_none() => self
                .store
                .end_session(id, "client request")
                .await
                .map_err(|source| SessionError::Store { source }),
            Some(_) => Ok(()),
            None => Err(SessionError::NotFound { session_id: id }),
        }
    }

    /// Dispose every runtime concurrently and wait for the exits, bounded
    /// by each runtime's shutdown deadline.
    pub async fn terminate_all(&self) {
        let runtimes: Vec<SessionRuntime> = self
            .live
            .write()
            .await
            .drain()
            .filter_map(|(_, entry)| match entry {
                LiveEntry::Running(runtime) => Some(runtime),
                LiveEntry::Pending => None,
            })
            .collect();
        if runtimes.is_empty() {
            return;
        }
        tracing::info!(count = runtimes.len(), "terminating all sessions");
        let results =
            futures::future::join_all(runtimes.iter().map(SessionRuntime::terminate)).await;
        for (runtime, result) in runtimes.iter().zip(results) {
            if let Err(err) = result {
                tracing::warn!(
                    session_id = %runtime.session_id(),
                    error = %err,
                    "session did not exit cleanly"
                );
            }
        }
    }

    async fn resolve_key(
        &self,
        config: &SessionConfig,
    ) -> Result<Option<SecretString>, SessionError> {
        match (config.auth.mode, config.auth.api_key_ref) {
            (AuthMode::ApiKey, ApiKeyRef::Inline) => Ok(config
                .auth
                .api_key
                .clone()
                .map(SecretString::new)),
            (AuthMode::ApiKey, ApiKeyRef::Stored) => {
                let vault = self
                    .vault
                    .as_ref()
                    .ok_or_else(|| SessionError::CredentialResolution {
                        reason: "credential vault is not configured".to_owned(),
                    })?;
                let credential_id = config.auth.stored_credential_id.as_deref().ok_or_else(
                    || SessionError::CredentialResolution {
                        reason: "storedCredentialId missing".to_owned(),
                    },
                )?;
                let resolved = vault.get(credential_id).await.map_err(|e| {
                    SessionError::CredentialResolution {
                        reason: e.to_string(),
                    }
                })?;
                // A key stored for one provider must not be handed to
                // another.
                if resolved.provider != config.auth.provider_key {
                    return Err(SessionError::CredentialResolution {
                        reason: format!(
                            "credential {credential_id} belongs to provider '{}', session wants '{}'",
                            resolved.provider, config.auth.provider_key
                        ),
                    });
                }
                Ok(Some(resolved.api_key))
            }
            _ => Ok(None),
        }
    }

    async fn provision_worktree(
        &self,
        session_id: Uuid,
        workspace_id: Uuid,
    ) -> Result<crate::worktree::WorktreeInfo, SessionError> {
        if self.broker.is_stub() {
            return Err(SessionError::Validation {
                reason: "workspace-backed sessions are unavailable: no worktree helper".to_owned(),
            });
        }

        let workspace = self
            .store
            .get_workspace(workspace_id)
            .await
            .map_err(|source| SessionError::Store { source })?
            .ok_or(SessionError::WorkspaceNotFound { workspace_id })?;

        self.broker
            .ensure_repo_ready(&workspace.repo_root)
            .await
            .map_err(|source| SessionError::WorktreeFailed { session_id, source })?;

        // Branch derived from the session id: short prefix keeps names
        // usable in a terminal.
        let short = session_id.simple().to_string();
        let branch = format!("session/{}", &short[..8]);

        self.broker
            .ensure_worktree(&WorktreeRequest {
                repo_root: workspace.repo_root.clone(),
                branch,
                base_dir: self.settings.worktree_base.clone(),
            })
            .await
            .map_err(|source| SessionError::WorktreeFailed { session_id, source })
    }

    async fn open_and_start(
        &self,
        session: &Session,
        backend: &dyn AgentBackend,
        resolved_key: Option<SecretString>,
        resume_backend_session_id: Option<String>,
    ) -> anyhow::Result<SessionRuntime> {
        let backend_session = backend
            .open(
                BackendSessionConfig {
                    session_id: session.id,
                    auth: session.auth.clone(),
                    env: session.env.clone(),
                    worktree_path: session.worktree_path.clone(),
                    resume_backend_session_id,
                },
                resolved_key,
            )
            .await?;

        SessionRuntime::start(
            session.id,
            session.agent,
            backend_session,
            Arc::clone(&self.store),
            self.settings.runtime.clone(),
        )
        .await
    }

    /// Reserve an admission slot for a session id, or reject at the cap.
    /// Reserved slots count as live until committed or released.
    async fn reserve_slot(&self, session_id: Uuid) -> Result<(), SessionError> {
        let mut live = self.live.write().await;
        if live.len() >= self.settings.max_concurrent {
            return Err(SessionError::LimitReached {
                limit: self.settings.max_concurrent,
            });
        }
        live.insert(session_id, LiveEntry::Pending);
        Ok(())
    }

    /// Fill a reserved slot with its running runtime.
    async fn commit_slot(&self, runtime: SessionRuntime) {
        let id = runtime.session_id();
        self.live
            .write()
            .await
            .insert(id, LiveEntry::Running(runtime));
    }

    /// Release a reservation whose pipeline failed.
    async fn release_slot(&self, session_id: Uuid) {
        self.live.write().await.remove(&session_id);
    }

    /// The fallible middle of session creation, run between slot
    /// reservation and commit: provision the worktree (creation only; a
    /// restored session reuses its old one), persist the record and
    /// binding, open the backend, start the runtime.
    async fn provision_and_start(
        &self,
        session: &mut Session,
        backend: &dyn AgentBackend,
        resolved_key: Option<SecretString>,
        resume_backend_session_id: Option<String>,
    ) -> Result<SessionRuntime, SessionError> {
        // Worktree before persistence so a broker failure costs nothing.
        let new_worktree = match session.workspace_id {
            Some(workspace_id) if session.worktree_path.is_none() => {
                let worktree = self.provision_worktree(session.id, workspace_id).await?;
                session.worktree_path = Some(worktree.worktree_path.clone());
                Some((workspace_id, worktree))
            }
            _ => None,
        };

        self.store
            .save_session(session)
            .await
            .map_err(|source| SessionError::Store { source })?;

        if let Some((workspace_id, worktree)) = new_worktree {
            self.store
                .save_workspace_agent(&WorkspaceAgent {
                    workspace_id,
                    session_id: session.id,
                    branch: worktree.branch,
                    worktree_path: worktree.worktree_path,
                    created_at: chrono::Utc::now(),
                })
                .await
                .map_err(|source| SessionError::Store { source })?;
        }

        self.open_and_start(session, backend, resolved_key, resume_backend_session_id)
            .await
            .map_err(|source| SessionError::BackendOpenFailed {
                session_id: session.id,
                agent: session.agent,
                source,
            })
    }

    /// Remove registry entries whose runtime has ended. Called lazily from
    /// the API layer; cheap because status() on an ended runtime fails fast.
    /// Reserved slots are left alone.
    pub async fn reap_ended(&self) {
        let ids: Vec<Uuid> = self.live.read().await.keys().copied().collect();
        for id in ids {
            let runtime = match self.live.read().await.get(&id) {
                Some(LiveEntry::Running(runtime)) => runtime.clone(),
                _ => continue,
            };
            if runtime.status().await.is_err() {
                let mut live = self.live.write().await;
                if matches!(live.get(&id), Some(LiveEntry::Running(_))) {
                    live.remove(&id);
                }
            }
        }
    }

    async fn rollback_creation(&self, session_id: Uuid) {
        // Worktrees deliberately survive; only records are rolled back.
        if let Err(err) = self.store.delete_workspace_agent(session_id).await {
            tracing::warn!(session_id = %session_id, error = %err, "rollback: binding delete failed");
        }
        if let Err(err) = self.store.delete_session(session_id).await {
            tracing::warn!(session_id = %session_id, error = %err, "rollback: session delete failed");
        }
        tracing::info!(session_id = %session_id, "rolled back failed session creation");
    }
}
