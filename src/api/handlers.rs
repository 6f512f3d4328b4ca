//! REST handlers and the HTTP error mapping.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::core::errors::{SessionError, VaultError};
use crate::core::manager::SessionManager;
use crate::core::session::{
    AgentKind, MAX_IMAGES_PER_MESSAGE, ProviderKey, SessionAuth, SessionConfig,
};
use crate::store::Store;

/// Shared state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    /// The session manager.
    pub manager: Arc<SessionManager>,
    /// Durable store (message history reads).
    pub store: Arc<dyn Store>,
    /// Loaded configuration.
    pub config: Arc<Config>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Liveness probe. Bypasses auth.
pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Readiness probe: backends + store reachable. Bypasses auth.
pub async fn readyz(State(state): State<AppState>) -> Response {
    let mut errors = Vec::new();
    let mut claude_path = None;

    for (name, readiness) in state.manager.backend_readiness().await {
        if readiness.ready {
            if name == "claude-sdk" {
                claude_path = readiness
                    .resolved_path
                    .map(|p| p.to_string_lossy().to_string());
            }
        } else {
            errors.push(
                readiness
                    .detail
                    .unwrap_or_else(|| format!("{name} not ready")),
            );
        }
    }

    if let Err(err) = state.store.list_active().await {
        errors.push(format!("store unreachable: {err}"));
    }

    if errors.is_empty() {
        let mut body = json!({"status": "ready"});
        if let Some(path) = claude_path {
            body["claudePath"] = json!(path);
        }
        (StatusCode::OK, Json(body)).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not ready", "errors": errors})),
        )
            .into_response()
    }
}

/// Request to create a session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Agent backend.
    pub agent: AgentKind,
    /// Auth record.
    pub auth: SessionAuth,
    /// Optional workspace for filesystem isolation.
    #[serde(default)]
    pub workspace_id: Option<Uuid>,
    /// Environment overrides.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Create a session.
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Response, AppError> {
    let (session, warnings) = state
        .manager
        .create(SessionConfig {
            agent: request.agent,
            auth: request.auth,
            workspace_id: request.workspace_id,
            env: request.env,
        })
        .await?;

    let mut body = json!({
        "id": session.id,
        "agent": session.agent,
        "status": session.status,
    });
    if !warnings.is_empty() {
        body["warnings"] = json!(warnings);
    }
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

/// List live sessions.
pub async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let sessions = state.manager.list_live().await?;
    let total = sessions.len();
    Ok(Json(json!({"sessions": sessions, "total": total})))
}

/// Sessions that can be reconnected after a restart.
pub async fn list_resumable(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let sessions = state.manager.list_resumable().await?;
    let total = sessions.len();
    Ok(Json(json!({"sessions": sessions, "total": total})))
}

/// Status snapshot for one session.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_session_id(&id)?;
    let session = state
        .manager
        .get_session(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("session not found: {id}")))?;

    let runtime_status = match state.manager.get_runtime(id).await {
        Some(runtime) => runtime.status().await.ok(),
        None => None,
    };

    Ok(Json(json!({"session": session, "runtime": runtime_status})))
}

/// Terminate a session.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_session_id(&id)?;
    state.manager.terminate(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Restore-if-needed and return status.
pub async fn connect_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_session_id(&id)?;
    let outcome = state.manager.connect(id).await?;
    Ok(Json(json!({
        "id": outcome.session.id,
        "agent": outcome.session.agent,
        "status": outcome.session.status,
        "restored": outcome.restored,
    })))
}

/// Paging for message history.
#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    /// Page size (default 100, capped at 1000).
    pub limit: Option<u32>,
    /// Offset into the ascending history.
    pub offset: Option<u32>,
}

/// Persisted message history, ascending.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_session_id(&id)?;
    if state.manager.get_session(id).await?.is_none() {
        return Err(AppError::NotFound(format!("session not found: {id}")));
    }

    let limit = query.limit.unwrap_or(100).min(1000);
    let offset = query.offset.unwrap_or(0);

    let messages = state
        .store
        .list_messages(id, limit, offset)
        .await
        .map_err(AppError::Unavailable)?;
    let total = state
        .store
        .count_messages(id)
        .await
        .map_err(AppError::Unavailable)?;

    Ok(Json(json!({
        "messages": messages,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

/// Request to store a credential.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCredentialRequest {
    /// Provider the key belongs to.
    pub provider: ProviderKey,
    /// Human label.
    pub label: String,
    /// The key itself. Encrypted at rest, never echoed back.
    pub api_key: String,
}

/// Store a credential.
pub async fn create_credential(
    State(state): State<AppState>,
    Json(request): Json<CreateCredentialRequest>,
) -> Result<Response, AppError> {
    if request.api_key.is_empty() {
        return Err(AppError::Validation("apiKey must not be empty".to_owned()));
    }
    let vault = state.manager.vault().ok_or(AppError::VaultUnavailable)?;
    let id = vault
        .put(request.provider, &request.label, &request.api_key)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({"id": id}))).into_response())
}

/// List credential metadata (no plaintext, ever).
pub async fn list_credentials(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let vault = state.manager.vault().ok_or(AppError::VaultUnavailable)?;
    let credentials = vault.list().await;
    Ok(Json(json!({"credentials": credentials})))
}

/// Delete a credential.
pub async fn delete_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let vault = state.manager.vault().ok_or(AppError::VaultUnavailable)?;
    vault.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Validate and parse a session id path parameter.
pub fn parse_session_id(id: &str) -> Result<Uuid, AppError> {
    if id.is_empty() || id.len() > 64 || id.chars().any(char::is_control) {
        return Err(AppError::Validation("invalid session id".to_owned()));
    }
    Uuid::parse_str(id).map_err(|_| AppError::Validation(format!("invalid session id: {id}")))
}

/// Validate image attachments on a user message.
pub fn validate_images(images: &[crate::core::session::ImageAttachment]) -> Result<(), String> {
    if images.len() > MAX_IMAGES_PER_MESSAGE {
        return Err(format!(
            "at most {MAX_IMAGES_PER_MESSAGE} images per message"
        ));
    }
    for image in images {
        image.validate()?;
    }
    Ok(())
}

/// HTTP error mapping for the REST surface.
#[derive(Debug)]
pub enum AppError {
    /// 400: rejected input.
    Validation(String),
    /// 404: unknown resource.
    NotFound(String),
    /// 429: admission control.
    Admission(String),
    /// 503: credential vault not configured.
    VaultUnavailable,
    /// 503: a dependency is unavailable.
    Unavailable(anyhow::Error),
    /// 500: everything else.
    Internal(anyhow::Error),
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound { .. } => Self::NotFound(err.to_string()),
            SessionError::LimitReached { .. } => Self::Admission(err.to_string()),
            SessionError::Validation { .. }
            | SessionError::CredentialResolution { .. }
            | SessionError::WorkspaceNotFound { .. }
            | SessionError::NotResumable { .. } => Self::Validation(err.to_string()),
            SessionError::WorktreeFailed { source, .. }
            | SessionError::BackendOpenFailed { source, .. } => Self::Internal(source),
            SessionError::Store { source } => Self::Unavailable(source),
        }
    }
}

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotConfigured => Self::VaultUnavailable,
            VaultError::NotFound { .. } => Self::NotFound(err.to_string()),
            VaultError::DuplicateId { .. } => Self::Validation(err.to_string()),
            other => Self::Internal(other.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Validation(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Admission(message) => (StatusCode::TOO_MANY_REQUESTS, message),
            Self::VaultUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "credential vault is not configured".to_owned(),
            ),
            Self::Unavailable(err) => {
                tracing::error!("dependency unavailable: {err}");
                (StatusCode::SERVICE_UNAVAILABLE, format!("unavailable: {err}"))
            }
            Self::Internal(err) => {
                tracing::error!("internal error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("internal error: {err}"),
                )
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_session_id(&id.to_string()).unwrap(), id);
        assert!(parse_session_id("").is_err());
        assert!(parse_session_id("../../etc/passwd").is_err());
        assert!(parse_session_id("not-a-uuid").is_err());
    }

    #[test]
    fn test_validate_images_count_cap() {
        let image = crate::core::session::ImageAttachment {
            mime_type: "image/png".to_owned(),
            data: "aGk=".to_owned(),
            filename: None,
        };
        let six = vec![image; 6];
        assert!(validate_images(&six).is_err());
        assert!(validate_images(&six[..5]).is_ok());
    }
}
