//! Manager behavior: admission, the creation pipeline, credential
//! resolution, rollback, restoration, and bulk shutdown.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use aperture::agents::env::is_provider_secret;
use aperture::agents::mock::MockBackend;
use aperture::core::errors::SessionError;
use aperture::core::{
    AgentKind, ApiKeyRef, AuthMode, ProviderKey, Session, SessionAuth, SessionConfig,
    SessionStatus,
};
use uuid::Uuid;

fn claude_pi() -> (MockBackend, MockBackend) {
    (
        MockBackend::new(AgentKind::ClaudeSdk),
        MockBackend::new(AgentKind::PiSdk),
    )
}

#[tokio::test]
async fn test_create_happy_path() {
    let (claude, pi) = claude_pi();
    let (manager, store) = common::mock_manager(claude, pi, None, 10).await;

    let (session, warnings) = manager
        .create(common::session_config(
            AgentKind::ClaudeSdk,
            common::inline_auth(ProviderKey::Anthropic, "sk-abc"),
        ))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Active);
    assert!(warnings.is_empty());
    assert_eq!(manager.live_count().await, 1);
    assert!(manager.get_runtime(session.id).await.is_some());

    // The persisted record never carries the cleartext key.
    let persisted = store.get_session(session.id).await.unwrap().unwrap();
    assert!(persisted.auth.api_key.is_none());
    assert_eq!(persisted.auth.api_key_ref, ApiKeyRef::Inline);
}

#[tokio::test]
async fn test_admission_cap() {
    let (claude, pi) = claude_pi();
    let (manager, _) = common::mock_manager(claude, pi, None, 1).await;

    manager
        .create(common::session_config(
            AgentKind::ClaudeSdk,
            common::inline_auth(ProviderKey::Anthropic, "sk-1"),
        ))
        .await
        .unwrap();

    let err = manager
        .create(common::session_config(
            AgentKind::ClaudeSdk,
            common::inline_auth(ProviderKey::Anthropic, "sk-2"),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::LimitReached { limit: 1 }));
}

#[tokio::test]
async fn test_admission_cap_holds_under_concurrent_creates() {
    let (claude, pi) = claude_pi();
    let (manager, _) = common::mock_manager(claude, pi, None, 2).await;

    // Six racing creations against a cap of two: the slot reservation makes
    // the outcome exact, not approximate.
    let attempts = futures::future::join_all((0..6).map(|_| {
        manager.create(common::session_config(
            AgentKind::ClaudeSdk,
            common::inline_auth(ProviderKey::Anthropic, "sk-race"),
        ))
    }))
    .await;

    let created = attempts.iter().filter(|r| r.is_ok()).count();
    let rejected = attempts
        .iter()
        .filter(|r| matches!(r, Err(SessionError::LimitReached { limit: 2 })))
        .count();
    assert_eq!(created, 2);
    assert_eq!(rejected, 4);
    assert_eq!(manager.live_count().await, 2);
}

#[tokio::test]
async fn test_auth_validation_rejections() {
    let (claude, pi) = claude_pi();
    let (manager, _) = common::mock_manager(claude, pi, None, 10).await;

    // Inline without a key.
    let mut auth = common::inline_auth(ProviderKey::Anthropic, "sk");
    auth.api_key = None;
    let err = manager
        .create(common::session_config(AgentKind::ClaudeSdk, auth))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Validation { .. }));

    // Stored without a vault configured.
    let err = manager
        .create(common::session_config(
            AgentKind::ClaudeSdk,
            common::stored_auth(ProviderKey::Anthropic, "cred-1"),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Validation { .. }));

    // Claude only accepts anthropic keys.
    let err = manager
        .create(common::session_config(
            AgentKind::ClaudeSdk,
            common::inline_auth(ProviderKey::Openai, "sk-oai"),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Validation { .. }));

    // Pi accepts any of the five providers.
    manager
        .create(common::session_config(
            AgentKind::PiSdk,
            common::inline_auth(ProviderKey::Groq, "gsk-1"),
        ))
        .await
        .unwrap();

    // A key alongside a non-inline ref is rejected.
    let auth = SessionAuth {
        mode: AuthMode::ApiKey,
        provider_key: ProviderKey::Anthropic,
        api_key_ref: ApiKeyRef::Stored,
        api_key: Some("sk-smuggled".to_owned()),
        stored_credential_id: Some("cred-1".to_owned()),
    };
    let err = manager
        .create(common::session_config(AgentKind::ClaudeSdk, auth))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Validation { .. }));
}

#[tokio::test]
async fn test_hosted_oauth_warns_but_creates() {
    let (claude, pi) = claude_pi();
    let (manager, _) = common::mock_manager(claude, pi, None, 10).await;

    let (_, warnings) = manager
        .create(common::session_config(
            AgentKind::ClaudeSdk,
            common::oauth_auth(ProviderKey::Anthropic),
        ))
        .await
        .unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("hosted mode"));
}

#[tokio::test]
async fn test_stored_credential_resolution() {
    let (_dir, vault) = common::temp_vault().await;
    let credential_id = vault
        .put(ProviderKey::Anthropic, "work", "sk-stored-key")
        .await
        .unwrap();

    let claude = MockBackend::new(AgentKind::ClaudeSdk);
    let env_slot = claude.captured_env();
    let (manager, _) =
        common::mock_manager(claude, MockBackend::new(AgentKind::PiSdk), Some(vault), 10).await;

    manager
        .create(common::session_config(
            AgentKind::ClaudeSdk,
            common::stored_auth(ProviderKey::Anthropic, &credential_id),
        ))
        .await
        .unwrap();

    // The decrypted key reached the backend spawn environment.
    let env = env_slot.lock().unwrap().clone().unwrap();
    assert_eq!(
        env.get("ANTHROPIC_API_KEY").map(String::as_str),
        Some("sk-stored-key")
    );
}

#[tokio::test]
async fn test_stored_credential_provider_mismatch_is_fatal() {
    let (_dir, vault) = common::temp_vault().await;
    // Key stored for openai, requested for a pi/anthropic session.
    let credential_id = vault
        .put(ProviderKey::Openai, "oai", "sk-oai")
        .await
        .unwrap();

    let (claude, pi) = claude_pi();
    let (manager, _) = common::mock_manager(claude, pi, Some(vault), 10).await;

    let err = manager
        .create(common::session_config(
            AgentKind::PiSdk,
            common::stored_auth(ProviderKey::Anthropic, &credential_id),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::CredentialResolution { .. }));
}

#[tokio::test]
async fn test_no_auth_bleed_into_spawn_env() {
    // Scenario: the session is created with its own key; the spawn env must
    // hold exactly that key and no other provider secrets, whatever the
    // gateway process env contains.
    let claude = MockBackend::new(AgentKind::ClaudeSdk);
    let env_slot = claude.captured_env();
    let (manager, _) =
        common::mock_manager(claude, MockBackend::new(AgentKind::PiSdk), None, 10).await;

    manager
        .create(common::session_config(
            AgentKind::ClaudeSdk,
            common::inline_auth(ProviderKey::Anthropic, "sk-session"),
        ))
        .await
        .unwrap();

    let env = env_slot.lock().unwrap().clone().unwrap();
    assert_eq!(
        env.get("ANTHROPIC_API_KEY").map(String::as_str),
        Some("sk-session")
    );
    for name in env.keys() {
        assert!(
            !is_provider_secret(name) || name == "ANTHROPIC_API_KEY",
            "provider secret leaked into session env: {name}"
        );
    }
}

#[tokio::test]
async fn test_failed_backend_open_rolls_back() {
    let claude = MockBackend::new(AgentKind::ClaudeSdk).failing_open();
    let (manager, store) =
        common::mock_manager(claude, MockBackend::new(AgentKind::PiSdk), None, 10).await;

    let err = manager
        .create(common::session_config(
            AgentKind::ClaudeSdk,
            common::inline_auth(ProviderKey::Anthropic, "sk-1"),
        ))
        .await
        .unwrap_err();
    let SessionError::BackendOpenFailed { session_id, .. } = err else {
        panic!("expected BackendOpenFailed, got {err}");
    };

    // The partially created record is gone.
    assert!(store.get_session(session_id).await.unwrap().is_none());
    assert_eq!(manager.live_count().await, 0);
}

#[tokio::test]
async fn test_workspace_creation_rejected_on_stub_broker() {
    let (claude, pi) = claude_pi();
    let (manager, store) = common::mock_manager(claude, pi, None, 10).await;

    let workspace = aperture::store::Workspace {
        id: Uuid::new_v4(),
        repo_root: "/repos/app".into(),
        name: "app".to_owned(),
        created_at: chrono::Utc::now(),
    };
    store.save_workspace(&workspace).await.unwrap();

    let err = manager
        .create(SessionConfig {
            agent: AgentKind::ClaudeSdk,
            auth: common::inline_auth(ProviderKey::Anthropic, "sk-1"),
            workspace_id: Some(workspace.id),
            env: HashMap::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Validation { .. }));
}

#[tokio::test]
async fn test_restore_on_boot_demotes_and_lists_resumable() {
    let (claude, pi) = claude_pi();
    let (manager, store) = common::mock_manager(claude, pi, None, 10).await;

    let mut resumable = Session::new(common::session_config(
        AgentKind::ClaudeSdk,
        common::oauth_auth(ProviderKey::Anthropic),
    ));
    resumable.backend_session_id = Some("bk-1".to_owned());
    store.save_session(&resumable).await.unwrap();

    let plain = Session::new(common::session_config(
        AgentKind::PiSdk,
        common::oauth_auth(ProviderKey::Openai),
    ));
    store.save_session(&plain).await.unwrap();

    let demoted = manager.restore_on_boot().await.unwrap();
    assert_eq!(demoted, 2);

    let resumables = manager.list_resumable().await.unwrap();
    assert_eq!(resumables.len(), 1);
    assert_eq!(resumables[0].id, resumable.id);
    assert_eq!(
        resumables[0].ended_reason.as_deref(),
        Some("server restart")
    );
}

#[tokio::test]
async fn test_connect_live_session_is_not_restored() {
    let (claude, pi) = claude_pi();
    let (manager, _) = common::mock_manager(claude, pi, None, 10).await;

    let (session, _) = manager
        .create(common::session_config(
            AgentKind::ClaudeSdk,
            common::inline_auth(ProviderKey::Anthropic, "sk-1"),
        ))
        .await
        .unwrap();

    let outcome = manager.connect(session.id).await.unwrap();
    assert!(!outcome.restored);
    assert_eq!(outcome.session.id, session.id);
}

#[tokio::test]
async fn test_connect_restores_resumable_session_as_new_session() {
    let (claude, pi) = claude_pi();
    let (manager, store) = common::mock_manager(claude, pi, None, 10).await;

    // A previous run left a resumable oauth session.
    let mut old = Session::new(common::session_config(
        AgentKind::ClaudeSdk,
        common::oauth_auth(ProviderKey::Anthropic),
    ));
    old.backend_session_id = Some("bk-42".to_owned());
    old.end("server restart");
    store.save_session(&old).await.unwrap();

    let outcome = manager.connect(old.id).await.unwrap();
    assert!(outcome.restored);
    // No resurrection: the restored session is a new Session referencing
    // the old backend session id.
    assert_ne!(outcome.session.id, old.id);
    assert_eq!(
        outcome.session.backend_session_id.as_deref(),
        Some("bk-42")
    );
    assert!(manager.get_runtime(outcome.session.id).await.is_some());

    // The old record stays ended.
    let old_loaded = store.get_session(old.id).await.unwrap().unwrap();
    assert_eq!(old_loaded.status, SessionStatus::Ended);
}

#[tokio::test]
async fn test_connect_rejects_inline_key_resume() {
    let (claude, pi) = claude_pi();
    let (manager, store) = common::mock_manager(claude, pi, None, 10).await;

    let mut old = Session::new(common::session_config(
        AgentKind::ClaudeSdk,
        common::inline_auth(ProviderKey::Anthropic, "sk-gone").redacted(),
    ));
    old.backend_session_id = Some("bk-9".to_owned());
    old.end("server restart");
    store.save_session(&old).await.unwrap();

    let err = manager.connect(old.id).await.unwrap_err();
    assert!(matches!(err, SessionError::NotResumable { .. }));
}

#[tokio::test]
async fn test_connect_rejects_explicitly_terminated_session() {
    let (claude, pi) = claude_pi();
    let (manager, store) = common::mock_manager(claude, pi, None, 10).await;

    let mut old = Session::new(common::session_config(
        AgentKind::ClaudeSdk,
        common::oauth_auth(ProviderKey::Anthropic),
    ));
    old.backend_session_id = Some("bk-7".to_owned());
    old.end("client request");
    store.save_session(&old).await.unwrap();

    let err = manager.connect(old.id).await.unwrap_err();
    assert!(matches!(err, SessionError::NotResumable { .. }));
}

#[tokio::test]
async fn test_connect_unknown_session() {
    let (claude, pi) = claude_pi();
    let (manager, _) = common::mock_manager(claude, pi, None, 10).await;
    let err = manager.connect(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound { .. }));
}

#[tokio::test]
async fn test_terminate_unknown_session() {
    let (claude, pi) = claude_pi();
    let (manager, _) = common::mock_manager(claude, pi, None, 10).await;
    let err = manager.terminate(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound { .. }));
}

#[tokio::test]
async fn test_terminate_all_ends_everything() {
    let (claude, pi) = claude_pi();
    let (manager, store) = common::mock_manager(claude, pi, None, 10).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let (session, _) = manager
            .create(common::session_config(
                AgentKind::ClaudeSdk,
                common::inline_auth(ProviderKey::Anthropic, "sk-x"),
            ))
            .await
            .unwrap();
        ids.push(session.id);
    }
    assert_eq!(manager.live_count().await, 3);

    manager.terminate_all().await;
    assert_eq!(manager.live_count().await, 0);

    for id in ids {
        let session = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Ended);
    }
}
