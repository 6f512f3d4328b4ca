//! Store behavior: ordering, crash recovery, cascades, and the
//! write-once backend session id.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use aperture::core::events::SessionEventKind;
use aperture::core::{
    AgentKind, ContentBlock, Message, MessageContent, MessageRole, ProviderKey, Session,
    SessionStatus,
};
use aperture::store::{SqliteStore, Store, Workspace, WorkspaceAgent};

fn sample_session() -> Session {
    Session::new(aperture::core::SessionConfig {
        agent: AgentKind::ClaudeSdk,
        auth: common::oauth_auth(ProviderKey::Anthropic),
        workspace_id: None,
        env: std::collections::HashMap::new(),
    })
}

#[tokio::test]
async fn test_session_roundtrip() {
    let store = SqliteStore::in_memory().await.unwrap();
    let session = sample_session();
    store.save_session(&session).await.unwrap();

    let loaded = store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, session.id);
    assert_eq!(loaded.agent, AgentKind::ClaudeSdk);
    assert_eq!(loaded.status, SessionStatus::Active);
    assert!(loaded.auth.api_key.is_none());
}

#[tokio::test]
async fn test_message_ordering_is_ascending_by_timestamp() {
    let store = SqliteStore::in_memory().await.unwrap();
    let session = sample_session();
    store.save_session(&session).await.unwrap();

    // Insert out of order; listing must come back ascending.
    let base = Utc::now();
    for (offset_secs, text) in [(2i64, "third"), (0, "first"), (1, "second")] {
        let mut message = Message::new(
            session.id,
            MessageRole::User,
            MessageContent::Text(text.to_owned()),
        );
        message.timestamp = base + ChronoDuration::seconds(offset_secs);
        store.save_message(&message).await.unwrap();
    }

    let messages = store.list_messages(session.id, 10, 0).await.unwrap();
    let texts: Vec<String> = messages.iter().map(|m| m.content.text()).collect();
    assert_eq!(texts, ["first", "second", "third"]);

    assert_eq!(store.count_messages(session.id).await.unwrap(), 3);
    assert_eq!(
        store
            .latest_message(session.id)
            .await
            .unwrap()
            .unwrap()
            .content
            .text(),
        "third"
    );

    // Paging.
    let page = store.list_messages(session.id, 1, 1).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].content.text(), "second");
}

#[tokio::test]
async fn test_message_content_survives_roundtrip() {
    let store = SqliteStore::in_memory().await.unwrap();
    let session = sample_session();
    store.save_session(&session).await.unwrap();

    let content = MessageContent::Blocks(vec![
        ContentBlock::Thinking {
            thinking: "hmm".to_owned(),
        },
        ContentBlock::Text {
            text: "answer".to_owned(),
        },
        ContentBlock::ToolUse {
            id: "t1".to_owned(),
            name: "read_file".to_owned(),
            input: serde_json::json!({"path": "a.rs"}),
        },
    ]);
    let message = Message::new(session.id, MessageRole::Assistant, content);
    store.save_message(&message).await.unwrap();

    let loaded = store.latest_message(session.id).await.unwrap().unwrap();
    match loaded.content {
        MessageContent::Blocks(blocks) => {
            assert_eq!(blocks.len(), 3);
            assert!(matches!(blocks[2], ContentBlock::ToolUse { .. }));
        }
        MessageContent::Text(_) => panic!("blocks came back as text"),
    }
}

#[tokio::test]
async fn test_events_are_sequenced_and_listed_descending() {
    let store = SqliteStore::in_memory().await.unwrap();
    let session = sample_session();
    store.save_session(&session).await.unwrap();

    let seq1 = store
        .log_event(session.id, &SessionEventKind::Idle)
        .await
        .unwrap();
    let seq2 = store
        .log_event(
            session.id,
            &SessionEventKind::Exit {
                reason: "idle timeout".to_owned(),
            },
        )
        .await
        .unwrap();
    assert_eq!(seq1, 1);
    assert_eq!(seq2, 2);

    // Audit consumers want tails.
    let events = store.list_events(session.id, 10).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "exit");
    assert_eq!(events[0].seq, 2);
    assert_eq!(events[1].event_type, "idle");
}

#[tokio::test]
async fn test_crash_recovery_demotes_active_sessions() {
    let store = SqliteStore::in_memory().await.unwrap();

    let mut resumable = sample_session();
    resumable.backend_session_id = Some("bk-1".to_owned());
    store.save_session(&resumable).await.unwrap();

    let plain = sample_session();
    store.save_session(&plain).await.unwrap();

    let mut terminated = sample_session();
    terminated.backend_session_id = Some("bk-2".to_owned());
    terminated.end("client request");
    store.save_session(&terminated).await.unwrap();

    let demoted = store.mark_all_active_ended("server restart").await.unwrap();
    assert_eq!(demoted, 2);

    for id in [resumable.id, plain.id] {
        let session = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Ended);
        assert!(session.ended_at.is_some());
        assert_eq!(session.ended_reason.as_deref(), Some("server restart"));
    }

    // Only the backend-id-bearing, non-terminated session resumes.
    let resumables = store.list_resumable().await.unwrap();
    assert_eq!(resumables.len(), 1);
    assert_eq!(resumables[0].id, resumable.id);
}

#[tokio::test]
async fn test_backend_session_id_is_write_once() {
    let store = SqliteStore::in_memory().await.unwrap();
    let session = sample_session();
    store.save_session(&session).await.unwrap();

    store
        .set_backend_session_id(session.id, "bk-1")
        .await
        .unwrap();
    // Idempotent for the same value.
    store
        .set_backend_session_id(session.id, "bk-1")
        .await
        .unwrap();
    // A different value never overwrites.
    assert!(
        store
            .set_backend_session_id(session.id, "bk-2")
            .await
            .is_err()
    );

    let loaded = store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(loaded.backend_session_id.as_deref(), Some("bk-1"));
}

#[tokio::test]
async fn test_delete_session_cascades() {
    let store = SqliteStore::in_memory().await.unwrap();
    let session = sample_session();
    store.save_session(&session).await.unwrap();

    store
        .save_message(&Message::new(
            session.id,
            MessageRole::User,
            MessageContent::Text("hi".to_owned()),
        ))
        .await
        .unwrap();
    store
        .log_event(session.id, &SessionEventKind::Idle)
        .await
        .unwrap();

    let workspace = Workspace {
        id: Uuid::new_v4(),
        repo_root: "/repos/app".into(),
        name: "app".to_owned(),
        created_at: Utc::now(),
    };
    store.save_workspace(&workspace).await.unwrap();
    store
        .save_workspace_agent(&WorkspaceAgent {
            workspace_id: workspace.id,
            session_id: session.id,
            branch: "session/abcd1234".to_owned(),
            worktree_path: "/worktrees/session-abcd1234".into(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    store.delete_session(session.id).await.unwrap();

    assert!(store.get_session(session.id).await.unwrap().is_none());
    assert_eq!(store.count_messages(session.id).await.unwrap(), 0);
    assert!(store.list_events(session.id, 10).await.unwrap().is_empty());
    assert!(
        store
            .get_workspace_agent(session.id)
            .await
            .unwrap()
            .is_none()
    );
    // The workspace itself survives.
    assert!(store.get_workspace(workspace.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_workspace_crud() {
    let store = SqliteStore::in_memory().await.unwrap();
    let workspace = Workspace {
        id: Uuid::new_v4(),
        repo_root: "/repos/app".into(),
        name: "app".to_owned(),
        created_at: Utc::now(),
    };
    store.save_workspace(&workspace).await.unwrap();
    assert_eq!(store.list_workspaces().await.unwrap().len(), 1);

    let loaded = store.get_workspace(workspace.id).await.unwrap().unwrap();
    assert_eq!(loaded.repo_root, workspace.repo_root);

    store.delete_workspace(workspace.id).await.unwrap();
    assert!(store.get_workspace(workspace.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_migrations_are_idempotent_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aperture.sqlite");

    {
        let store = SqliteStore::new(&path).await.unwrap();
        let session = sample_session();
        store.save_session(&session).await.unwrap();
    }

    // Re-open: migrations must not re-apply or clobber data.
    let store = SqliteStore::new(&path).await.unwrap();
    assert_eq!(store.list_sessions(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_list_sessions_filters_by_status() {
    let store = SqliteStore::in_memory().await.unwrap();
    let active = sample_session();
    store.save_session(&active).await.unwrap();

    let mut ended = sample_session();
    ended.end("client request");
    store.save_session(&ended).await.unwrap();

    assert_eq!(
        store
            .list_sessions(Some(SessionStatus::Active))
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(store.list_active().await.unwrap().len(), 1);
    assert_eq!(store.list_sessions(None).await.unwrap().len(), 2);
}
