//! Scripted in-process backend for tests.
//!
//! Plays pre-programmed event scripts per prompt, pauses at permission
//! steps until the client answers, and captures the environment it was
//! opened with so isolation tests can inspect the would-be spawn env.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::{Notify, mpsc};

use super::env::build_session_env;
use super::traits::{
    AgentBackend, AgentEvent, BackendSession, BackendSessionConfig, PromptOptions, Readiness,
    TreeQuery,
};
use crate::core::events::StatusSnapshot;
use crate::core::session::{AgentKind, ContentBlock, ImageAttachment, ProviderKey};
use crate::vault::SecretString;

/// Poison-tolerant lock; the mock never holds a lock across a panic point
/// that matters to a test.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One step of a scripted turn.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Emit this event.
    Emit(AgentEvent),
    /// Pause until the client answers the pending permission request.
    AwaitPermission,
}

/// Convenience: a turn that streams `text` and completes.
#[must_use]
pub fn text_turn(text: &str) -> Vec<MockStep> {
    vec![
        MockStep::Emit(AgentEvent::MessageDelta {
            text: text.to_owned(),
        }),
        MockStep::Emit(AgentEvent::TurnComplete {
            content: vec![ContentBlock::Text {
                text: text.to_owned(),
            }],
            tokens_used: text.len() as u64,
        }),
    ]
}

/// Scripted backend.
#[derive(Debug)]
pub struct MockBackend {
    kind: AgentKind,
    ready: bool,
    fail_open: bool,
    backend_session_id: Option<String>,
    turns: Arc<Mutex<VecDeque<Vec<MockStep>>>>,
    captured_env: Arc<std::sync::Mutex<Option<HashMap<String, String>>>>,
}

impl MockBackend {
    /// New mock for the given agent kind.
    #[must_use]
    pub fn new(kind: AgentKind) -> Self {
        Self {
            kind,
            ready: true,
            fail_open: false,
            backend_session_id: None,
            turns: Arc::new(Mutex::new(VecDeque::new())),
            captured_env: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Script one turn.
    #[must_use]
    pub fn with_turn(self, steps: Vec<MockStep>) -> Self {
        lock(&self.turns).push_back(steps);
        self
    }

    /// Script an additional turn on a shared backend.
    pub fn push_turn(&self, steps: Vec<MockStep>) {
        lock(&self.turns).push_back(steps);
    }

    /// Report a durable backend session id on open.
    #[must_use]
    pub fn with_backend_session_id(mut self, id: &str) -> Self {
        self.backend_session_id = Some(id.to_owned());
        self
    }

    /// Make `open` fail (rollback tests).
    #[must_use]
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Report not-ready from `ensure_installed`.
    #[must_use]
    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    /// Handle to the environment the last session was opened with.
    #[must_use]
    pub fn captured_env(&self) -> Arc<std::sync::Mutex<Option<HashMap<String, String>>>> {
        Arc::clone(&self.captured_env)
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn allowed_providers(&self) -> &'static [ProviderKey] {
        match self.kind {
            AgentKind::ClaudeSdk => &[ProviderKey::Anthropic],
            AgentKind::PiSdk => &[
                ProviderKey::Anthropic,
                ProviderKey::Openai,
                ProviderKey::Google,
                ProviderKey::Groq,
                ProviderKey::Openrouter,
            ],
        }
    }

    async fn ensure_installed(&self) -> Readiness {
        Readiness {
            ready: self.ready,
            resolved_path: None,
            detail: (!self.ready).then(|| "mock backend marked not ready".to_owned()),
        }
    }

    async fn open(
        &self,
        config: BackendSessionConfig,
        resolved_key: Option<SecretString>,
    ) -> anyhow::Result<Box<dyn BackendSession>> {
        if self.fail_open {
            anyhow::bail!("mock backend configured to fail open");
        }

        // Build (and capture) the spawn environment exactly like the real
        // adapters do, without spawning anything.
        let env = build_session_env(
            std::env::vars(),
            &config.auth,
            resolved_key.as_ref().map(SecretString::expose),
            &config.env,
        )?;
        *lock(&self.captured_env) = Some(env);

        let (event_tx, event_rx) = mpsc::channel(256);
        let backend_session_id = config
            .resume_backend_session_id
            .clone()
            .or_else(|| self.backend_session_id.clone());

        event_tx
            .send(AgentEvent::Started {
                backend_session_id: backend_session_id.clone(),
            })
            .await
            .ok();

        Ok(Box::new(MockSession {
            kind: self.kind,
            turns: Arc::clone(&self.turns),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            backend_session_id,
            streaming: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            permission_answer: Arc::new(Mutex::new(None)),
            permission_notify: Arc::new(Notify::new()),
            steered: Mutex::new(Vec::new()),
        }))
    }
}

/// A permission answer left by the client.
#[derive(Debug, Clone)]
struct PermissionAnswer {
    option_id: Option<String>,
    denied: bool,
}

struct MockSession {
    kind: AgentKind,
    turns: Arc<Mutex<VecDeque<Vec<MockStep>>>>,
    event_tx: mpsc::Sender<AgentEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<AgentEvent>>>,
    backend_session_id: Option<String>,
    streaming: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    permission_answer: Arc<Mutex<Option<PermissionAnswer>>>,
    permission_notify: Arc<Notify>,
    steered: Mutex<Vec<String>>,
}

impl std::fmt::Debug for MockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSession").finish_non_exhaustive()
    }
}

impl MockSession {
    async fn emit_turn_complete(event_tx: &mpsc::Sender<AgentEvent>) {
        event_tx
            .send(AgentEvent::TurnComplete {
                content: Vec::new(),
                tokens_used: 0,
            })
            .await
            .ok();
    }
}

#[async_trait]
impl BackendSession for MockSession {
    async fn prompt(
        &self,
        _text: &str,
        _images: &[ImageAttachment],
        _options: PromptOptions,
    ) -> anyhow::Result<()> {
        let steps = lock(&self.turns)
            .pop_front()
            .unwrap_or_else(|| text_turn("ok"));

        let event_tx = self.event_tx.clone();
        let streaming = Arc::clone(&self.streaming);
        let cancelled = Arc::clone(&self.cancelled);
        let permission_answer = Arc::clone(&self.permission_answer);
        let permission_notify = Arc::clone(&self.permission_notify);

        streaming.store(true, Ordering::SeqCst);
        cancelled.store(false, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut last_tool_call_id = String::new();
            for step in steps {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                match step {
                    MockStep::Emit(event) => {
                        if let AgentEvent::PermissionRequested { tool_call_id, .. } = &event {
                            last_tool_call_id.clone_from(tool_call_id);
                        }
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    MockStep::AwaitPermission => {
                        permission_notify.notified().await;
                        if cancelled.load(Ordering::SeqCst) {
                            break;
                        }
                        let answer = lock(&permission_answer).take();
                        let answer = answer.unwrap_or(PermissionAnswer {
                            option_id: None,
                            denied: true,
                        });
                        event_tx
                            .send(AgentEvent::PermissionResolved {
                                tool_call_id: last_tool_call_id.clone(),
                                option_id: answer.option_id.clone(),
                                denied: answer.denied,
                            })
                            .await
                            .ok();
                        if answer.denied {
                            Self::emit_turn_complete(&event_tx).await;
                            streaming.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            }
            streaming.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn steer(&self, text: &str) -> anyhow::Result<()> {
        lock(&self.steered).push(text.to_owned());
        Ok(())
    }

    async fn follow_up(&self, text: &str) -> anyhow::Result<()> {
        lock(&self.steered).push(format!("follow_up:{text}"));
        Ok(())
    }

    async fn cancel(&self) -> anyhow::Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.permission_notify.notify_one();
        self.streaming.store(false, Ordering::SeqCst);
        Self::emit_turn_complete(&self.event_tx).await;
        Ok(())
    }

    async fn interrupt(&self) -> anyhow::Result<()> {
        self.cancel().await
    }

    async fn set_model(&self, _model: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_permission_mode(&self, _mode: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_max_thinking_tokens(&self, _tokens: u32) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_thinking_level(&self, _level: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cycle_model(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cycle_thinking_level(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn compact(&self, _instructions: Option<&str>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fork(&self, _entry_id: &str) -> anyhow::Result<()> {
        match self.kind {
            AgentKind::PiSdk => Ok(()),
            AgentKind::ClaudeSdk => anyhow::bail!("fork is not supported by the claude sdk"),
        }
    }

    async fn navigate(&self, _entry_id: &str) -> anyhow::Result<()> {
        match self.kind {
            AgentKind::PiSdk => Ok(()),
            AgentKind::ClaudeSdk => anyhow::bail!("navigate is not supported by the claude sdk"),
        }
    }

    async fn new_session(&self) -> anyhow::Result<()> {
        match self.kind {
            AgentKind::PiSdk => Ok(()),
            AgentKind::ClaudeSdk => anyhow::bail!("new_session is not supported by the claude sdk"),
        }
    }

    async fn tree_query(&self, query: TreeQuery) -> anyhow::Result<Value> {
        match self.kind {
            AgentKind::PiSdk => Ok(json!({ "query": format!("{query:?}") })),
            AgentKind::ClaudeSdk => {
                anyhow::bail!("tree queries are not supported by the claude sdk")
            }
        }
    }

    async fn respond_to_permission(
        &self,
        _tool_call_id: &str,
        option_id: Option<&str>,
        _answers: Option<Value>,
    ) -> anyhow::Result<()> {
        let denied = option_id.is_none_or(|o| o.contains("deny"));
        *lock(&self.permission_answer) = Some(PermissionAnswer {
            option_id: option_id.map(ToOwned::to_owned),
            denied,
        });
        self.permission_notify.notify_one();
        Ok(())
    }

    async fn cancel_permission(&self, _tool_call_id: &str) -> anyhow::Result<()> {
        *lock(&self.permission_answer) = Some(PermissionAnswer {
            option_id: None,
            denied: true,
        });
        self.permission_notify.notify_one();
        Ok(())
    }

    async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<AgentEvent>> {
        lock(&self.event_rx)
            .take()
            .ok_or_else(|| anyhow::anyhow!("mock session already has a subscriber"))
    }

    async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            streaming: self.streaming.load(Ordering::SeqCst),
            model: Some("mock-model".to_owned()),
            permission_mode: None,
            thinking_level: None,
            tokens_used: 0,
            resumable: self.backend_session_id.is_some(),
            backend_session_id: self.backend_session_id.clone(),
        }
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        if !self.exited.swap(true, Ordering::SeqCst) {
            self.event_tx
                .send(AgentEvent::Exit {
                    reason: "disposed".to_owned(),
                })
                .await
                .ok();
        }
        Ok(())
    }
}
