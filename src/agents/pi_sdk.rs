//! Pi-family SDK backend.
//!
//! Speaks the same NDJSON transport as the Claude adapter but exposes the
//! wider Pi surface: any of the five providers, native steering, thinking
//! levels, and the conversation-tree operations (fork, navigate, new
//! session). Tree queries answer from state the SDK pushes on every change.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::PathBuf;
use tokio::sync::mpsc;

use super::env::build_session_env;
use super::process::{SdkProcess, SdkSessionCore, resolve_binary};
use super::traits::{
    AgentBackend, AgentEvent, BackendSession, BackendSessionConfig, PromptOptions, Readiness,
    TreeQuery,
};
use crate::core::events::StatusSnapshot;
use crate::core::session::{AgentKind, ImageAttachment, ProviderKey};
use crate::vault::SecretString;

/// Pi SDK backend.
#[derive(Debug)]
pub struct PiSdkBackend {
    binary: PathBuf,
}

impl PiSdkBackend {
    /// Create a backend driving the given SDK binary.
    #[must_use]
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl AgentBackend for PiSdkBackend {
    fn name(&self) -> &'static str {
        "pi-sdk"
    }

    fn kind(&self) -> AgentKind {
        AgentKind::PiSdk
    }

    fn allowed_providers(&self) -> &'static [ProviderKey] {
        &[
            ProviderKey::Anthropic,
            ProviderKey::Openai,
            ProviderKey::Google,
            ProviderKey::Groq,
            ProviderKey::Openrouter,
        ]
    }

    async fn ensure_installed(&self) -> Readiness {
        match resolve_binary(&self.binary) {
            Some(path) => Readiness {
                ready: true,
                resolved_path: Some(path),
                detail: None,
            },
            None => Readiness {
                ready: false,
                resolved_path: None,
                detail: Some(format!(
                    "pi sdk binary '{}' not found",
                    self.binary.display()
                )),
            },
        }
    }

    async fn open(
        &self,
        config: BackendSessionConfig,
        resolved_key: Option<SecretString>,
    ) -> anyhow::Result<Box<dyn BackendSession>> {
        let env = build_session_env(
            std::env::vars(),
            &config.auth,
            resolved_key.as_ref().map(SecretString::expose),
            &config.env,
        )?;

        let mut args = vec![
            "--jsonl".to_owned(),
            "--provider".to_owned(),
            config.auth.provider_key.to_string(),
        ];
        if let Some(resume) = &config.resume_backend_session_id {
            args.push("--session".to_owned());
            args.push(resume.clone());
        }

        let process = SdkProcess::spawn(
            &self.binary,
            &args,
            config.worktree_path.as_deref(),
            &env,
        )?;

        tracing::info!(
            session_id = %config.session_id,
            binary = %self.binary.display(),
            provider = %config.auth.provider_key,
            resuming = config.resume_backend_session_id.is_some(),
            "opened pi sdk session"
        );

        Ok(Box::new(PiSession {
            core: SdkSessionCore::start(process).await,
        }))
    }
}

/// A live Pi session.
#[derive(Debug)]
struct PiSession {
    core: SdkSessionCore,
}

#[async_trait]
impl BackendSession for PiSession {
    async fn prompt(
        &self,
        text: &str,
        images: &[ImageAttachment],
        options: PromptOptions,
    ) -> anyhow::Result<()> {
        let mut message = json!({
            "type": "prompt",
            "text": text,
            "images": images,
        });
        if let Some(model) = options.model {
            message["model"] = Value::String(model);
        }
        self.core.send(message).await
    }

    async fn steer(&self, text: &str) -> anyhow::Result<()> {
        self.core.send(json!({"type": "steer", "text": text})).await
    }

    async fn follow_up(&self, text: &str) -> anyhow::Result<()> {
        self.core
            .send(json!({"type": "follow_up", "text": text}))
            .await
    }

    async fn cancel(&self) -> anyhow::Result<()> {
        self.core.send(json!({"type": "cancel"})).await
    }

    async fn interrupt(&self) -> anyhow::Result<()> {
        self.core.send(json!({"type": "interrupt"})).await
    }

    async fn set_model(&self, model: &str) -> anyhow::Result<()> {
        self.core
            .send(json!({"type": "set", "key": "model", "value": model}))
            .await
    }

    async fn set_permission_mode(&self, mode: &str) -> anyhow::Result<()> {
        self.core
            .send(json!({"type": "set", "key": "permission_mode", "value": mode}))
            .await
    }

    async fn set_max_thinking_tokens(&self, _tokens: u32) -> anyhow::Result<()> {
        // Pi models thinking as discrete levels; token caps are advisory.
        Ok(())
    }

    async fn set_thinking_level(&self, level: &str) -> anyhow::Result<()> {
        self.core
            .send(json!({"type": "set", "key": "thinking_level", "value": level}))
            .await
    }

    async fn cycle_model(&self) -> anyhow::Result<()> {
        self.core.send(json!({"type": "cycle", "key": "model"})).await
    }

    async fn cycle_thinking_level(&self) -> anyhow::Result<()> {
        self.core
            .send(json!({"type": "cycle", "key": "thinking_level"}))
            .await
    }

    async fn compact(&self, instructions: Option<&str>) -> anyhow::Result<()> {
        self.core
            .send(json!({"type": "compact", "instructions": instructions}))
            .await
    }

    async fn fork(&self, entry_id: &str) -> anyhow::Result<()> {
        self.core
            .send(json!({"type": "fork", "entry_id": entry_id}))
            .await
    }

    async fn navigate(&self, entry_id: &str) -> anyhow::Result<()> {
        self.core
            .send(json!({"type": "navigate", "entry_id": entry_id}))
            .await
    }

    async fn new_session(&self) -> anyhow::Result<()> {
        self.core.send(json!({"type": "new_session"})).await
    }

    async fn tree_query(&self, query: TreeQuery) -> anyhow::Result<Value> {
        let tree_state = self.core.tree_state();
        let value = match query {
            TreeQuery::Tree => tree_state.tree.lock().await.clone(),
            TreeQuery::Forkable => tree_state.forkable.lock().await.clone(),
            TreeQuery::Stats => tree_state.stats.lock().await.clone(),
            TreeQuery::Models => tree_state.models.lock().await.clone(),
        };
        Ok(value)
    }

    async fn respond_to_permission(
        &self,
        tool_call_id: &str,
        option_id: Option<&str>,
        answers: Option<Value>,
    ) -> anyhow::Result<()> {
        self.core
            .send(json!({
                "type": "permission_response",
                "id": tool_call_id,
                "option_id": option_id,
                "answers": answers,
            }))
            .await
    }

    async fn cancel_permission(&self, tool_call_id: &str) -> anyhow::Result<()> {
        self.core
            .send(json!({"type": "permission_cancel", "id": tool_call_id}))
            .await
    }

    async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<AgentEvent>> {
        self.core.subscribe().await
    }

    async fn status(&self) -> StatusSnapshot {
        self.core.status().await
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        let _ = self.core.send(json!({"type": "shutdown"})).await;
        self.core.dispose("disposed").await;
        Ok(())
    }
}
