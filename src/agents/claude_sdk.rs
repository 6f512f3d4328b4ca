//! Claude-family SDK backend.
//!
//! Drives the Claude SDK binary over the NDJSON transport. Claude accepts
//! Anthropic keys only; tree operations are not part of its surface and
//! error, while thinking-level setters are advisory no-ops.

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

/// Claude SDK backend.
#[derive(Debug)]
pub struct ClaudeSdkBackend {
    binary: PathBuf,
}

impl ClaudeSdkBackend {
    /// Create a backend driving the given SDK binary.
    #[must_use]
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl AgentBackend for ClaudeSdkBackend {
    fn name(&self) -> &'static str {
        "claude-sdk"
    }

    fn kind(&self) -> AgentKind {
        AgentKind::ClaudeSdk
    }

    fn allowed_providers(&self) -> &'static [ProviderKey] {
        &[ProviderKey::Anthropic]
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
                    "claude sdk binary '{}' not found",
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
            "--input-format".to_owned(),
            "ndjson".to_owned(),
            "--output-format".to_owned(),
            "ndjson".to_owned(),
        ];
        if let Some(resume) = &config.resume_backend_session_id {
            args.push("--resume".to_owned());
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
            resuming = config.resume_backend_session_id.is_some(),
            "opened claude sdk session"
        );

        Ok(Box::new(ClaudeSession {
            core: SdkSessionCore::start(process).await,
        }))
    }
}

/// A live Claude session.
#[derive(Debug)]
struct ClaudeSession {
    core: SdkSessionCore,
}

#[async_trait]
impl BackendSession for ClaudeSession {
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
        // The Claude SDK has no steering primitive: interrupt the current
        // generation and redirect with a fresh prompt.
        self.core.send(json!({"type": "interrupt"})).await?;
        self.core
            .send(json!({"type": "prompt", "text": text, "images": []}))
            .await
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

    async fn set_max_thinking_tokens(&self, tokens: u32) -> anyhow::Result<()> {
        self.core
            .send(json!({"type": "set", "key": "max_thinking_tokens", "value": tokens}))
            .await
    }

    async fn set_thinking_level(&self, _level: &str) -> anyhow::Result<()> {
        // Thinking levels are a Pi concept; advisory, never fatal.
        Ok(())
    }

    async fn cycle_model(&self) -> anyhow::Result<()> {
        self.core.send(json!({"type": "cycle", "key": "model"})).await
    }

    async fn cycle_thinking_level(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn compact(&self, instructions: Option<&str>) -> anyhow::Result<()> {
        self.core
            .send(json!({"type": "compact", "instructions": instructions}))
            .await
    }

    async fn fork(&self, _entry_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("fork is not supported by the claude sdk")
    }

    async fn navigate(&self, _entry_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("navigate is not supported by the claude sdk")
    }

    async fn new_session(&self) -> anyhow::Result<()> {
        anyhow::bail!("new_session is not supported by the claude sdk")
    }

    async fn tree_query(&self, _query: TreeQuery) -> anyhow::Result<Value> {
        anyhow::bail!("tree queries are not supported by the claude sdk")
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
