//! Wire types for the frame channel.
//!
//! Inbound frames are a tagged union of command types; anything the union
//! does not cover gets a framed error back and the connection stays open.
//! Outbound frames are either session events (serialized with their own
//! `type` tags), command results, replays, or framed errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use typeshare::typeshare;

use crate::core::events::StatusSnapshot;
use crate::core::session::{ImageAttachment, Message};

/// Over-size frame (measured before parsing).
pub const ERR_FRAME_TOO_LARGE: i64 = -32000;

/// Frame is not valid JSON.
pub const ERR_PARSE: i64 = -32700;

/// Frame is JSON but not a known command.
pub const ERR_UNKNOWN_COMMAND: i64 = -32601;

/// Command is known but its parameters are invalid.
pub const ERR_INVALID_PARAMS: i64 = -32602;

/// Commands a client can send on the frame channel.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// One user turn.
    UserMessage {
        /// Prompt text.
        content: String,
        /// Image attachments (max 5, 10 MiB each).
        #[serde(default)]
        images: Vec<ImageAttachment>,
    },

    /// Answer a pending permission request.
    #[serde(rename_all = "camelCase")]
    PermissionResponse {
        /// Tool call being answered.
        tool_call_id: String,
        /// Chosen option.
        #[serde(default)]
        option_id: Option<String>,
        /// Structured answers, when the request asked questions.
        #[serde(default)]
        answers: Option<Value>,
    },

    /// Abort the current turn.
    Cancel,

    /// Hard-interrupt the current turn.
    Interrupt,

    /// Advisory: switch permission mode.
    SetPermissionMode {
        /// The mode.
        mode: String,
    },

    /// Advisory: switch model.
    SetModel {
        /// The model.
        model: String,
    },

    /// Advisory: cap thinking tokens.
    SetThinkingTokens {
        /// The cap.
        tokens: u32,
    },

    /// Restore files changed after an entry (advisory).
    #[serde(rename_all = "camelCase")]
    RewindFiles {
        /// Entry to rewind to.
        #[serde(default)]
        entry_id: Option<String>,
    },

    /// MCP server status.
    GetMcpStatus,

    /// Replace the MCP server set.
    SetMcpServers {
        /// Server definitions.
        servers: Value,
    },

    /// Account/auth info for this session (no secrets).
    GetAccountInfo,

    /// Models this session's backend can use.
    GetSupportedModels,

    /// Commands this channel accepts.
    GetSupportedCommands,

    /// Session-scoped configuration update.
    UpdateConfig {
        /// Opaque config patch.
        config: Value,
    },

    /// Pi: interrupt and redirect the current generation.
    PiSteer {
        /// Redirecting content.
        content: String,
    },

    /// Pi: queue a post-turn message.
    PiFollowUp {
        /// The message.
        content: String,
    },

    /// Pi: summarize and trim history.
    PiCompact {
        /// Optional instructions.
        #[serde(default)]
        instructions: Option<String>,
    },

    /// Pi: fork from an entry.
    #[serde(rename_all = "camelCase")]
    PiFork {
        /// The entry.
        entry_id: String,
    },

    /// Pi: navigate to an entry.
    #[serde(rename_all = "camelCase")]
    PiNavigate {
        /// The entry.
        entry_id: String,
    },

    /// Pi: switch model.
    PiSetModel {
        /// The model.
        model: String,
    },

    /// Pi: cycle to the next model.
    PiCycleModel,

    /// Pi: set thinking level.
    PiSetThinkingLevel {
        /// The level.
        level: String,
    },

    /// Pi: cycle the thinking level.
    PiCycleThinking,

    /// Pi: start a fresh backend conversation.
    PiNewSession,

    /// Pi: read the conversation tree.
    PiGetTree,

    /// Pi: read forkable entries.
    PiGetForkable,

    /// Pi: read session statistics.
    PiGetStats,

    /// Pi: read available models.
    PiGetModels,
}

impl ClientCommand {
    /// Every command tag this channel accepts, for `get_supported_commands`.
    #[must_use]
    pub const fn supported() -> &'static [&'static str] {
        &[
            "user_message",
            "permission_response",
            "cancel",
            "interrupt",
            "set_permission_mode",
            "set_model",
            "set_thinking_tokens",
            "rewind_files",
            "get_mcp_status",
            "set_mcp_servers",
            "get_account_info",
            "get_supported_models",
            "get_supported_commands",
            "update_config",
            "pi_steer",
            "pi_follow_up",
            "pi_compact",
            "pi_fork",
            "pi_navigate",
            "pi_set_model",
            "pi_cycle_model",
            "pi_set_thinking_level",
            "pi_cycle_thinking",
            "pi_new_session",
            "pi_get_tree",
            "pi_get_forkable",
            "pi_get_stats",
            "pi_get_models",
        ]
    }
}

/// Non-event frames the server sends on the frame channel. Session events
/// are serialized directly with their own `type` tags.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Successful command result.
    Result {
        /// Result payload, when the command returns data.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Framed error; the connection stays open.
    Error {
        /// Error code (JSON-RPC flavoured).
        code: i64,
        /// Human-readable description.
        message: String,
    },

    /// Replay of the last persisted state, sent once on (re)connect before
    /// live events.
    Replay {
        /// Current runtime status.
        status: StatusSnapshot,
        /// Most recent persisted message, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<Message>,
    },
}

impl ServerFrame {
    /// An error frame.
    #[must_use]
    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// A bare success.
    #[must_use]
    pub const fn ok() -> Self {
        Self::Result { data: None }
    }

    /// A success carrying data.
    #[must_use]
    pub const fn result(data: Value) -> Self {
        Self::Result { data: Some(data) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_parses() {
        let command: ClientCommand =
            serde_json::from_str(r#"{"type":"user_message","content":"hi"}"#).unwrap();
        match command {
            ClientCommand::UserMessage { content, images } => {
                assert_eq!(content, "hi");
                assert!(images.is_empty());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_permission_response_wire_names() {
        let command: ClientCommand = serde_json::from_str(
            r#"{"type":"permission_response","toolCallId":"t1","optionId":"allow_once"}"#,
        )
        .unwrap();
        match command {
            ClientCommand::PermissionResponse {
                tool_call_id,
                option_id,
                answers,
            } => {
                assert_eq!(tool_call_id, "t1");
                assert_eq!(option_id.as_deref(), Some("allow_once"));
                assert!(answers.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let result =
            serde_json::from_str::<ClientCommand>(r#"{"type":"frobnicate","content":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_pi_family_parses() {
        let command: ClientCommand =
            serde_json::from_str(r#"{"type":"pi_fork","entryId":"e7"}"#).unwrap();
        assert!(matches!(command, ClientCommand::PiFork { .. }));

        let command: ClientCommand =
            serde_json::from_str(r#"{"type":"pi_cycle_thinking"}"#).unwrap();
        assert!(matches!(command, ClientCommand::PiCycleThinking));
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = ServerFrame::error(ERR_FRAME_TOO_LARGE, "frame of 2048 bytes exceeds limit");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], -32000);
        assert!(
            value["message"]
                .as_str()
                .unwrap()
                .contains("exceeds")
        );
    }

    #[test]
    fn test_supported_commands_covers_every_variant() {
        // Spot checks; the full list is asserted against dispatch in the ws
        // tests.
        let supported = ClientCommand::supported();
        assert!(supported.contains(&"user_message"));
        assert!(supported.contains(&"pi_get_models"));
        assert_eq!(supported.len(), 28);
    }
}
