//! Core session management and domain types.

/// Error taxonomy for the core subsystems.
pub mod errors;
/// Session event taxonomy (live fan-out + audit form).
pub mod events;
/// Session lifecycle manager.
pub mod manager;
/// Per-session runtime and state machine.
pub mod runtime;
/// Domain types: sessions, auth, messages, permissions.
pub mod session;

pub use events::{SessionEvent, SessionEventKind, StatusSnapshot, StoredEvent};
pub use manager::{ConnectOutcome, ManagerSettings, SessionManager};
pub use runtime::{RuntimeOptions, SessionRuntime};
pub use session::{
    AgentKind, ApiKeyRef, AuthMode, ContentBlock, ImageAttachment, Message, MessageContent,
    MessageRole, PendingPermission, PermissionOption, ProviderKey, Session, SessionAuth,
    SessionConfig, SessionStatus,
};
