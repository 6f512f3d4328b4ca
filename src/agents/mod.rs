//! Agent backend abstraction and the SDK adapters.

/// Claude-family SDK adapter.
pub mod claude_sdk;
/// Session environment isolation.
pub mod env;
/// Scripted backend for tests.
pub mod mock;
/// Pi-family SDK adapter.
pub mod pi_sdk;
/// NDJSON subprocess transport and shared session driver.
pub mod process;
/// Backend traits and shared auth validation.
pub mod traits;

pub use claude_sdk::ClaudeSdkBackend;
pub use pi_sdk::PiSdkBackend;
pub use traits::{
    AgentBackend, AgentEvent, AuthContext, BackendSession, BackendSessionConfig, PromptOptions,
    Readiness, TreeQuery,
};
