//! Connection multiplexing: the HTTP surface, the bidirectional frame
//! channel, and the one-way event stream.

/// REST handlers and HTTP error mapping.
pub mod handlers;
/// Frame-channel wire types.
pub mod protocol;
/// Router assembly and the listener.
pub mod server;
/// One-way event stream (SSE).
pub mod sse;
/// Bidirectional frame channel (WebSocket).
pub mod ws;

pub use handlers::AppState;
pub use server::{build_router, serve};
