//! Network Layer
//!
//! Wire messages, token authentication and the WebSocket transports that
//! feed the runtimes. Everything here is I/O; component semantics live in
//! `component/` and `runtime/`.

pub mod auth;
pub mod client;
pub mod protocol;
pub mod server;

pub use auth::{authenticate, validate_token, AuthConfig, AuthError, TokenClaims};
pub use client::{connect, ClientConnection, ConnectError};
pub use protocol::{ClientMessage, ComponentReference, RemoteOutcome, ServerMessage};
pub use server::{ReplicationServer, ReplicationServerError, ServerConfig};
