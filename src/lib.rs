//! # Shared Components
//!
//! Server-authoritative state replication for game components. A component
//! declared once is instantiated on the server and mirrored on every client;
//! the server pushes per-player state patches and answers component-scoped
//! remote calls.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     SHARED COMPONENTS                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  core/           - Ids, state atom, diffing, state hashing    │
//! │  registry/       - Type identifiers, polymorphic chains,      │
//! │                    pointer aliases                            │
//! │  component/      - Descriptors, guards, hooks, connections,   │
//! │                    the shared component itself, the store     │
//! │  sync/           - Sync frames, per-observer server syncer,   │
//! │                    client receiver                            │
//! │  addressing/     - Instance id allocation and lookup          │
//! │  resolver.rs     - Wire reference to local component          │
//! │  runtime/        - Server and client state machines           │
//! │                                                               │
//! │  network/        - Transport (I/O only)                       │
//! │  ├── protocol.rs - Message types                              │
//! │  ├── auth.rs     - JWT validation                             │
//! │  ├── server.rs   - WebSocket server                           │
//! │  └── client.rs   - WebSocket client connector                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority
//!
//! Only the server mutates state. Clients read replicas, request changes
//! through remote functions and events, and re-hydrate whenever a frame
//! cannot be applied cleanly. The runtimes are synchronous `&mut self`
//! state machines; tokio appears only at the waits and in the transports.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod addressing;
pub mod component;
pub mod config;
pub mod core;
pub mod network;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod sync;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use component::descriptor::{ComponentDescriptor, SyncScope};
pub use component::hooks::ComponentHooks;
pub use component::shared::{Recipients, SharedComponent};
pub use config::RuntimeConfig;
pub use core::ids::{ComponentKey, ComponentTypeId, InstanceHandle, InstanceId, PlayerId};
pub use network::protocol::{ComponentReference, RemoteOutcome};
pub use registry::Registry;
pub use runtime::{CallError, ClientRuntime, RuntimeError, ServerRuntime};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
