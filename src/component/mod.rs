//! Shared components.
//!
//! Declarations (descriptors, guards, hooks), the per-player connection
//! state machine, live components and the store that hosts them.

pub mod connection;
pub mod descriptor;
pub mod guard;
pub mod hooks;
pub mod shared;
pub mod store;

pub use connection::{ConnectionError, ConnectionRecord, ConnectionState, PlayerAction};
pub use descriptor::{ComponentDescriptor, DescriptorBuilder, RemoteKind, RemoteSpec, SyncScope};
pub use guard::ArgGuard;
pub use hooks::{ComponentHooks, DefaultHooks};
pub use shared::{DispatchError, Outbound, Recipients, RemoteError, SharedComponent};
pub use store::{ComponentHost, ComponentStore, HostError};
