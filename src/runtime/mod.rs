//! Runtimes.
//!
//! One process-scoped object per side: [`ServerRuntime`] owns the
//! authoritative components and routes client requests, [`ClientRuntime`]
//! owns the replicas and the calls in flight. Both are plain `&mut self`
//! state machines; transports drive them from async tasks.

pub mod client;
pub mod server;

use thiserror::Error;

use crate::component::connection::ConnectionError;
use crate::component::shared::{DispatchError, RemoteError};
use crate::core::ids::{ComponentKey, ComponentTypeId, PlayerId};

pub use client::{CallError, ClientRuntime, PendingCall, PendingConnection};
pub use server::{ServerRuntime, SessionPlayer};

/// Runtime errors raised to local callers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No descriptor under this id.
    #[error("unknown component type '{0}'")]
    UnknownType(ComponentTypeId),
    /// Abstract types are never instantiated.
    #[error("component type '{0}' is abstract")]
    AbstractType(ComponentTypeId),
    /// No live component under this key.
    #[error("no component {0}")]
    UnknownComponent(ComponentKey),
    /// The player already joined.
    #[error("player {0} already joined")]
    AlreadyJoined(PlayerId),
    /// State change failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Remote channel misuse.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Connection transition refused.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
