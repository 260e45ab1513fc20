//! Protocol Messages
//!
//! Wire format for client-server communication. Messages are serialized as
//! JSON; component state travels as `serde_json::Value`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::component::connection::PlayerAction;
use crate::core::ids::{ComponentTypeId, InstanceHandle, InstanceId, PointerId};
use crate::sync::payload::SyncFrame;

/// Sentinel reply when a remote function's guard rejects the arguments.
pub const ACTION_GUARD_FAILED: &str = "__ACTION_GUARD_FAILED";

/// Sentinel reply when the caller is not connected to the component.
pub const NOT_CONNECTED: &str = "__PLAYER_NOT_CONNECTED";

// =============================================================================
// COMPONENT REFERENCE
// =============================================================================

/// Wire-level address of a component instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentReference {
    /// Instance the component is attached to.
    pub instance_id: InstanceId,
    /// Concrete type id on the sending side.
    pub identifier: ComponentTypeId,
    /// Shared type both sides agree on.
    pub shared_identifier: ComponentTypeId,
    /// Optional pointer alias, resolved first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer_id: Option<PointerId>,
}

impl fmt::Display for ComponentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[instance: {}, identifier: {}, shared: {}",
            self.instance_id, self.identifier, self.shared_identifier
        )?;
        if let Some(pointer) = &self.pointer_id {
            write!(f, ", pointer: {}", pointer)?;
        }
        f.write_str("]")
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server. Only valid as the first message.
    Auth(AuthRequest),

    /// Ask for (re-)hydration of one component.
    Start {
        /// Target component.
        reference: ComponentReference,
    },

    /// Ask the server for the id of an instance.
    GetInstanceId {
        /// Correlates the reply.
        request_id: u64,
        /// Instance to look up.
        instance: InstanceHandle,
        /// Shared type the id is keyed by.
        metadata: ComponentTypeId,
    },

    /// Fire a client-to-server event.
    RemoteEvent {
        /// Target component.
        reference: ComponentReference,
        /// Channel name.
        name: String,
        /// Event arguments.
        args: Vec<Value>,
    },

    /// Invoke a remote function.
    RemoteFunction {
        /// Correlates the reply.
        request_id: u64,
        /// Target component.
        reference: ComponentReference,
        /// Channel name.
        name: String,
        /// Call arguments.
        args: Vec<Value>,
    },

    /// Connect to or disconnect from a component.
    ConnectionRequest {
        /// Correlates the reply.
        request_id: u64,
        /// Target component.
        reference: ComponentReference,
        /// Requested transition.
        action: PlayerAction,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp (ms).
        timestamp: u64,
    },
}

/// Authentication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Authentication token (JWT). Empty for anonymous sessions.
    #[serde(default)]
    pub token: String,
    /// Client version for compatibility check.
    pub client_version: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// State sync frame for one component.
    Dispatch {
        /// Source component.
        reference: ComponentReference,
        /// Init or patch.
        frame: SyncFrame,
    },

    /// An instance became addressable.
    ReceiveInstanceId {
        /// Instance handle.
        instance: InstanceHandle,
        /// Shared type the id is keyed by.
        metadata: ComponentTypeId,
        /// Allocated id.
        id: InstanceId,
    },

    /// Reply to `GetInstanceId`. `None` means not allocated yet.
    InstanceIdResponse {
        /// Request being answered.
        request_id: u64,
        /// The id, if allocated.
        id: Option<InstanceId>,
    },

    /// A server-to-client event.
    RemoteEvent {
        /// Source component.
        reference: ComponentReference,
        /// Channel name.
        name: String,
        /// Event arguments.
        args: Vec<Value>,
    },

    /// Reply to `RemoteFunction`.
    FunctionResponse {
        /// Request being answered.
        request_id: u64,
        /// Handler result or sentinel.
        outcome: RemoteOutcome,
    },

    /// Reply to `ConnectionRequest`.
    ConnectionResponse {
        /// Request being answered.
        request_id: u64,
        /// Whether the transition happened.
        success: bool,
        /// Instance id on success, empty otherwise.
        instance_id: String,
    },

    /// The server dropped this player's connection to a component.
    Disconnected {
        /// Component that disconnected.
        reference: ComponentReference,
    },

    /// A component was added to or removed from an instance.
    ComponentInteraction {
        /// Component concerned.
        reference: ComponentReference,
        /// Instance it lives on.
        instance: InstanceHandle,
        /// Add or remove.
        interaction: Interaction,
    },

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time (ms).
        server_time: u64,
    },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Why.
        reason: String,
    },
}

/// Authentication result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Assigned player id (UUID string) if successful.
    pub player_id: Option<String>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Component lifecycle announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interaction {
    /// Mirror the component locally.
    Add,
    /// Drop the local mirror.
    Remove,
}

/// Result of a remote function call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value")]
pub enum RemoteOutcome {
    /// The handler ran and returned this value.
    #[serde(rename = "ok")]
    Ok(Value),
    /// The argument guard rejected the call.
    #[serde(rename = "__ACTION_GUARD_FAILED")]
    GuardFailed,
    /// The caller is not connected to the component.
    #[serde(rename = "__PLAYER_NOT_CONNECTED")]
    NotConnected,
    /// The reference did not resolve to a live component.
    #[serde(rename = "unresolved")]
    Unresolved,
}

impl RemoteOutcome {
    /// The sentinel string of a rejected call, if any.
    pub fn sentinel(&self) -> Option<&'static str> {
        match self {
            RemoteOutcome::GuardFailed => Some(ACTION_GUARD_FAILED),
            RemoteOutcome::NotConnected => Some(NOT_CONNECTED),
            _ => None,
        }
    }
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// Malformed message.
    InvalidMessage,
    /// Server is full.
    ServerFull,
    /// Internal server error.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl ServerMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// =============================================================================
// TESTS
// =============================================================================
