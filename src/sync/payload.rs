//! Sync Payloads
//!
//! A frame is one step of a replica's history: a full `init` snapshot or a
//! `patch` against the previous frame. `epoch` counts hydrations of one
//! (component, player) pair; `seq` orders frames within an epoch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::patch::Delta;

/// Full state or incremental delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchPayload {
    /// Replace the replica wholesale.
    Init {
        /// Entire (redacted) state.
        state: Value,
    },
    /// Merge a delta into the replica.
    Patch {
        /// Change since the previous frame.
        delta: Delta,
    },
}

impl PatchPayload {
    /// True for `init`.
    pub fn is_init(&self) -> bool {
        matches!(self, PatchPayload::Init { .. })
    }
}

/// One sync frame for one observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFrame {
    /// Hydration counter of this observer.
    pub epoch: u32,
    /// Position within the epoch; the init is 0.
    pub seq: u64,
    /// Init or patch.
    pub payload: PatchPayload,
    /// Hex SHA-256 of the state after applying this frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
}
