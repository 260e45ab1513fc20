//! Core primitives.
//!
//! Identifiers, the atomic state cell, state deltas and state hashing.
//! Nothing here knows about players, transports or components.

pub mod atom;
pub mod hash;
pub mod ids;
pub mod patch;

// Re-export core types
pub use atom::{Listener, Selector, StateAtom, SubscriptionId};
pub use hash::{hash_state, state_hash_hex, StateHash};
pub use ids::{
    ComponentKey, ComponentTypeId, InstanceHandle, InstanceId, PlayerId, PointerId, TypeKey,
    NOT_FOUND_ID,
};
pub use patch::{Delta, Differ, PatchError, SnapshotDiff, StructuralDiff};
