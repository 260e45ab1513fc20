//! State Deltas
//!
//! Structural diff and apply over `serde_json::Value`. Objects are diffed
//! key by key at any depth; every other value (arrays included) is replaced
//! wholesale when it changes.
//!
//! The differ is a trait so a host can swap the strategy; the delta format
//! and its `apply` are fixed because both peers must agree on them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// An incremental change to a JSON value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Delta {
    /// Replace the value at this position.
    Replace(Value),
    /// Apply nested changes to the fields of an object.
    Fields(BTreeMap<String, Delta>),
    /// Remove this field from its parent object.
    Remove,
}

/// Patch application errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    /// A field delta targeted a value that is not an object.
    #[error("patch expects an object at '{path}'")]
    NotAnObject {
        /// Slash-separated path of the offending value.
        path: String,
    },
    /// A nested delta targeted a field the replica does not have.
    #[error("patch targets missing field '{path}'")]
    MissingField {
        /// Slash-separated path of the missing field.
        path: String,
    },
    /// `Remove` used outside of a field map.
    #[error("remove is only valid for object fields (at '{path}')")]
    RemoveRoot {
        /// Slash-separated path of the offending delta.
        path: String,
    },
}

impl Delta {
    /// Apply this delta to `target` in place.
    ///
    /// On error `target` may be partially modified; callers apply to a
    /// scratch copy and discard it on failure.
    pub fn apply(&self, target: &mut Value) -> Result<(), PatchError> {
        self.apply_at(target, "")
    }

    fn apply_at(&self, target: &mut Value, path: &str) -> Result<(), PatchError> {
        match self {
            Delta::Replace(value) => {
                *target = value.clone();
                Ok(())
            }
            Delta::Remove => Err(PatchError::RemoveRoot { path: display_path(path) }),
            Delta::Fields(fields) => {
                let map = target
                    .as_object_mut()
                    .ok_or_else(|| PatchError::NotAnObject { path: display_path(path) })?;

                for (key, change) in fields {
                    let child_path = format!("{}/{}", path, key);
                    match change {
                        Delta::Remove => {
                            map.remove(key);
                        }
                        Delta::Replace(value) => {
                            map.insert(key.clone(), value.clone());
                        }
                        Delta::Fields(_) => {
                            let child = map
                                .get_mut(key)
                                .ok_or_else(|| PatchError::MissingField { path: child_path.clone() })?;
                            change.apply_at(child, &child_path)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Number of leaf changes carried by this delta.
    pub fn change_count(&self) -> usize {
        match self {
            Delta::Replace(_) | Delta::Remove => 1,
            Delta::Fields(fields) => fields.values().map(Delta::change_count).sum(),
        }
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

/// Strategy for computing deltas between two states.
pub trait Differ: Send + Sync {
    /// Delta turning `previous` into `next`, or `None` when they are equal.
    fn diff(&self, previous: &Value, next: &Value) -> Option<Delta>;
}

/// Recursive per-field diff.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralDiff;

impl Differ for StructuralDiff {
    fn diff(&self, previous: &Value, next: &Value) -> Option<Delta> {
        diff_values(previous, next)
    }
}

/// Whole-state replacement on every change.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotDiff;

impl Differ for SnapshotDiff {
    fn diff(&self, previous: &Value, next: &Value) -> Option<Delta> {
        if previous == next {
            None
        } else {
            Some(Delta::Replace(next.clone()))
        }
    }
}

fn diff_values(previous: &Value, next: &Value) -> Option<Delta> {
    if previous == next {
        return None;
    }

    match (previous, next) {
        (Value::Object(prev), Value::Object(new)) => {
            let mut fields = BTreeMap::new();

            for (key, old_value) in prev {
                match new.get(key) {
                    None => {
                        fields.insert(key.clone(), Delta::Remove);
                    }
                    Some(new_value) => {
                        if let Some(change) = diff_values(old_value, new_value) {
                            fields.insert(key.clone(), change);
                        }
                    }
                }
            }

            for (key, new_value) in new {
                if !prev.contains_key(key) {
                    fields.insert(key.clone(), Delta::Replace(new_value.clone()));
                }
            }

            Some(Delta::Fields(fields))
        }
        _ => Some(Delta::Replace(next.clone())),
    }
}

// =============================================================================
// TESTS
// =============================================================================
