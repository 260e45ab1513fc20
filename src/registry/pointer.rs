//! Pointer Table
//!
//! A pointer is a named alias for a component type. A reference carrying a
//! pointer id is resolved through the pointer's target type on the receiving
//! side, which lets each peer map the alias to its own concrete type.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::warn;

use crate::core::ids::{ComponentTypeId, PointerId};

/// Pointer declaration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PointerError {
    /// The pointer already targets another type.
    #[error("pointer '{pointer}' already targets '{existing}'")]
    AlreadyDeclared {
        /// Pointer id.
        pointer: PointerId,
        /// Current target.
        existing: ComponentTypeId,
    },
}

/// Pointer id -> target component type.
#[derive(Debug, Clone, Default)]
pub struct PointerTable {
    pointers: BTreeMap<PointerId, ComponentTypeId>,
}

impl PointerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a pointer. Redeclaring with the same target is a no-op.
    pub fn declare(&mut self, pointer: PointerId, target: ComponentTypeId) -> Result<(), PointerError> {
        match self.pointers.get(&pointer) {
            Some(existing) if *existing == target => Ok(()),
            Some(existing) => {
                let err = PointerError::AlreadyDeclared {
                    pointer,
                    existing: existing.clone(),
                };
                warn!("{}", err);
                Err(err)
            }
            None => {
                self.pointers.insert(pointer, target);
                Ok(())
            }
        }
    }

    /// Target type of `pointer`.
    pub fn target_of(&self, pointer: &PointerId) -> Option<&ComponentTypeId> {
        self.pointers.get(pointer)
    }

    /// Number of declared pointers.
    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    /// True if no pointer is declared.
    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }
}
