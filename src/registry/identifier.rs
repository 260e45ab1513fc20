//! Identifier Registry
//!
//! Maps component marker types to their declared string ids and answers
//! polymorphic queries ("which ids does this type satisfy?"). Ancestry is
//! declared explicitly; nothing is inferred from Rust types.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::warn;

use crate::core::ids::{ComponentTypeId, TypeKey};

/// Ordered ids a type satisfies: itself, registered ancestors, then
/// declared `implements` ids.
pub type PolymorphicIdChain = Arc<[ComponentTypeId]>;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The type is already registered under another id.
    #[error("type {type_name} already registered as '{existing}', refusing '{requested}'")]
    ConflictingId {
        /// Marker type name.
        type_name: &'static str,
        /// Id it was registered with first.
        existing: ComponentTypeId,
        /// Id of the rejected registration.
        requested: ComponentTypeId,
    },
    /// Another type already owns the id.
    #[error("id '{id}' already belongs to type {owner}")]
    IdTaken {
        /// The contested id.
        id: ComponentTypeId,
        /// Marker type name of the current owner.
        owner: &'static str,
    },
}

#[derive(Debug)]
struct TypeRecord {
    id: ComponentTypeId,
    chain: OnceLock<PolymorphicIdChain>,
}

/// The identifier registry.
#[derive(Debug, Default)]
pub struct IdentifierRegistry {
    types: HashMap<TypeKey, TypeRecord>,
    by_id: HashMap<ComponentTypeId, TypeKey>,
    parents: HashMap<TypeKey, TypeKey>,
    implements: HashMap<TypeKey, Vec<ComponentTypeId>>,
    shared_roots: HashSet<TypeKey>,
}

impl IdentifierRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key`'s own id. Re-registering with the same id is a no-op.
    pub fn register_type(&mut self, key: TypeKey, id: ComponentTypeId) -> Result<(), RegistryError> {
        if let Some(record) = self.types.get(&key) {
            if record.id == id {
                return Ok(());
            }
            let err = RegistryError::ConflictingId {
                type_name: key.name(),
                existing: record.id.clone(),
                requested: id,
            };
            warn!("{}", err);
            return Err(err);
        }

        if let Some(owner) = self.by_id.get(&id) {
            let err = RegistryError::IdTaken { id, owner: owner.name() };
            warn!("{}", err);
            return Err(err);
        }

        self.by_id.insert(id.clone(), key);
        self.types.insert(key, TypeRecord { id, chain: OnceLock::new() });
        self.invalidate_chains();
        Ok(())
    }

    /// Declare `parent` as the direct ancestor of `child`.
    pub fn declare_parent(&mut self, child: TypeKey, parent: TypeKey) {
        if let Some(existing) = self.parents.insert(child, parent) {
            if existing != parent {
                warn!("Parent of {} changed from {} to {}", child, existing, parent);
            }
        }
        self.invalidate_chains();
    }

    /// Declare extra ids `key` satisfies.
    pub fn declare_implements(&mut self, key: TypeKey, ids: impl IntoIterator<Item = ComponentTypeId>) {
        let entry = self.implements.entry(key).or_default();
        for id in ids {
            if !entry.contains(&id) {
                entry.push(id);
            }
        }
        self.invalidate_chains();
    }

    /// Mark `key` as the shared root its descendants are addressed by.
    pub fn mark_shared_root(&mut self, key: TypeKey) {
        self.shared_roots.insert(key);
        self.invalidate_chains();
    }

    fn invalidate_chains(&mut self) {
        for record in self.types.values_mut() {
            record.chain = OnceLock::new();
        }
    }

    /// Declared id of `key`, or the `"Not found id"` sentinel.
    pub fn resolve_id(&self, key: TypeKey) -> ComponentTypeId {
        match self.types.get(&key) {
            Some(record) => record.id.clone(),
            None => {
                warn!("Type {} has no registered identifier", key);
                ComponentTypeId::not_found()
            }
        }
    }

    /// Declared id of `key`, without logging.
    pub fn id_of(&self, key: TypeKey) -> Option<&ComponentTypeId> {
        self.types.get(&key).map(|r| &r.id)
    }

    /// True if some type is registered under `id`.
    pub fn is_registered_id(&self, id: &ComponentTypeId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Marker type registered under `id`.
    pub fn type_for_id(&self, id: &ComponentTypeId) -> Option<TypeKey> {
        self.by_id.get(id).copied()
    }

    /// Declared parent of `key`.
    pub fn parent_of(&self, key: TypeKey) -> Option<TypeKey> {
        self.parents.get(&key).copied()
    }

    /// `key` followed by its declared ancestors, nearest first.
    fn ancestry(&self, key: TypeKey) -> Vec<TypeKey> {
        let mut line = vec![key];
        let mut seen: HashSet<TypeKey> = HashSet::from([key]);
        let mut cursor = key;

        while let Some(parent) = self.parents.get(&cursor).copied() {
            if !seen.insert(parent) {
                warn!("Ancestry cycle detected at {}", parent);
                break;
            }
            line.push(parent);
            cursor = parent;
        }
        line
    }

    fn compute_chain(&self, key: TypeKey) -> PolymorphicIdChain {
        let line = self.ancestry(key);
        let mut chain: Vec<ComponentTypeId> = Vec::new();

        for ancestor in &line {
            if let Some(id) = self.id_of(*ancestor) {
                if !chain.contains(id) {
                    chain.push(id.clone());
                }
            }
        }
        for ancestor in &line {
            for id in self.implements.get(ancestor).into_iter().flatten() {
                if !chain.contains(id) {
                    chain.push(id.clone());
                }
            }
        }

        chain.into()
    }

    /// Polymorphic id chain of `key`. Cached for registered types.
    pub fn build_polymorphic_chain(&self, key: TypeKey) -> PolymorphicIdChain {
        match self.types.get(&key) {
            Some(record) => Arc::clone(record.chain.get_or_init(|| self.compute_chain(key))),
            None => self.compute_chain(key),
        }
    }

    /// True if `key` satisfies `id`.
    pub fn satisfies(&self, key: TypeKey, id: &ComponentTypeId) -> bool {
        self.build_polymorphic_chain(key).iter().any(|c| c == id)
    }

    /// The id `key` is addressed by on the network: the nearest ancestor
    /// marked as a shared root, otherwise the most distant registered one.
    pub fn shared_type_id(&self, key: TypeKey) -> ComponentTypeId {
        let line = self.ancestry(key);

        if let Some(root) = line.iter().find(|k| self.shared_roots.contains(k)) {
            return self.resolve_id(*root);
        }

        line.iter()
            .rev()
            .find_map(|k| self.id_of(*k).cloned())
            .unwrap_or_else(|| {
                warn!("Type {} has no registered ancestry", key);
                ComponentTypeId::not_found()
            })
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================
