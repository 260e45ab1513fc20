//! Component Registry
//!
//! Process-scoped, built once at startup and shared read-only by the
//! runtime of each side. Holds identifiers, pointer aliases and every
//! component descriptor.

pub mod identifier;
pub mod pointer;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::component::descriptor::ComponentDescriptor;
use crate::core::ids::{ComponentTypeId, PointerId, TypeKey};
use crate::network::protocol::ComponentReference;

pub use identifier::{IdentifierRegistry, PolymorphicIdChain, RegistryError};
pub use pointer::{PointerError, PointerTable};

/// Identifiers, pointers and descriptors of one process.
#[derive(Debug, Default)]
pub struct Registry {
    identifiers: IdentifierRegistry,
    pointers: PointerTable,
    descriptors: HashMap<ComponentTypeId, Arc<ComponentDescriptor>>,
}

impl Registry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Identifier table.
    pub fn identifiers(&self) -> &IdentifierRegistry {
        &self.identifiers
    }

    /// Pointer table.
    pub fn pointers(&self) -> &PointerTable {
        &self.pointers
    }

    /// Descriptor registered under `id`.
    pub fn descriptor(&self, id: &ComponentTypeId) -> Option<&Arc<ComponentDescriptor>> {
        self.descriptors.get(id)
    }

    /// Descriptor of marker type `key`.
    pub fn descriptor_for(&self, key: TypeKey) -> Option<&Arc<ComponentDescriptor>> {
        self.identifiers.id_of(key).and_then(|id| self.descriptors.get(id))
    }

    /// Polymorphic id chain of `key`.
    pub fn chain(&self, key: TypeKey) -> PolymorphicIdChain {
        self.identifiers.build_polymorphic_chain(key)
    }

    /// Network-level shared type of `key`.
    pub fn shared_type_of(&self, key: TypeKey) -> ComponentTypeId {
        self.identifiers.shared_type_id(key)
    }

    /// True if `id` is registered or appears in any registered chain.
    pub fn knows_id(&self, id: &ComponentTypeId) -> bool {
        self.identifiers.is_registered_id(id)
            || self
                .descriptors
                .values()
                .any(|d| self.identifiers.satisfies(d.type_key(), id))
    }

    /// Local descriptor to instantiate when the server announces `reference`.
    ///
    /// Tried in order: the pointer target, the exact identifier, then the
    /// single concrete local type addressed by the same shared type.
    pub fn mirror_for(&self, reference: &ComponentReference) -> Option<Arc<ComponentDescriptor>> {
        if let Some(pointer) = &reference.pointer_id {
            match self.pointers.target_of(pointer).and_then(|t| self.descriptors.get(t)) {
                Some(desc) if !desc.is_abstract() => return Some(Arc::clone(desc)),
                _ => debug!("Pointer {} has no concrete local target", pointer),
            }
        }

        if let Some(desc) = self.descriptors.get(&reference.identifier) {
            if !desc.is_abstract() {
                return Some(Arc::clone(desc));
            }
        }

        let candidates: Vec<&Arc<ComponentDescriptor>> = self
            .descriptors
            .values()
            .filter(|d| !d.is_abstract())
            .filter(|d| self.shared_type_of(d.type_key()) == reference.shared_identifier)
            .collect();

        match candidates.as_slice() {
            [only] => Some(Arc::clone(only)),
            [] => {
                debug!("No local component type mirrors {}", reference);
                None
            }
            many => {
                let ids: Vec<&str> = many.iter().map(|d| d.id().as_str()).collect();
                warn!("Ambiguous mirror for {}: {:?}", reference, ids);
                None
            }
        }
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// True if no descriptor is registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Builder for [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    /// Register a component descriptor and its declared ancestry.
    pub fn component(mut self, descriptor: Arc<ComponentDescriptor>) -> Self {
        let reg = &mut self.registry;
        let key = descriptor.type_key();

        if reg.identifiers.register_type(key, descriptor.id().clone()).is_err() {
            return self;
        }
        if let Some(parent) = descriptor.parent() {
            reg.identifiers.declare_parent(key, parent);
        }
        reg.identifiers.declare_implements(key, descriptor.implements.iter().cloned());
        if descriptor.shared_root {
            reg.identifiers.mark_shared_root(key);
        }
        reg.descriptors.insert(descriptor.id().clone(), descriptor);
        self
    }

    /// Declare a pointer alias.
    pub fn pointer(mut self, pointer: impl Into<PointerId>, target: impl Into<ComponentTypeId>) -> Self {
        // Conflicts are logged by the table.
        let _ = self.registry.pointers.declare(pointer.into(), target.into());
        self
    }

    /// Freeze the registry, computing every polymorphic chain once.
    pub fn build(self) -> Arc<Registry> {
        let registry = self.registry;
        for desc in registry.descriptors.values() {
            registry.identifiers.build_polymorphic_chain(desc.type_key());
        }
        Arc::new(registry)
    }
}
