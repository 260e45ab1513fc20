//! Component Store
//!
//! Live components of one side, indexed by key and by instance. The store
//! is the default [`ComponentHost`]: the lookup seam the resolver uses to
//! find components on an instance by any id in their polymorphic chain.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::component::shared::SharedComponent;
use crate::core::ids::{ComponentKey, ComponentTypeId, InstanceHandle};
use crate::registry::Registry;

/// Host lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// More than one component satisfies the id.
    #[error("{count} components on {instance} satisfy '{id}'")]
    Ambiguous {
        /// Instance searched.
        instance: InstanceHandle,
        /// Id looked up.
        id: ComponentTypeId,
        /// Matches found.
        count: usize,
    },
}

/// Component lookup on host instances.
pub trait ComponentHost {
    /// Every component on `instance` whose polymorphic chain contains `id`.
    fn get_components(&self, instance: InstanceHandle, id: &ComponentTypeId) -> Vec<ComponentKey>;

    /// The component on `instance` satisfying `id`; an error if several do.
    fn get_component(
        &self,
        instance: InstanceHandle,
        id: &ComponentTypeId,
    ) -> Result<Option<ComponentKey>, HostError> {
        let found = self.get_components(instance, id);
        match found.as_slice() {
            [] => Ok(None),
            [key] => Ok(Some(*key)),
            many => Err(HostError::Ambiguous {
                instance,
                id: id.clone(),
                count: many.len(),
            }),
        }
    }
}

/// Live components of one runtime.
#[derive(Debug)]
pub struct ComponentStore {
    registry: Arc<Registry>,
    components: BTreeMap<ComponentKey, SharedComponent>,
    by_instance: BTreeMap<InstanceHandle, Vec<ComponentKey>>,
    next_key: u64,
}

impl ComponentStore {
    /// An empty store over `registry`.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            components: BTreeMap::new(),
            by_instance: BTreeMap::new(),
            next_key: 1,
        }
    }

    /// Registry the store resolves chains with.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Reserve a key for a component about to be inserted.
    pub fn next_key(&mut self) -> ComponentKey {
        let key = ComponentKey(self.next_key);
        self.next_key += 1;
        key
    }

    /// Add a component under its own key.
    pub fn insert(&mut self, component: SharedComponent) {
        let key = component.key();
        self.by_instance.entry(component.instance()).or_default().push(key);
        self.components.insert(key, component);
    }

    /// Remove a component.
    pub fn remove(&mut self, key: ComponentKey) -> Option<SharedComponent> {
        let component = self.components.remove(&key)?;
        if let Some(keys) = self.by_instance.get_mut(&component.instance()) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                self.by_instance.remove(&component.instance());
            }
        }
        Some(component)
    }

    /// Component by key.
    pub fn get(&self, key: ComponentKey) -> Option<&SharedComponent> {
        self.components.get(&key)
    }

    /// Mutable component by key.
    pub fn get_mut(&mut self, key: ComponentKey) -> Option<&mut SharedComponent> {
        self.components.get_mut(&key)
    }

    /// Keys of the components on `instance`, in insertion order.
    pub fn on_instance(&self, instance: InstanceHandle) -> &[ComponentKey] {
        self.by_instance.get(&instance).map_or(&[], Vec::as_slice)
    }

    /// Every component key.
    pub fn keys(&self) -> Vec<ComponentKey> {
        self.components.keys().copied().collect()
    }

    /// Every component.
    pub fn iter(&self) -> impl Iterator<Item = &SharedComponent> {
        self.components.values()
    }

    /// Every component, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SharedComponent> {
        self.components.values_mut()
    }

    /// Number of live components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// True if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl ComponentHost for ComponentStore {
    fn get_components(&self, instance: InstanceHandle, id: &ComponentTypeId) -> Vec<ComponentKey> {
        self.on_instance(instance)
            .iter()
            .copied()
            .filter(|key| {
                self.components.get(key).map_or(false, |c| {
                    self.registry.identifiers().satisfies(c.descriptor().type_key(), id)
                })
            })
            .collect()
    }
}
