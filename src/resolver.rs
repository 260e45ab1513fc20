//! Component Resolution
//!
//! Maps a wire-level [`ComponentReference`] to one live local component.
//! Strict priority, first success wins:
//!
//! 1. pointer alias, via its local target type;
//! 2. the concrete identifier, if registered on this side;
//! 3. the shared type: exactly one match, never a guess among several.
//!
//! Failures are values, never panics. Callers log and drop the message.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::addressing::{AddressBook, InstanceAllocator};
use crate::component::store::ComponentHost;
use crate::core::ids::{ComponentKey, ComponentTypeId, InstanceHandle, InstanceId, PointerId};
use crate::network::protocol::ComponentReference;
use crate::registry::Registry;

/// Why a reference did not resolve.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The reference carries no instance id.
    #[error("reference has no instance id")]
    MissingInstanceId,
    /// The shared type is not registered on this side.
    #[error("unknown shared type '{0}'")]
    UnknownSharedType(ComponentTypeId),
    /// No instance answers to the id.
    #[error("no instance for id {0}")]
    UnknownInstance(InstanceId),
    /// The pointer has no local target.
    #[error("pointer '{0}' has no local target")]
    UnknownPointer(PointerId),
    /// The pointer target lookup failed.
    #[error("pointer '{pointer}' lookup failed: {reason}")]
    PointerLookup {
        /// Pointer used.
        pointer: PointerId,
        /// Host error.
        reason: String,
    },
    /// No component matched.
    #[error("no component matches on {0}")]
    NotFound(InstanceHandle),
    /// Several components matched the shared type.
    #[error("{count} components of shared type '{shared}' on {instance}")]
    Ambiguous {
        /// Instance searched.
        instance: InstanceHandle,
        /// Shared type looked up.
        shared: ComponentTypeId,
        /// Matches found.
        count: usize,
    },
}

/// Maps instance ids to local instances.
pub trait InstanceDirectory {
    /// Local instance named by `id`, if known.
    fn instance_of(&self, id: &InstanceId) -> Option<InstanceHandle>;
}

impl InstanceDirectory for InstanceAllocator {
    fn instance_of(&self, id: &InstanceId) -> Option<InstanceHandle> {
        self.resolve(id)
    }
}

impl InstanceDirectory for AddressBook {
    fn instance_of(&self, id: &InstanceId) -> Option<InstanceHandle> {
        AddressBook::instance_of(self, id)
    }
}

/// Reference-to-component resolver of one side.
#[derive(Debug, Clone)]
pub struct ComponentResolver {
    registry: Arc<Registry>,
}

impl ComponentResolver {
    /// Resolver over `registry`.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Resolve `reference`, logging failures.
    pub fn resolve(
        &self,
        reference: &ComponentReference,
        directory: &dyn InstanceDirectory,
        host: &dyn ComponentHost,
    ) -> Result<ComponentKey, ResolveError> {
        self.resolve_with(reference, directory, host, false)
    }

    /// Resolve `reference`; `quiet` suppresses the "nothing found" warning.
    pub fn resolve_with(
        &self,
        reference: &ComponentReference,
        directory: &dyn InstanceDirectory,
        host: &dyn ComponentHost,
        quiet: bool,
    ) -> Result<ComponentKey, ResolveError> {
        let ids = self.registry.identifiers();
        if !self.registry.knows_id(&reference.shared_identifier) {
            warn!("Cannot resolve {}: unknown shared type", reference);
            return Err(ResolveError::UnknownSharedType(reference.shared_identifier.clone()));
        }

        if reference.instance_id.is_empty() {
            warn!("Cannot resolve {}: empty instance id", reference);
            return Err(ResolveError::MissingInstanceId);
        }

        let instance = directory.instance_of(&reference.instance_id).ok_or_else(|| {
            if !quiet {
                warn!("Cannot resolve {}: unknown instance id", reference);
            }
            ResolveError::UnknownInstance(reference.instance_id.clone())
        })?;

        if let Some(pointer) = &reference.pointer_id {
            return self.resolve_pointer(reference, pointer, instance, host);
        }

        if ids.is_registered_id(&reference.identifier) {
            match host.get_component(instance, &reference.identifier) {
                Ok(Some(key)) => return Ok(key),
                Ok(None) => {}
                Err(err) => debug!("Identifier lookup for {} failed: {}", reference, err),
            }
        }

        let found = host.get_components(instance, &reference.shared_identifier);
        match found.as_slice() {
            [key] => Ok(*key),
            [] => {
                if !quiet {
                    warn!("Cannot resolve {}: no component on {}", reference, instance);
                }
                Err(ResolveError::NotFound(instance))
            }
            many => {
                error!(
                    "Ambiguous reference {}: {} components share '{}' on {}",
                    reference,
                    many.len(),
                    reference.shared_identifier,
                    instance
                );
                Err(ResolveError::Ambiguous {
                    instance,
                    shared: reference.shared_identifier.clone(),
                    count: many.len(),
                })
            }
        }
    }

    fn resolve_pointer(
        &self,
        reference: &ComponentReference,
        pointer: &PointerId,
        instance: InstanceHandle,
        host: &dyn ComponentHost,
    ) -> Result<ComponentKey, ResolveError> {
        let target = self.registry.pointers().target_of(pointer).ok_or_else(|| {
            warn!("Cannot resolve {}: pointer has no local target", reference);
            ResolveError::UnknownPointer(pointer.clone())
        })?;

        let key = match host.get_component(instance, target) {
            Ok(Some(key)) => key,
            Ok(None) => {
                warn!("Cannot resolve {}: pointer target '{}' not on {}", reference, target, instance);
                return Err(ResolveError::NotFound(instance));
            }
            Err(err) => {
                warn!("Cannot resolve {}: {}", reference, err);
                return Err(ResolveError::PointerLookup {
                    pointer: pointer.clone(),
                    reason: err.to_string(),
                });
            }
        };

        if self.registry.identifiers().is_registered_id(&reference.identifier) {
            if let Ok(Some(direct)) = host.get_component(instance, &reference.identifier) {
                if direct != key {
                    warn!(
                        "Pointer '{}' and identifier '{}' disagree on {}; using the pointer",
                        pointer, reference.identifier, instance
                    );
                }
            }
        }
        Ok(key)
    }
}
