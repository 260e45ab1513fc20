//! Instance Id Allocation
//!
//! The server is the only authority that mints instance ids. One id names
//! one (instance, shared type) pair; the reverse map lets inbound references
//! find their instance. Every fresh id is announced exactly once on the
//! addressable channel.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::core::ids::{ComponentTypeId, InstanceHandle, InstanceId};

const NOTIFY_CAPACITY: usize = 256;

/// "Instance became addressable" notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addressable {
    /// Instance handle.
    pub instance: InstanceHandle,
    /// Shared type the id is keyed by.
    pub metadata: ComponentTypeId,
    /// Allocated id.
    pub id: InstanceId,
}

/// Result of [`InstanceAllocator::allocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The id of the pair.
    pub id: InstanceId,
    /// True if this call minted it.
    pub fresh: bool,
}

/// Server-side instance id table.
#[derive(Debug)]
pub struct InstanceAllocator {
    ids: BTreeMap<(InstanceHandle, ComponentTypeId), InstanceId>,
    owners: HashMap<InstanceId, (InstanceHandle, ComponentTypeId)>,
    notify: broadcast::Sender<Addressable>,
}

impl InstanceAllocator {
    /// An empty table.
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            ids: BTreeMap::new(),
            owners: HashMap::new(),
            notify,
        }
    }

    /// Id of (`instance`, `metadata`), minting a GUID on first use.
    pub fn allocate(&mut self, instance: InstanceHandle, metadata: &ComponentTypeId) -> Allocation {
        let key = (instance, metadata.clone());
        if let Some(id) = self.ids.get(&key) {
            return Allocation { id: id.clone(), fresh: false };
        }

        let id = InstanceId::generate();
        self.ids.insert(key.clone(), id.clone());
        self.owners.insert(id.clone(), key);
        info!("Allocated id {} for {} ({})", id, instance, metadata);

        // No subscribers is fine.
        let _ = self.notify.send(Addressable {
            instance,
            metadata: metadata.clone(),
            id: id.clone(),
        });
        Allocation { id, fresh: true }
    }

    /// Existing id of (`instance`, `metadata`). `None` means "not yet".
    pub fn lookup(&self, instance: InstanceHandle, metadata: &ComponentTypeId) -> Option<&InstanceId> {
        self.ids.get(&(instance, metadata.clone()))
    }

    /// Instance named by `id`.
    pub fn resolve(&self, id: &InstanceId) -> Option<InstanceHandle> {
        self.owners.get(id).map(|(instance, _)| *instance)
    }

    /// Invalidate the id of (`instance`, `metadata`).
    pub fn release(&mut self, instance: InstanceHandle, metadata: &ComponentTypeId) -> Option<InstanceId> {
        let id = self.ids.remove(&(instance, metadata.clone()))?;
        self.owners.remove(&id);
        debug!("Released id {} of {}", id, instance);
        Some(id)
    }

    /// Every live allocation, in instance order.
    pub fn entries(&self) -> impl Iterator<Item = Addressable> + '_ {
        self.ids.iter().map(|((instance, metadata), id)| Addressable {
            instance: *instance,
            metadata: metadata.clone(),
            id: id.clone(),
        })
    }

    /// Listen for fresh allocations.
    pub fn subscribe(&self) -> broadcast::Receiver<Addressable> {
        self.notify.subscribe()
    }

    /// Number of live ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True if nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Default for InstanceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_stable_per_pair() {
        let mut alloc = InstanceAllocator::new();
        let storage: ComponentTypeId = "Storage".into();

        let first = alloc.allocate(InstanceHandle(1), &storage);
        let again = alloc.allocate(InstanceHandle(1), &storage);
        let other = alloc.allocate(InstanceHandle(2), &storage);

        assert!(first.fresh);
        assert!(!again.fresh);
        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);
        assert_eq!(alloc.resolve(&first.id), Some(InstanceHandle(1)));
        assert_eq!(alloc.lookup(InstanceHandle(2), &storage), Some(&other.id));
    }

    #[test]
    fn test_notification_fires_once_per_id() {
        let mut alloc = InstanceAllocator::new();
        let mut rx = alloc.subscribe();
        let storage: ComponentTypeId = "Storage".into();

        let allocation = alloc.allocate(InstanceHandle(1), &storage);
        alloc.allocate(InstanceHandle(1), &storage);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.id, allocation.id);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_release_invalidates() {
        let mut alloc = InstanceAllocator::new();
        let storage: ComponentTypeId = "Storage".into();
        let id = alloc.allocate(InstanceHandle(1), &storage).id;

        assert_eq!(alloc.release(InstanceHandle(1), &storage), Some(id.clone()));
        assert_eq!(alloc.resolve(&id), None);
        assert!(alloc.lookup(InstanceHandle(1), &storage).is_none());

        let next = alloc.allocate(InstanceHandle(1), &storage);
        assert!(next.fresh);
        assert_ne!(next.id, id);
    }
}
