//! Client Address Book
//!
//! Read-only cache of server-allocated instance ids. Lookups of an id that
//! is not known yet park on a oneshot until the server announces it or the
//! wait times out. Waits registered on behalf of a component are cancelled
//! when that component goes away.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::ids::{ComponentKey, ComponentTypeId, InstanceHandle, InstanceId};

/// Address wait errors. Both are soft failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressingError {
    /// The id never became known.
    #[error("instance id {id} not known after {waited:?}")]
    Timeout {
        /// Id waited for.
        id: InstanceId,
        /// How long we waited.
        waited: Duration,
    },
    /// The waiting component was destroyed.
    #[error("wait for instance id {id} was cancelled")]
    Cancelled {
        /// Id waited for.
        id: InstanceId,
    },
}

struct Waiter {
    owner: Option<ComponentKey>,
    tx: oneshot::Sender<InstanceHandle>,
}

/// Outcome of [`AddressBook::resolve_local_instance`].
#[derive(Debug)]
pub enum PendingInstance {
    /// The id was already known.
    Ready(InstanceHandle),
    /// The id is not known yet.
    Waiting {
        /// Id waited for.
        id: InstanceId,
        /// Fires when the id is announced.
        rx: oneshot::Receiver<InstanceHandle>,
    },
}

impl PendingInstance {
    /// Known instance, without waiting.
    pub fn now(&self) -> Option<InstanceHandle> {
        match self {
            PendingInstance::Ready(instance) => Some(*instance),
            PendingInstance::Waiting { .. } => None,
        }
    }

    /// Wait up to `timeout` for the instance.
    pub async fn wait(self, timeout: Duration) -> Result<InstanceHandle, AddressingError> {
        let (id, rx) = match self {
            PendingInstance::Ready(instance) => return Ok(instance),
            PendingInstance::Waiting { id, rx } => (id, rx),
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(instance)) => Ok(instance),
            Ok(Err(_)) => Err(AddressingError::Cancelled { id }),
            Err(_) => {
                warn!("Instance id {} did not arrive within {:?}", id, timeout);
                Err(AddressingError::Timeout { id, waited: timeout })
            }
        }
    }
}

/// Client-side instance id cache.
#[derive(Default)]
pub struct AddressBook {
    ids: BTreeMap<(InstanceHandle, ComponentTypeId), InstanceId>,
    instances: HashMap<InstanceId, InstanceHandle>,
    waiters: HashMap<InstanceId, Vec<Waiter>>,
}

impl AddressBook {
    /// An empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an id announced by the server, waking anyone waiting on it.
    ///
    /// A new id for a known pair replaces the old one.
    pub fn receive(&mut self, instance: InstanceHandle, metadata: ComponentTypeId, id: InstanceId) {
        if let Some(old) = self.ids.insert((instance, metadata), id.clone()) {
            if old != id {
                debug!("Instance {} reassigned from {} to {}", instance, old, id);
                self.instances.remove(&old);
            }
        }
        self.instances.insert(id.clone(), instance);

        for waiter in self.waiters.remove(&id).unwrap_or_default() {
            let _ = waiter.tx.send(instance);
        }
    }

    /// Instance named by `id`, now or once announced.
    pub fn resolve_local_instance(&mut self, id: &InstanceId, owner: Option<ComponentKey>) -> PendingInstance {
        if let Some(instance) = self.instances.get(id) {
            return PendingInstance::Ready(*instance);
        }

        let (tx, rx) = oneshot::channel();
        let waiters = self.waiters.entry(id.clone()).or_default();
        waiters.retain(|w| !w.tx.is_closed());
        waiters.push(Waiter { owner, tx });
        PendingInstance::Waiting { id: id.clone(), rx }
    }

    /// Cancel every wait registered by `owner`.
    pub fn cancel_owner(&mut self, owner: ComponentKey) -> usize {
        let mut cancelled = 0;
        for waiters in self.waiters.values_mut() {
            let before = waiters.len();
            waiters.retain(|w| w.owner != Some(owner));
            cancelled += before - waiters.len();
        }
        self.waiters.retain(|_, waiters| !waiters.is_empty());
        cancelled
    }

    /// Drop the id of (`instance`, `metadata`).
    pub fn forget(&mut self, instance: InstanceHandle, metadata: &ComponentTypeId) -> Option<InstanceId> {
        let id = self.ids.remove(&(instance, metadata.clone()))?;
        self.instances.remove(&id);
        Some(id)
    }

    /// Known id of (`instance`, `metadata`).
    pub fn lookup(&self, instance: InstanceHandle, metadata: &ComponentTypeId) -> Option<&InstanceId> {
        self.ids.get(&(instance, metadata.clone()))
    }

    /// Known instance of `id`.
    pub fn instance_of(&self, id: &InstanceId) -> Option<InstanceHandle> {
        self.instances.get(id).copied()
    }

    /// Open waits.
    pub fn pending_count(&self) -> usize {
        self.waiters
            .values()
            .flatten()
            .filter(|w| !w.tx.is_closed())
            .count()
    }
}

impl std::fmt::Debug for AddressBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressBook")
            .field("ids", &self.ids.len())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::server::InstanceAllocator;

    const WAIT: Duration = Duration::from_secs(15);

    #[tokio::test]
    async fn test_allocated_then_received_resolves_without_waiting() {
        let mut alloc = InstanceAllocator::new();
        let mut book = AddressBook::new();
        let storage: ComponentTypeId = "Storage".into();

        let id = alloc.allocate(InstanceHandle(4), &storage).id;
        book.receive(InstanceHandle(4), storage, id.clone());

        let pending = book.resolve_local_instance(&id, None);
        assert_eq!(pending.now(), Some(InstanceHandle(4)));
        assert_eq!(pending.wait(WAIT).await, Ok(InstanceHandle(4)));
    }

    #[tokio::test]
    async fn test_waiter_woken_by_announcement() {
        let mut book = AddressBook::new();
        let id = InstanceId::new("guid-7");

        let pending = book.resolve_local_instance(&id, None);
        assert!(pending.now().is_none());
        let handle = tokio::spawn(pending.wait(WAIT));

        book.receive(InstanceHandle(7), "Storage".into(), id);
        assert_eq!(handle.await.unwrap(), Ok(InstanceHandle(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_id_times_out() {
        let mut book = AddressBook::new();
        let id = InstanceId::new("X");

        let started = tokio::time::Instant::now();
        let err = book.resolve_local_instance(&id, None).wait(WAIT).await.unwrap_err();

        assert_eq!(err, AddressingError::Timeout { id, waited: WAIT });
        assert!(started.elapsed() >= WAIT);
    }

    #[tokio::test]
    async fn test_cancel_owner() {
        let mut book = AddressBook::new();
        let id = InstanceId::new("guid-1");
        let owner = ComponentKey(3);

        let pending = book.resolve_local_instance(&id, Some(owner));
        let other = book.resolve_local_instance(&id, None);
        assert_eq!(book.cancel_owner(owner), 1);

        assert_eq!(pending.wait(WAIT).await, Err(AddressingError::Cancelled { id: id.clone() }));
        book.receive(InstanceHandle(1), "Storage".into(), id);
        assert_eq!(other.wait(WAIT).await, Ok(InstanceHandle(1)));
    }

    #[test]
    fn test_reassignment_forgets_old_id() {
        let mut book = AddressBook::new();
        let old = InstanceId::new("old");
        let new = InstanceId::new("new");

        book.receive(InstanceHandle(1), "Storage".into(), old.clone());
        book.receive(InstanceHandle(1), "Storage".into(), new.clone());

        assert_eq!(book.instance_of(&old), None);
        assert_eq!(book.instance_of(&new), Some(InstanceHandle(1)));
        assert_eq!(book.lookup(InstanceHandle(1), &"Storage".into()), Some(&new));
    }
}
