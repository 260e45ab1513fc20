//! Client Runtime
//!
//! Owns the local replicas, the address book and every request in flight.
//! Server messages are applied through [`ClientRuntime::handle_server_message`];
//! outbound requests go to the transport's queue and hand back a pending
//! future that resolves when the reply arrives or the call times out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::addressing::{AddressBook, AddressingError, PendingInstance};
use crate::component::connection::PlayerAction;
use crate::component::descriptor::{ComponentDescriptor, RemoteKind};
use crate::component::shared::{RemoteError, SharedComponent};
use crate::component::store::ComponentStore;
use crate::config::RuntimeConfig;
use crate::core::ids::{ComponentKey, ComponentTypeId, InstanceHandle, InstanceId, TypeKey};
use crate::network::protocol::{
    ClientMessage, ComponentReference, Interaction, RemoteOutcome, ServerMessage,
};
use crate::registry::Registry;
use crate::resolver::{ComponentResolver, ResolveError};
use crate::runtime::RuntimeError;
use crate::sync::client::ReadyWaiter;

/// Client-side request errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// No live component under this key.
    #[error("no component {0}")]
    UnknownComponent(ComponentKey),
    /// Local validation failed before sending.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The transport is gone.
    #[error("transport closed")]
    TransportClosed,
    /// No reply in time.
    #[error("'{name}' got no reply within {waited:?}")]
    Timeout {
        /// Channel or action name.
        name: String,
        /// How long we waited.
        waited: Duration,
    },
    /// The server refused the call with a sentinel.
    #[error("rejected by server: {0}")]
    Rejected(&'static str),
    /// The server could not find the component.
    #[error("server could not resolve the component")]
    Unresolved,
}

/// A remote function call in flight.
#[derive(Debug)]
pub struct PendingCall {
    name: String,
    timeout: Duration,
    rx: oneshot::Receiver<RemoteOutcome>,
}

impl PendingCall {
    /// Wait for the reply.
    pub async fn wait(self) -> Result<Value, CallError> {
        let outcome = match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => return Err(CallError::TransportClosed),
            Err(_) => {
                warn!("Remote function '{}' timed out", self.name);
                return Err(CallError::Timeout { name: self.name, waited: self.timeout });
            }
        };

        match outcome {
            RemoteOutcome::Ok(value) => Ok(value),
            RemoteOutcome::Unresolved => Err(CallError::Unresolved),
            rejected => Err(CallError::Rejected(rejected.sentinel().unwrap_or("rejected"))),
        }
    }
}

/// A connection request in flight.
#[derive(Debug)]
pub struct PendingConnection {
    action: PlayerAction,
    timeout: Duration,
    rx: oneshot::Receiver<bool>,
}

impl PendingConnection {
    /// Wait for the server's verdict.
    pub async fn wait(self) -> Result<bool, CallError> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(success)) => Ok(success),
            Ok(Err(_)) => Err(CallError::TransportClosed),
            Err(_) => Err(CallError::Timeout {
                name: format!("{:?}", self.action),
                waited: self.timeout,
            }),
        }
    }
}

struct PendingConnect {
    key: ComponentKey,
    action: PlayerAction,
    tx: oneshot::Sender<bool>,
}

/// Client side of the framework.
pub struct ClientRuntime {
    config: RuntimeConfig,
    resolver: ComponentResolver,
    store: ComponentStore,
    book: AddressBook,
    sender: mpsc::UnboundedSender<ClientMessage>,
    next_request: u64,
    pending_ids: HashMap<u64, (InstanceHandle, ComponentTypeId)>,
    pending_calls: HashMap<u64, oneshot::Sender<RemoteOutcome>>,
    pending_connections: HashMap<u64, PendingConnect>,
}

impl ClientRuntime {
    /// Create a runtime sending through `sender`.
    pub fn new(
        registry: Arc<Registry>,
        config: RuntimeConfig,
        sender: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        Self {
            config,
            resolver: ComponentResolver::new(Arc::clone(&registry)),
            store: ComponentStore::new(registry),
            book: AddressBook::new(),
            sender,
            next_request: 1,
            pending_ids: HashMap::new(),
            pending_calls: HashMap::new(),
            pending_connections: HashMap::new(),
        }
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Registry in use.
    pub fn registry(&self) -> &Arc<Registry> {
        self.store.registry()
    }

    /// Instance id cache.
    pub fn address_book(&self) -> &AddressBook {
        &self.book
    }

    /// Live replicas.
    pub fn store(&self) -> &ComponentStore {
        &self.store
    }

    fn request_id(&mut self) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    fn send(&self, message: ClientMessage) -> Result<(), CallError> {
        self.sender.send(message).map_err(|_| CallError::TransportClosed)
    }

    // =========================================================================
    // COMPONENTS
    // =========================================================================

    /// Mirror a component of marker type `T` on `instance`.
    pub fn add<T: 'static>(&mut self, instance: InstanceHandle) -> Result<ComponentKey, RuntimeError> {
        let key = TypeKey::of::<T>();
        let descriptor = self
            .registry()
            .descriptor_for(key)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownType(ComponentTypeId::new(key.name())))?;
        self.add_descriptor(instance, descriptor, None)
    }

    /// Mirror a component of type `id` on `instance`.
    pub fn add_component(
        &mut self,
        instance: InstanceHandle,
        id: &ComponentTypeId,
    ) -> Result<ComponentKey, RuntimeError> {
        let descriptor = self
            .registry()
            .descriptor(id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownType(id.clone()))?;
        self.add_descriptor(instance, descriptor, None)
    }

    fn add_descriptor(
        &mut self,
        instance: InstanceHandle,
        descriptor: Arc<ComponentDescriptor>,
        known_id: Option<InstanceId>,
    ) -> Result<ComponentKey, RuntimeError> {
        if descriptor.is_abstract() {
            return Err(RuntimeError::AbstractType(descriptor.id().clone()));
        }

        let shared = self.registry().shared_type_of(descriptor.type_key());
        let key = self.store.next_key();
        let mut component =
            SharedComponent::new_client(key, descriptor, instance, shared.clone(), &self.config);

        let id = known_id.or_else(|| self.book.lookup(instance, &shared).cloned());
        match id {
            Some(id) => {
                component.set_instance_id(id);
                let reference = component.reference()?;
                self.store.insert(component);
                let _ = self.send(ClientMessage::Start { reference });
            }
            None => {
                self.store.insert(component);
                self.request_instance_id(instance, shared);
            }
        }
        Ok(key)
    }

    fn request_instance_id(&mut self, instance: InstanceHandle, metadata: ComponentTypeId) {
        let request_id = self.request_id();
        self.pending_ids.insert(request_id, (instance, metadata.clone()));
        let _ = self.send(ClientMessage::GetInstanceId { request_id, instance, metadata });
    }

    /// Ask again for the ids of replicas that are still unaddressed.
    pub fn retry_pending_addresses(&mut self) -> usize {
        let unaddressed: Vec<(InstanceHandle, ComponentTypeId)> = self
            .store
            .iter()
            .filter(|c| c.instance_id().is_none())
            .map(|c| (c.instance(), c.shared_type().clone()))
            .collect();

        let count = unaddressed.len();
        for (instance, metadata) in unaddressed {
            self.request_instance_id(instance, metadata);
        }
        count
    }

    /// Drop a replica, cancelling its address waits.
    pub fn remove_component(&mut self, key: ComponentKey) -> Result<(), RuntimeError> {
        let mut component = self.store.remove(key).ok_or(RuntimeError::UnknownComponent(key))?;
        component.destroy();
        let cancelled = self.book.cancel_owner(key);
        if cancelled > 0 {
            debug!("Cancelled {} address waits of {}", cancelled, key);
        }
        Ok(())
    }

    /// Replica by key.
    pub fn component(&self, key: ComponentKey) -> Option<&SharedComponent> {
        self.store.get(key)
    }

    /// Run `f` on a replica.
    pub fn with_component<R>(
        &mut self,
        key: ComponentKey,
        f: impl FnOnce(&mut SharedComponent) -> R,
    ) -> Result<R, RuntimeError> {
        let component = self.store.get_mut(key).ok_or(RuntimeError::UnknownComponent(key))?;
        Ok(f(component))
    }

    /// Replica state.
    pub fn state(&self, key: ComponentKey) -> Option<&Value> {
        self.store.get(key).map(SharedComponent::state)
    }

    /// Waiter resolving at the replica's first hydration.
    pub fn ready(&self, key: ComponentKey) -> Option<ReadyWaiter> {
        self.store.get(key).and_then(SharedComponent::ready)
    }

    /// Ignore server frames for one replica while set.
    pub fn set_blocking_server_dispatches(&mut self, key: ComponentKey, blocking: bool) -> Result<(), RuntimeError> {
        self.with_component(key, |c| c.set_blocking_server_dispatches(blocking))
    }

    /// Instance named by `id`, now or once announced.
    pub fn resolve_local_instance(&mut self, id: &InstanceId, owner: Option<ComponentKey>) -> PendingInstance {
        self.book.resolve_local_instance(id, owner)
    }

    /// Instance named by `id`, waiting at most the configured address timeout.
    pub fn wait_for_instance(
        &mut self,
        id: &InstanceId,
        owner: Option<ComponentKey>,
    ) -> impl Future<Output = Result<InstanceHandle, AddressingError>> + Send + 'static {
        let timeout = self.config.address_timeout;
        self.book.resolve_local_instance(id, owner).wait(timeout)
    }

    // =========================================================================
    // OUTBOUND REQUESTS
    // =========================================================================

    fn checked_reference(
        &self,
        key: ComponentKey,
        name: &str,
        kind: RemoteKind,
        args: &[Value],
    ) -> Result<ComponentReference, CallError> {
        let component = self.store.get(key).ok_or(CallError::UnknownComponent(key))?;
        component.check_remote(name, kind, args)?;
        Ok(component.reference()?)
    }

    /// Call a remote function.
    pub fn invoke(&mut self, key: ComponentKey, name: &str, args: Vec<Value>) -> Result<PendingCall, CallError> {
        let reference = self.checked_reference(key, name, RemoteKind::Function, &args)?;
        self.pending_calls.retain(|_, tx| !tx.is_closed());

        let request_id = self.request_id();
        let (tx, rx) = oneshot::channel();
        self.pending_calls.insert(request_id, tx);
        self.send(ClientMessage::RemoteFunction {
            request_id,
            reference,
            name: name.to_string(),
            args,
        })?;

        Ok(PendingCall {
            name: name.to_string(),
            timeout: self.config.call_timeout,
            rx,
        })
    }

    /// Fire a client-to-server event.
    pub fn fire_event(&mut self, key: ComponentKey, name: &str, args: Vec<Value>) -> Result<(), CallError> {
        let reference = self.checked_reference(key, name, RemoteKind::ClientEvent, &args)?;
        if !self.store.get(key).map_or(false, SharedComponent::is_connected) {
            debug!("Firing '{}' on {} before connecting; the server will drop it", name, reference);
        }
        self.send(ClientMessage::RemoteEvent {
            reference,
            name: name.to_string(),
            args,
        })
    }

    /// Ask to connect to a component.
    pub fn connect(&mut self, key: ComponentKey) -> Result<PendingConnection, CallError> {
        self.connection_request(key, PlayerAction::Connect)
    }

    /// Ask to disconnect from a component.
    pub fn disconnect(&mut self, key: ComponentKey) -> Result<PendingConnection, CallError> {
        self.connection_request(key, PlayerAction::Disconnect)
    }

    fn connection_request(&mut self, key: ComponentKey, action: PlayerAction) -> Result<PendingConnection, CallError> {
        let component = self.store.get(key).ok_or(CallError::UnknownComponent(key))?;
        let reference = component.reference()?;

        let request_id = self.request_id();
        let (tx, rx) = oneshot::channel();
        self.pending_connections.insert(request_id, PendingConnect { key, action, tx });
        self.send(ClientMessage::ConnectionRequest { request_id, reference, action })?;

        Ok(PendingConnection {
            action,
            timeout: self.config.call_timeout,
            rx,
        })
    }

    /// Measure round-trip time.
    pub fn ping(&self, timestamp: u64) -> Result<(), CallError> {
        self.send(ClientMessage::Ping { timestamp })
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    fn resolve(&self, reference: &ComponentReference, quiet: bool) -> Result<ComponentKey, ResolveError> {
        self.resolver.resolve_with(reference, &self.book, &self.store, quiet)
    }

    /// Apply one message from the server.
    pub fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::AuthResult(result) => {
                debug!("Auth result: success={}", result.success);
            }

            ServerMessage::Dispatch { reference, frame } => {
                let Ok(key) = self.resolve(&reference, false) else {
                    return;
                };
                let Some(component) = self.store.get_mut(key) else {
                    return;
                };
                if let Err(err) = component.receive_frame(frame) {
                    warn!("Replica {} desynced: {}; requesting hydration", reference, err);
                    let _ = self.send(ClientMessage::Start { reference });
                }
            }

            ServerMessage::ReceiveInstanceId { instance, metadata, id } => {
                self.receive_instance_id(instance, metadata, id);
            }

            ServerMessage::InstanceIdResponse { request_id, id } => {
                let Some((instance, metadata)) = self.pending_ids.remove(&request_id) else {
                    debug!("Unexpected instance id response {}", request_id);
                    return;
                };
                match id {
                    Some(id) => self.receive_instance_id(instance, metadata, id),
                    None => debug!("{} ({}) has no id yet", instance, metadata),
                }
            }

            ServerMessage::RemoteEvent { reference, name, args } => {
                if let Ok(key) = self.resolve(&reference, false) {
                    if let Some(component) = self.store.get_mut(key) {
                        component.handle_server_event(&name, args);
                    }
                }
            }

            ServerMessage::FunctionResponse { request_id, outcome } => {
                match self.pending_calls.remove(&request_id) {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => debug!("Late reply to call {}", request_id),
                }
            }

            ServerMessage::ConnectionResponse { request_id, success, instance_id } => {
                let Some(pending) = self.pending_connections.remove(&request_id) else {
                    debug!("Late reply to connection request {}", request_id);
                    return;
                };
                if success {
                    if let Some(component) = self.store.get_mut(pending.key) {
                        debug!("{:?} of {} accepted ({})", pending.action, pending.key, instance_id);
                        match pending.action {
                            PlayerAction::Connect => component.set_connected(true),
                            PlayerAction::Disconnect => component.handle_disconnected(),
                        }
                    }
                }
                let _ = pending.tx.send(success);
            }

            ServerMessage::Disconnected { reference } => {
                if let Ok(key) = self.resolve(&reference, false) {
                    if let Some(component) = self.store.get_mut(key) {
                        component.handle_disconnected();
                    }
                }
            }

            ServerMessage::ComponentInteraction { reference, instance, interaction } => match interaction {
                Interaction::Add => self.mirror(reference, instance),
                Interaction::Remove => {
                    if let Ok(key) = self.resolve(&reference, true) {
                        let _ = self.remove_component(key);
                    }
                }
            },

            ServerMessage::Pong { timestamp, server_time } => {
                debug!("Pong {} (server time {})", timestamp, server_time);
            }

            ServerMessage::Error(error) => {
                warn!("Server error {:?}: {}", error.code, error.message);
            }

            ServerMessage::Shutdown { reason } => {
                info!("Server shutting down: {}", reason);
            }
        }
    }

    fn receive_instance_id(&mut self, instance: InstanceHandle, metadata: ComponentTypeId, id: InstanceId) {
        self.book.receive(instance, metadata.clone(), id.clone());

        let mut starts = Vec::new();
        for key in self.store.on_instance(instance).to_vec() {
            let Some(component) = self.store.get_mut(key) else {
                continue;
            };
            if *component.shared_type() != metadata || component.instance_id() == Some(&id) {
                continue;
            }
            component.set_instance_id(id.clone());
            if let Ok(reference) = component.reference() {
                starts.push(reference);
            }
        }

        for reference in starts {
            let _ = self.send(ClientMessage::Start { reference });
        }
    }

    fn mirror(&mut self, reference: ComponentReference, instance: InstanceHandle) {
        let Some(descriptor) = self.registry().mirror_for(&reference) else {
            debug!("No local mirror for {}", reference);
            return;
        };

        let exists = self
            .store
            .on_instance(instance)
            .iter()
            .filter_map(|k| self.store.get(*k))
            .any(|c| c.type_id() == descriptor.id());
        if exists {
            return;
        }

        self.book
            .receive(instance, reference.shared_identifier.clone(), reference.instance_id.clone());
        if let Err(err) = self.add_descriptor(instance, descriptor, Some(reference.instance_id.clone())) {
            warn!("Cannot mirror {}: {}", reference, err);
        }
    }
}

impl std::fmt::Debug for ClientRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRuntime")
            .field("components", &self.store.len())
            .field("pending_calls", &self.pending_calls.len())
            .field("book", &self.book)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::guard;
    use crate::sync::payload::{PatchPayload, SyncFrame};
    use serde_json::json;

    struct Counter;

    fn registry() -> Arc<Registry> {
        let counter = ComponentDescriptor::builder::<Counter>("Counter")
            .initial_state(json!({ "value": 0 }))
            .remote_function("add", guard::typed::<(i64,)>())
            .client_event("poke", guard::no_args())
            .build();
        Registry::builder().component(counter).build()
    }

    fn runtime() -> (ClientRuntime, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientRuntime::new(registry(), RuntimeConfig::default(), tx), rx)
    }

    fn reference(id: &str) -> ComponentReference {
        ComponentReference {
            instance_id: InstanceId::new(id),
            identifier: "Counter".into(),
            shared_identifier: "Counter".into(),
            pointer_id: None,
        }
    }

    #[tokio::test]
    async fn test_unaddressed_component_requests_id_then_starts() {
        let (mut rt, mut rx) = runtime();
        let key = rt.add::<Counter>(InstanceHandle(1)).unwrap();

        let request_id = match rx.try_recv().unwrap() {
            ClientMessage::GetInstanceId { request_id, instance, metadata } => {
                assert_eq!(instance, InstanceHandle(1));
                assert_eq!(metadata.as_str(), "Counter");
                request_id
            }
            other => panic!("unexpected {:?}", other),
        };

        rt.handle_server_message(ServerMessage::InstanceIdResponse { request_id, id: None });
        assert!(rx.try_recv().is_err());
        assert_eq!(rt.retry_pending_addresses(), 1);
        let request_id = match rx.try_recv().unwrap() {
            ClientMessage::GetInstanceId { request_id, .. } => request_id,
            other => panic!("unexpected {:?}", other),
        };

        rt.handle_server_message(ServerMessage::InstanceIdResponse {
            request_id,
            id: Some(InstanceId::new("guid-1")),
        });
        assert!(matches!(rx.try_recv().unwrap(), ClientMessage::Start { .. }));
        assert_eq!(rt.component(key).unwrap().instance_id(), Some(&InstanceId::new("guid-1")));
    }

    #[tokio::test]
    async fn test_interaction_add_mirrors_and_remove_drops() {
        let (mut rt, mut rx) = runtime();
        rt.handle_server_message(ServerMessage::ComponentInteraction {
            reference: reference("guid-2"),
            instance: InstanceHandle(2),
            interaction: Interaction::Add,
        });
        assert_eq!(rt.store().len(), 1);
        assert!(matches!(rx.try_recv().unwrap(), ClientMessage::Start { .. }));

        rt.handle_server_message(ServerMessage::ComponentInteraction {
            reference: reference("guid-2"),
            instance: InstanceHandle(2),
            interaction: Interaction::Add,
        });
        assert_eq!(rt.store().len(), 1);

        rt.handle_server_message(ServerMessage::ComponentInteraction {
            reference: reference("guid-2"),
            instance: InstanceHandle(2),
            interaction: Interaction::Remove,
        });
        assert!(rt.store().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_hydrates_replica() {
        let (mut rt, _rx) = runtime();
        rt.handle_server_message(ServerMessage::ComponentInteraction {
            reference: reference("guid-3"),
            instance: InstanceHandle(3),
            interaction: Interaction::Add,
        });
        let key = rt.store().keys()[0];
        let ready = rt.ready(key).unwrap();

        rt.handle_server_message(ServerMessage::Dispatch {
            reference: reference("guid-3"),
            frame: SyncFrame {
                epoch: 1,
                seq: 0,
                payload: PatchPayload::Init { state: json!({ "value": 11 }) },
                state_hash: None,
            },
        });
        assert!(ready.wait().await);
        assert_eq!(rt.state(key), Some(&json!({ "value": 11 })));
    }

    #[tokio::test]
    async fn test_bad_frame_requests_hydration() {
        let (mut rt, mut rx) = runtime();
        rt.handle_server_message(ServerMessage::ComponentInteraction {
            reference: reference("guid-4"),
            instance: InstanceHandle(4),
            interaction: Interaction::Add,
        });
        let _ = rx.try_recv();

        rt.handle_server_message(ServerMessage::Dispatch {
            reference: reference("guid-4"),
            frame: SyncFrame {
                epoch: 1,
                seq: 0,
                payload: PatchPayload::Init { state: json!({ "value": 1 }) },
                state_hash: Some("0000".into()),
            },
        });
        assert!(matches!(rx.try_recv().unwrap(), ClientMessage::Start { .. }));
    }

    #[tokio::test]
    async fn test_invoke_resolves_with_reply() {
        let (mut rt, mut rx) = runtime();
        rt.handle_server_message(ServerMessage::ComponentInteraction {
            reference: reference("guid-5"),
            instance: InstanceHandle(5),
            interaction: Interaction::Add,
        });
        let _ = rx.try_recv();
        let key = rt.store().keys()[0];

        assert!(matches!(
            rt.invoke(key, "add", vec![json!("nope")]),
            Err(CallError::Remote(RemoteError::GuardRejected(_)))
        ));
        assert!(matches!(
            rt.invoke(key, "poke", vec![]),
            Err(CallError::Remote(RemoteError::WrongKind { .. }))
        ));

        let pending = rt.invoke(key, "add", vec![json!(2)]).unwrap();
        let request_id = match rx.try_recv().unwrap() {
            ClientMessage::RemoteFunction { request_id, .. } => request_id,
            other => panic!("unexpected {:?}", other),
        };
        rt.handle_server_message(ServerMessage::FunctionResponse {
            request_id,
            outcome: RemoteOutcome::Ok(json!(2)),
        });
        assert_eq!(pending.wait().await, Ok(json!(2)));
    }

    #[tokio::test]
    async fn test_not_connected_sentinel_surfaces_as_rejection() {
        let (mut rt, mut rx) = runtime();
        rt.handle_server_message(ServerMessage::ComponentInteraction {
            reference: reference("guid-6"),
            instance: InstanceHandle(6),
            interaction: Interaction::Add,
        });
        let _ = rx.try_recv();
        let key = rt.store().keys()[0];

        let pending = rt.invoke(key, "add", vec![json!(1)]).unwrap();
        let Ok(ClientMessage::RemoteFunction { request_id, .. }) = rx.try_recv() else {
            panic!("expected a remote function request");
        };
        rt.handle_server_message(ServerMessage::FunctionResponse {
            request_id,
            outcome: RemoteOutcome::NotConnected,
        });
        assert_eq!(
            pending.wait().await,
            Err(CallError::Rejected(crate::network::protocol::NOT_CONNECTED))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_times_out() {
        let (mut rt, mut rx) = runtime();
        rt.handle_server_message(ServerMessage::ComponentInteraction {
            reference: reference("guid-7"),
            instance: InstanceHandle(7),
            interaction: Interaction::Add,
        });
        let _ = rx.try_recv();
        let key = rt.store().keys()[0];

        let pending = rt.invoke(key, "add", vec![json!(1)]).unwrap();
        assert!(matches!(pending.wait().await, Err(CallError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_connection_round_trip_and_disconnect_hook() {
        let (mut rt, mut rx) = runtime();
        rt.handle_server_message(ServerMessage::ComponentInteraction {
            reference: reference("guid-8"),
            instance: InstanceHandle(8),
            interaction: Interaction::Add,
        });
        let _ = rx.try_recv();
        let key = rt.store().keys()[0];

        let pending = rt.connect(key).unwrap();
        let Ok(ClientMessage::ConnectionRequest { request_id, action, .. }) = rx.try_recv() else {
            panic!("expected a connection request");
        };
        assert_eq!(action, PlayerAction::Connect);
        rt.handle_server_message(ServerMessage::ConnectionResponse {
            request_id,
            success: true,
            instance_id: "guid-8".into(),
        });
        assert_eq!(pending.wait().await, Ok(true));
        assert!(rt.component(key).unwrap().is_connected());

        rt.handle_server_message(ServerMessage::Disconnected { reference: reference("guid-8") });
        assert!(!rt.component(key).unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_remove_cancels_address_waits() {
        let (mut rt, _rx) = runtime();
        let key = rt.add::<Counter>(InstanceHandle(1)).unwrap();
        let pending = rt.resolve_local_instance(&InstanceId::new("later"), Some(key));

        rt.remove_component(key).unwrap();
        assert!(matches!(
            pending.wait(Duration::from_secs(15)).await,
            Err(AddressingError::Cancelled { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_wait_uses_configured_timeout() {
        let config = RuntimeConfig { address_timeout: Duration::from_secs(3), ..RuntimeConfig::default() };
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut rt = ClientRuntime::new(registry(), config, tx);

        let started = tokio::time::Instant::now();
        let result = rt.wait_for_instance(&InstanceId::new("never"), None).await;
        match result {
            Err(AddressingError::Timeout { id, waited }) => {
                assert_eq!(id, InstanceId::new("never"));
                assert_eq!(waited, Duration::from_secs(3));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_blocking_ignores_server_frames() {
        let (mut rt, _rx) = runtime();
        rt.handle_server_message(ServerMessage::ComponentInteraction {
            reference: reference("guid-9"),
            instance: InstanceHandle(9),
            interaction: Interaction::Add,
        });
        let key = rt.store().keys()[0];
        rt.set_blocking_server_dispatches(key, true).unwrap();

        rt.handle_server_message(ServerMessage::Dispatch {
            reference: reference("guid-9"),
            frame: SyncFrame {
                epoch: 1,
                seq: 0,
                payload: PatchPayload::Init { state: json!({ "value": 5 }) },
                state_hash: None,
            },
        });
        assert_eq!(rt.state(key), Some(&json!({ "value": 0 })));
    }
}
