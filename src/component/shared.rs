//! Shared Component
//!
//! One live component instance. On the server it owns the authoritative
//! state, the connection record and per-observer sync; on the client it owns
//! a replica that only server frames may change. Both roles expose the same
//! read and subscribe API.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::component::connection::{ConnectionError, ConnectionRecord};
use crate::component::descriptor::{
    ClientEventHandler, ComponentDescriptor, RemoteKind, RequestHandler, ServerEventHandler,
    SubscriptionSpec, SyncScope,
};
use crate::component::hooks::ComponentHooks;
use crate::config::RuntimeConfig;
use crate::core::atom::{StateAtom, SubscriptionId};
use crate::core::ids::{ComponentKey, ComponentTypeId, InstanceHandle, InstanceId, PlayerId};
use crate::network::protocol::{ComponentReference, RemoteOutcome, ServerMessage};
use crate::sync::client::{ClientReceiver, ReadyGate, ReadyWaiter, ReceiveReport, SyncError};
use crate::sync::payload::SyncFrame;
use crate::sync::server::ServerSyncer;

/// Local state-change errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Client replicas only change through server frames.
    #[error("client replicas cannot dispatch")]
    ClientReplica,
    /// No action with this name.
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    /// Typed state could not be converted to JSON.
    #[error("state serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Local remote-channel errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// No channel with this name.
    #[error("unknown remote '{0}'")]
    UnknownRemote(String),
    /// The channel exists with another kind.
    #[error("remote '{name}' is a {actual:?}, not a {expected:?}")]
    WrongKind {
        /// Channel name.
        name: String,
        /// Kind the caller needed.
        expected: RemoteKind,
        /// Declared kind.
        actual: RemoteKind,
    },
    /// The channel guard rejected the arguments.
    #[error("arguments rejected by guard of '{0}'")]
    GuardRejected(String),
    /// The component has no instance id yet.
    #[error("component has no instance id yet")]
    MissingInstanceId,
    /// The operation belongs to the other side.
    #[error("operation not available on this side")]
    WrongSide,
}

/// Who a server message goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// One player.
    Player(PlayerId),
    /// Several players.
    Players(Vec<PlayerId>),
    /// Every joined player except these.
    Except(Vec<PlayerId>),
    /// Every joined player.
    All,
}

/// A message queued by a server component.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Target players.
    pub to: Recipients,
    /// The message.
    pub message: ServerMessage,
}

struct ServerRole {
    syncer: ServerSyncer,
    connections: ConnectionRecord,
}

struct ClientRole {
    receiver: ClientReceiver,
    connected: bool,
    ready: ReadyGate,
    deferred: Vec<SubscriptionSpec>,
}

enum Role {
    Server(ServerRole),
    Client(ClientRole),
}

/// A live component.
pub struct SharedComponent {
    key: ComponentKey,
    descriptor: Arc<ComponentDescriptor>,
    instance: InstanceHandle,
    shared_type: ComponentTypeId,
    instance_id: Option<InstanceId>,
    atom: StateAtom,
    hooks: Box<dyn ComponentHooks>,
    role: Role,
    request_handlers: BTreeMap<String, RequestHandler>,
    client_event_handlers: BTreeMap<String, Vec<ClientEventHandler>>,
    server_event_handlers: BTreeMap<String, Vec<ServerEventHandler>>,
    outbox: Vec<Outbound>,
}

impl SharedComponent {
    fn base(
        key: ComponentKey,
        descriptor: Arc<ComponentDescriptor>,
        instance: InstanceHandle,
        shared_type: ComponentTypeId,
        role: Role,
    ) -> Self {
        Self {
            key,
            atom: StateAtom::new(descriptor.initial_state().clone()),
            hooks: descriptor.make_hooks(),
            request_handlers: descriptor.request_handlers.clone(),
            client_event_handlers: descriptor.client_event_handlers.clone(),
            server_event_handlers: descriptor.server_event_handlers.clone(),
            descriptor,
            instance,
            shared_type,
            instance_id: None,
            role,
            outbox: Vec::new(),
        }
    }

    /// Authoritative server component.
    pub fn new_server(
        key: ComponentKey,
        descriptor: Arc<ComponentDescriptor>,
        instance: InstanceHandle,
        shared_type: ComponentTypeId,
        instance_id: InstanceId,
        config: &RuntimeConfig,
    ) -> Self {
        let role = Role::Server(ServerRole {
            syncer: ServerSyncer::new(config.diff_mode.differ(), config.verify_state_hash),
            connections: ConnectionRecord::new(),
        });
        let mut component = Self::base(key, descriptor, instance, shared_type, role);
        component.instance_id = Some(instance_id);

        let specs = component.descriptor.subscriptions.clone();
        for spec in specs {
            component.attach(spec);
        }
        component
    }

    /// Client replica. Standing subscriptions attach after first hydration.
    pub fn new_client(
        key: ComponentKey,
        descriptor: Arc<ComponentDescriptor>,
        instance: InstanceHandle,
        shared_type: ComponentTypeId,
        config: &RuntimeConfig,
    ) -> Self {
        let role = Role::Client(ClientRole {
            receiver: ClientReceiver::new(config.max_buffered_patches, config.verify_state_hash),
            connected: false,
            ready: ReadyGate::new(),
            deferred: descriptor.subscriptions.clone(),
        });
        Self::base(key, descriptor, instance, shared_type, role)
    }

    fn attach(&mut self, spec: SubscriptionSpec) -> SubscriptionId {
        let listener = spec.listener;
        let boxed = Box::new(move |now: &Value, before: &Value| listener(now, before));
        match spec.selector {
            Some(selector) => self.atom.subscribe_selector(selector, boxed),
            None => self.atom.subscribe(boxed),
        }
    }

    // =========================================================================
    // IDENTITY
    // =========================================================================

    /// Local key.
    pub fn key(&self) -> ComponentKey {
        self.key
    }

    /// Declaration of this component's type.
    pub fn descriptor(&self) -> &Arc<ComponentDescriptor> {
        &self.descriptor
    }

    /// Instance the component is attached to.
    pub fn instance(&self) -> InstanceHandle {
        self.instance
    }

    /// Concrete type id.
    pub fn type_id(&self) -> &ComponentTypeId {
        self.descriptor.id()
    }

    /// Shared type id.
    pub fn shared_type(&self) -> &ComponentTypeId {
        &self.shared_type
    }

    /// Network id of the instance, once known.
    pub fn instance_id(&self) -> Option<&InstanceId> {
        self.instance_id.as_ref()
    }

    pub(crate) fn set_instance_id(&mut self, id: InstanceId) {
        self.instance_id = Some(id);
    }

    /// True for the authoritative side.
    pub fn is_server(&self) -> bool {
        matches!(self.role, Role::Server(_))
    }

    /// Wire-level reference to this component.
    pub fn reference(&self) -> Result<ComponentReference, RemoteError> {
        let instance_id = self.instance_id.clone().ok_or(RemoteError::MissingInstanceId)?;
        Ok(ComponentReference {
            instance_id,
            identifier: self.descriptor.id().clone(),
            shared_identifier: self.shared_type.clone(),
            pointer_id: self.descriptor.pointer().cloned(),
        })
    }

    /// Policy hooks.
    pub fn hooks(&self) -> &dyn ComponentHooks {
        self.hooks.as_ref()
    }

    // =========================================================================
    // STATE
    // =========================================================================

    /// Current state (server: canonical, client: replica).
    pub fn state(&self) -> &Value {
        self.atom.get()
    }

    /// Current state decoded into `S`.
    pub fn state_as<S: DeserializeOwned>(&self) -> Result<S, serde_json::Error> {
        S::deserialize(self.atom.get())
    }

    /// Listen to every state change.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&Value, &Value) + Send + 'static,
    {
        self.atom.subscribe(Box::new(listener))
    }

    /// Listen to changes of a projection of the state.
    pub fn subscribe_selector<S, F>(&mut self, selector: S, listener: F) -> SubscriptionId
    where
        S: Fn(&Value) -> Value + Send + Sync + 'static,
        F: FnMut(&Value, &Value) + Send + 'static,
    {
        self.atom.subscribe_selector(Arc::new(selector), Box::new(listener))
    }

    /// Remove a listener.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.atom.unsubscribe(id)
    }

    /// Replace the canonical state and replicate the change.
    pub fn dispatch(&mut self, next: Value) -> Result<(), DispatchError> {
        if !self.is_server() {
            return Err(DispatchError::ClientReplica);
        }
        self.atom.set(next);
        self.push_sync();
        Ok(())
    }

    /// Typed variant of [`dispatch`](Self::dispatch).
    pub fn dispatch_as<S: Serialize>(&mut self, next: &S) -> Result<(), DispatchError> {
        let value = serde_json::to_value(next)?;
        self.dispatch(value)
    }

    /// Run a named action and dispatch its result.
    pub fn call_action(&mut self, name: &str, args: &[Value]) -> Result<(), DispatchError> {
        if !self.is_server() {
            return Err(DispatchError::ClientReplica);
        }
        let reducer = self
            .descriptor
            .action(name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownAction(name.to_string()))?;
        let next = reducer(self.atom.get(), args);
        self.dispatch(next)
    }

    // =========================================================================
    // SERVER: SYNC AND CONNECTIONS
    // =========================================================================

    fn push_sync(&mut self) {
        let Ok(reference) = self.reference() else {
            return;
        };
        let Role::Server(role) = &mut self.role else {
            return;
        };

        for (player, frame) in role.syncer.collect(self.atom.get(), self.hooks.as_ref()) {
            #[cfg(feature = "debug-tracing")]
            tracing::trace!("{} -> {}: {:?}", reference, player, frame);

            self.outbox.push(Outbound {
                to: Recipients::Player(player),
                message: ServerMessage::Dispatch { reference: reference.clone(), frame },
            });
        }
    }

    /// Start replicating to `player` and hydrate them.
    pub fn add_observer(&mut self, player: PlayerId) -> bool {
        let added = match &mut self.role {
            Role::Server(role) => role.syncer.add_observer(player),
            Role::Client(_) => return false,
        };
        self.push_sync();
        added
    }

    /// Send `player` a fresh `init`, if they observe this component.
    pub fn rehydrate(&mut self, player: &PlayerId) -> bool {
        let desynced = match &mut self.role {
            Role::Server(role) => role.syncer.desync(player),
            Role::Client(_) => false,
        };
        if desynced {
            self.push_sync();
        }
        desynced
    }

    /// True if `player` receives state sync.
    pub fn is_observing(&self, player: &PlayerId) -> bool {
        match &self.role {
            Role::Server(role) => role.syncer.is_observing(player),
            Role::Client(_) => false,
        }
    }

    /// Connect `player`: access gate, `on_connected_player`, hydration.
    pub fn connect_player(&mut self, player: PlayerId) -> Result<(), ConnectionError> {
        let Role::Server(role) = &mut self.role else {
            return Err(ConnectionError::ClientSide);
        };
        let hooks = &mut self.hooks;
        role.connections
            .connect(player, |p| hooks.is_access_connection_for_player(p))?;
        hooks.on_connected_player(&player);

        if !role.syncer.add_observer(player) {
            role.syncer.desync(&player);
        }
        self.push_sync();
        Ok(())
    }

    /// Disconnect `player`, optionally telling their client.
    pub fn disconnect_player(&mut self, player: &PlayerId, notify: bool) -> Result<(), ConnectionError> {
        let Role::Server(role) = &mut self.role else {
            return Err(ConnectionError::ClientSide);
        };
        role.connections.disconnect(player)?;
        self.hooks.on_disconnected_player(player);
        if self.descriptor.sync_scope() == SyncScope::Connected {
            role.syncer.remove_observer(player);
        }

        if notify {
            if let Ok(reference) = self.reference() {
                self.outbox.push(Outbound {
                    to: Recipients::Player(*player),
                    message: ServerMessage::Disconnected { reference },
                });
            }
        }
        Ok(())
    }

    /// `player` left the session: implicit disconnect, stop sync.
    pub fn player_left(&mut self, player: &PlayerId) {
        if self.is_connected_player(player) {
            if let Err(err) = self.disconnect_player(player, false) {
                debug!("Implicit disconnect of {} failed: {}", player, err);
            }
        }
        if let Role::Server(role) = &mut self.role {
            role.syncer.remove_observer(player);
        }
    }

    /// True if `player` is connected (server side).
    pub fn is_connected_player(&self, player: &PlayerId) -> bool {
        match &self.role {
            Role::Server(role) => role.connections.is_connected(player),
            Role::Client(_) => false,
        }
    }

    /// Players connected to this component.
    pub fn connected_players(&self) -> Vec<PlayerId> {
        match &self.role {
            Role::Server(role) => role.connections.players().copied().collect(),
            Role::Client(_) => Vec::new(),
        }
    }

    /// Forget what `player` holds after a failed send.
    pub fn mark_desynced(&mut self, player: &PlayerId) {
        if let Role::Server(role) = &mut self.role {
            role.syncer.desync(player);
        }
    }

    /// Drain queued server messages.
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    // =========================================================================
    // REMOTE CHANNELS
    // =========================================================================

    /// Check that `name` is a `kind` channel accepting `args`.
    pub fn check_remote(&self, name: &str, kind: RemoteKind, args: &[Value]) -> Result<(), RemoteError> {
        let spec = self
            .descriptor
            .remote(name)
            .ok_or_else(|| RemoteError::UnknownRemote(name.to_string()))?;
        if spec.kind != kind {
            return Err(RemoteError::WrongKind {
                name: name.to_string(),
                expected: kind,
                actual: spec.kind,
            });
        }
        if !(spec.guard)(args) {
            return Err(RemoteError::GuardRejected(name.to_string()));
        }
        Ok(())
    }

    /// Bind (or replace) the server handler of a remote function.
    pub fn on_request<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&mut SharedComponent, &PlayerId, Vec<Value>) -> Value + Send + Sync + 'static,
    {
        self.request_handlers.insert(name.to_string(), Arc::new(handler));
    }

    /// Add a server listener for a client event.
    pub fn on_client_event<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&mut SharedComponent, &PlayerId, Vec<Value>) + Send + Sync + 'static,
    {
        self.client_event_handlers
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Add a client listener for a server event.
    pub fn on_server_event<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&mut SharedComponent, Vec<Value>) + Send + Sync + 'static,
    {
        self.server_event_handlers
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Queue a server-to-client event.
    pub fn fire_event(&mut self, name: &str, to: Recipients, args: Vec<Value>) -> Result<(), RemoteError> {
        if !self.is_server() {
            return Err(RemoteError::WrongSide);
        }
        self.check_remote(name, RemoteKind::ServerEvent, &args)?;
        let reference = self.reference()?;
        self.outbox.push(Outbound {
            to,
            message: ServerMessage::RemoteEvent { reference, name: name.to_string(), args },
        });
        Ok(())
    }

    /// Serve a remote function call from `player`.
    pub fn handle_request(&mut self, player: &PlayerId, name: &str, args: Vec<Value>) -> RemoteOutcome {
        if !self.is_connected_player(player) {
            debug!("Player {} called '{}' without a connection", player, name);
            return RemoteOutcome::NotConnected;
        }

        match self.check_remote(name, RemoteKind::Function, &args) {
            Ok(()) => {}
            Err(RemoteError::GuardRejected(_)) => {
                debug!("Guard of '{}' rejected arguments from {}", name, player);
                return RemoteOutcome::GuardFailed;
            }
            Err(err) => {
                warn!("Request from {} to {}: {}", player, self.type_id(), err);
                return RemoteOutcome::Unresolved;
            }
        }

        match self.request_handlers.get(name).cloned() {
            Some(handler) => RemoteOutcome::Ok(handler(self, player, args)),
            None => {
                debug!("No handler bound for '{}' on {}", name, self.type_id());
                RemoteOutcome::Ok(Value::Null)
            }
        }
    }

    /// Deliver a client event from `player`. Returns true if delivered.
    pub fn handle_client_event(&mut self, player: &PlayerId, name: &str, args: Vec<Value>) -> bool {
        if !self.is_connected_player(player) {
            debug!("Player {} fired '{}' without a connection", player, name);
            return false;
        }
        if let Err(err) = self.check_remote(name, RemoteKind::ClientEvent, &args) {
            debug!("Dropping event '{}' from {}: {}", name, player, err);
            return false;
        }

        let handlers = self.client_event_handlers.get(name).cloned().unwrap_or_default();
        for handler in handlers {
            handler(self, player, args.clone());
        }
        true
    }

    /// Deliver a server event on the client. Returns true if delivered.
    pub fn handle_server_event(&mut self, name: &str, args: Vec<Value>) -> bool {
        if self.is_server() {
            return false;
        }
        if let Err(err) = self.check_remote(name, RemoteKind::ServerEvent, &args) {
            debug!("Dropping server event '{}': {}", name, err);
            return false;
        }

        let handlers = self.server_event_handlers.get(name).cloned().unwrap_or_default();
        for handler in handlers {
            handler(self, args.clone());
        }
        true
    }

    // =========================================================================
    // CLIENT: REPLICA
    // =========================================================================

    /// Apply a sync frame to the replica.
    pub fn receive_frame(&mut self, frame: SyncFrame) -> Result<ReceiveReport, SyncError> {
        let Role::Client(role) = &mut self.role else {
            warn!("Server component {} received a sync frame", self.descriptor.id());
            return Ok(ReceiveReport::default());
        };

        let report = role.receiver.receive(frame, &mut self.atom)?;
        if report.hydrated_now {
            let deferred = std::mem::take(&mut role.deferred);
            role.ready.mark_ready();
            for spec in deferred {
                self.attach(spec);
            }
        }
        Ok(report)
    }

    /// True once the replica has been hydrated (always true on the server).
    pub fn is_ready(&self) -> bool {
        match &self.role {
            Role::Server(_) => true,
            Role::Client(role) => role.ready.is_ready(),
        }
    }

    /// Waiter resolving at first hydration. `None` on the server.
    pub fn ready(&self) -> Option<ReadyWaiter> {
        match &self.role {
            Role::Server(_) => None,
            Role::Client(role) => Some(role.ready.waiter()),
        }
    }

    /// True while the replica waits for re-hydration.
    pub fn is_desynced(&self) -> bool {
        match &self.role {
            Role::Server(_) => false,
            Role::Client(role) => role.receiver.is_desynced(),
        }
    }

    /// Ignore server frames while set (client side).
    pub fn set_blocking_server_dispatches(&mut self, blocking: bool) {
        if let Role::Client(role) = &mut self.role {
            role.receiver.set_blocking(blocking);
        }
    }

    /// True while server frames are ignored.
    pub fn is_blocking_server_dispatches(&self) -> bool {
        match &self.role {
            Role::Server(_) => false,
            Role::Client(role) => role.receiver.is_blocking(),
        }
    }

    /// Client view of the connection handshake.
    pub fn is_connected(&self) -> bool {
        match &self.role {
            Role::Server(_) => false,
            Role::Client(role) => role.connected,
        }
    }

    pub(crate) fn set_connected(&mut self, connected: bool) {
        if let Role::Client(role) = &mut self.role {
            role.connected = connected;
        }
    }

    /// The server dropped this client's connection.
    pub fn handle_disconnected(&mut self) {
        if let Role::Client(role) = &mut self.role {
            if role.connected {
                role.connected = false;
                self.hooks.on_disconnected();
            }
        }
    }

    /// Release listeners and handlers before removal.
    pub fn destroy(&mut self) {
        self.atom.clear_subscriptions();
        self.request_handlers.clear();
        self.client_event_handlers.clear();
        self.server_event_handlers.clear();
        self.outbox.clear();
    }
}

impl std::fmt::Debug for SharedComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedComponent")
            .field("key", &self.key)
            .field("type", self.descriptor.id())
            .field("instance", &self.instance)
            .field("instance_id", &self.instance_id)
            .field("server", &self.is_server())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
