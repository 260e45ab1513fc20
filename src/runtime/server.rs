//! Server Runtime
//!
//! Owns every authoritative component of the process, the instance id
//! table and the table of joined players. Transport tasks feed it
//! [`ClientMessage`]s; it answers through each player's outbound queue.
//!
//! ```text
//!   transport ──ClientMessage──▶ handle_client_message
//!                                   │ resolve reference
//!                                   ▼
//!                             SharedComponent ──outbox──▶ flush ──▶ player queues
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::addressing::{Addressable, InstanceAllocator};
use crate::component::connection::PlayerAction;
use crate::component::descriptor::{ComponentDescriptor, SyncScope};
use crate::component::shared::{Outbound, Recipients, SharedComponent};
use crate::component::store::ComponentStore;
use crate::config::RuntimeConfig;
use crate::core::ids::{ComponentKey, ComponentTypeId, InstanceHandle, PlayerId, TypeKey};
use crate::network::protocol::{
    ClientMessage, ComponentReference, Interaction, RemoteOutcome, ServerMessage,
};
use crate::registry::Registry;
use crate::resolver::{ComponentResolver, ResolveError};
use crate::runtime::RuntimeError;

/// A player in the session.
#[derive(Debug)]
pub struct SessionPlayer {
    /// Outbound queue to the player's transport.
    pub sender: mpsc::UnboundedSender<ServerMessage>,
    /// When the player joined.
    pub joined_at: DateTime<Utc>,
}

/// Server side of the framework.
pub struct ServerRuntime {
    config: RuntimeConfig,
    resolver: ComponentResolver,
    store: ComponentStore,
    allocator: InstanceAllocator,
    players: BTreeMap<PlayerId, SessionPlayer>,
}

impl ServerRuntime {
    /// Create a runtime over `registry`.
    pub fn new(registry: Arc<Registry>, config: RuntimeConfig) -> Self {
        Self {
            config,
            resolver: ComponentResolver::new(Arc::clone(&registry)),
            store: ComponentStore::new(registry),
            allocator: InstanceAllocator::new(),
            players: BTreeMap::new(),
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

    /// Instance id table.
    pub fn allocator(&self) -> &InstanceAllocator {
        &self.allocator
    }

    /// Listen for fresh instance ids.
    pub fn subscribe_addressable(&self) -> broadcast::Receiver<Addressable> {
        self.allocator.subscribe()
    }

    // =========================================================================
    // PLAYERS
    // =========================================================================

    /// Admit a player: announce every addressable instance and component.
    pub fn player_joined(
        &mut self,
        player: PlayerId,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<(), RuntimeError> {
        if self.players.contains_key(&player) {
            return Err(RuntimeError::AlreadyJoined(player));
        }

        for entry in self.allocator.entries() {
            let _ = sender.send(ServerMessage::ReceiveInstanceId {
                instance: entry.instance,
                metadata: entry.metadata,
                id: entry.id,
            });
        }
        for component in self.store.iter() {
            if let Ok(reference) = component.reference() {
                let _ = sender.send(ServerMessage::ComponentInteraction {
                    reference,
                    instance: component.instance(),
                    interaction: Interaction::Add,
                });
            }
        }

        self.players.insert(player, SessionPlayer { sender, joined_at: Utc::now() });
        info!("Player {} joined ({} players)", player, self.players.len());
        Ok(())
    }

    /// Drop a player, disconnecting them from every component.
    pub fn player_left(&mut self, player: &PlayerId) -> bool {
        if self.players.remove(player).is_none() {
            return false;
        }
        for component in self.store.iter_mut() {
            component.player_left(player);
        }
        self.flush();
        info!("Player {} left ({} players)", player, self.players.len());
        true
    }

    /// True if `player` has joined.
    pub fn is_joined(&self, player: &PlayerId) -> bool {
        self.players.contains_key(player)
    }

    /// Joined players.
    pub fn players(&self) -> impl Iterator<Item = (&PlayerId, &SessionPlayer)> {
        self.players.iter()
    }

    /// Number of joined players.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    // =========================================================================
    // COMPONENTS
    // =========================================================================

    /// Attach a component of marker type `T` to `instance`.
    pub fn add<T: 'static>(&mut self, instance: InstanceHandle) -> Result<ComponentKey, RuntimeError> {
        let key = TypeKey::of::<T>();
        let descriptor = self
            .registry()
            .descriptor_for(key)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownType(ComponentTypeId::new(key.name())))?;
        self.add_descriptor(instance, descriptor)
    }

    /// Attach a component of type `id` to `instance`.
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
        self.add_descriptor(instance, descriptor)
    }

    fn add_descriptor(
        &mut self,
        instance: InstanceHandle,
        descriptor: Arc<ComponentDescriptor>,
    ) -> Result<ComponentKey, RuntimeError> {
        if descriptor.is_abstract() {
            return Err(RuntimeError::AbstractType(descriptor.id().clone()));
        }

        let shared = self.registry().shared_type_of(descriptor.type_key());
        let allocation = self.allocator.allocate(instance, &shared);
        if allocation.fresh {
            self.send_to(
                &Recipients::All,
                ServerMessage::ReceiveInstanceId {
                    instance,
                    metadata: shared.clone(),
                    id: allocation.id.clone(),
                },
            );
        }

        let key = self.store.next_key();
        let component = SharedComponent::new_server(
            key,
            descriptor,
            instance,
            shared,
            allocation.id,
            &self.config,
        );
        let reference = component.reference()?;
        debug!("Added {} as {}", reference, key);
        self.store.insert(component);

        self.send_to(
            &Recipients::All,
            ServerMessage::ComponentInteraction {
                reference,
                instance,
                interaction: Interaction::Add,
            },
        );
        Ok(key)
    }

    /// Destroy a component and tell every player.
    pub fn remove_component(&mut self, key: ComponentKey) -> Result<(), RuntimeError> {
        let mut component = self.store.remove(key).ok_or(RuntimeError::UnknownComponent(key))?;
        let reference = component.reference();
        component.destroy();

        let instance = component.instance();
        let shared = component.shared_type().clone();
        let still_used = self
            .store
            .on_instance(instance)
            .iter()
            .filter_map(|k| self.store.get(*k))
            .any(|c| *c.shared_type() == shared);
        if !still_used {
            self.allocator.release(instance, &shared);
        }

        if let Ok(reference) = reference {
            self.send_to(
                &Recipients::All,
                ServerMessage::ComponentInteraction {
                    reference,
                    instance,
                    interaction: Interaction::Remove,
                },
            );
        }
        Ok(())
    }

    /// Component by key.
    pub fn component(&self, key: ComponentKey) -> Option<&SharedComponent> {
        self.store.get(key)
    }

    /// Live components.
    pub fn store(&self) -> &ComponentStore {
        &self.store
    }

    /// Run `f` on a component, then deliver whatever it queued.
    pub fn with_component<R>(
        &mut self,
        key: ComponentKey,
        f: impl FnOnce(&mut SharedComponent) -> R,
    ) -> Result<R, RuntimeError> {
        let component = self.store.get_mut(key).ok_or(RuntimeError::UnknownComponent(key))?;
        let result = f(component);
        self.flush();
        Ok(result)
    }

    /// Replace a component's state.
    pub fn dispatch(&mut self, key: ComponentKey, state: Value) -> Result<(), RuntimeError> {
        self.with_component(key, |c| c.dispatch(state))??;
        Ok(())
    }

    /// Run a named action on a component.
    pub fn call_action(&mut self, key: ComponentKey, name: &str, args: &[Value]) -> Result<(), RuntimeError> {
        self.with_component(key, |c| c.call_action(name, args))??;
        Ok(())
    }

    /// Fire a server event.
    pub fn fire_event(
        &mut self,
        key: ComponentKey,
        name: &str,
        to: Recipients,
        args: Vec<Value>,
    ) -> Result<(), RuntimeError> {
        self.with_component(key, |c| c.fire_event(name, to, args))??;
        Ok(())
    }

    /// Bind a remote function handler.
    pub fn on_request<F>(&mut self, key: ComponentKey, name: &str, handler: F) -> Result<(), RuntimeError>
    where
        F: Fn(&mut SharedComponent, &PlayerId, Vec<Value>) -> Value + Send + Sync + 'static,
    {
        self.with_component(key, |c| c.on_request(name, handler))
    }

    /// Add a client event listener.
    pub fn on_client_event<F>(&mut self, key: ComponentKey, name: &str, handler: F) -> Result<(), RuntimeError>
    where
        F: Fn(&mut SharedComponent, &PlayerId, Vec<Value>) + Send + Sync + 'static,
    {
        self.with_component(key, |c| c.on_client_event(name, handler))
    }

    /// Server-initiated disconnect; the client is told.
    pub fn disconnect_player(&mut self, key: ComponentKey, player: &PlayerId) -> Result<(), RuntimeError> {
        self.with_component(key, |c| c.disconnect_player(player, true))??;
        Ok(())
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    fn resolve(&self, reference: &ComponentReference) -> Result<ComponentKey, ResolveError> {
        self.resolver.resolve(reference, &self.allocator, &self.store)
    }

    /// Route one message from `player`.
    pub fn handle_client_message(&mut self, player: PlayerId, message: ClientMessage) {
        if !self.players.contains_key(&player) {
            warn!("Message from unknown player {}", player);
            return;
        }

        match message {
            ClientMessage::Auth(_) => {
                debug!("Ignoring repeated auth from {}", player);
            }

            ClientMessage::Ping { timestamp } => {
                let server_time = Utc::now().timestamp_millis().max(0) as u64;
                self.send_to(&Recipients::Player(player), ServerMessage::Pong { timestamp, server_time });
            }

            ClientMessage::Start { reference } => self.handle_start(player, &reference),

            ClientMessage::GetInstanceId { request_id, instance, metadata } => {
                let id = self.allocator.lookup(instance, &metadata).cloned();
                if id.is_none() {
                    debug!("No id yet for {} ({})", instance, metadata);
                }
                self.send_to(
                    &Recipients::Player(player),
                    ServerMessage::InstanceIdResponse { request_id, id },
                );
            }

            ClientMessage::RemoteEvent { reference, name, args } => {
                if let Ok(key) = self.resolve(&reference) {
                    if let Some(component) = self.store.get_mut(key) {
                        component.handle_client_event(&player, &name, args);
                    }
                }
            }

            ClientMessage::RemoteFunction { request_id, reference, name, args } => {
                let outcome = match self.resolve(&reference) {
                    Ok(key) => match self.store.get_mut(key) {
                        Some(component) => component.handle_request(&player, &name, args),
                        None => RemoteOutcome::Unresolved,
                    },
                    Err(_) => RemoteOutcome::Unresolved,
                };
                self.send_to(
                    &Recipients::Player(player),
                    ServerMessage::FunctionResponse { request_id, outcome },
                );
            }

            ClientMessage::ConnectionRequest { request_id, reference, action } => {
                let (success, instance_id) = self.handle_connection(player, &reference, action);
                self.send_to(
                    &Recipients::Player(player),
                    ServerMessage::ConnectionResponse { request_id, success, instance_id },
                );
            }
        }

        self.flush();
    }

    fn handle_start(&mut self, player: PlayerId, reference: &ComponentReference) {
        let Ok(key) = self.resolve(reference) else {
            return;
        };
        let Some(component) = self.store.get_mut(key) else {
            return;
        };

        match component.descriptor().sync_scope() {
            SyncScope::Started => {
                if !component.add_observer(player) {
                    component.rehydrate(&player);
                }
            }
            SyncScope::Connected => {
                if component.is_connected_player(&player) {
                    component.rehydrate(&player);
                } else {
                    debug!("Start from {} for {} before connecting", player, reference);
                }
            }
        }
    }

    fn handle_connection(
        &mut self,
        player: PlayerId,
        reference: &ComponentReference,
        action: PlayerAction,
    ) -> (bool, String) {
        let Ok(key) = self.resolve(reference) else {
            return (false, String::new());
        };
        let Some(component) = self.store.get_mut(key) else {
            return (false, String::new());
        };

        let result = match action {
            PlayerAction::Connect => component.connect_player(player),
            PlayerAction::Disconnect => component.disconnect_player(&player, false),
        };
        match result {
            Ok(()) => {
                let id = component.instance_id().map(|id| id.to_string()).unwrap_or_default();
                (true, id)
            }
            Err(err) => {
                debug!("{:?} of {} on {} refused: {}", action, player, reference, err);
                (false, String::new())
            }
        }
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Deliver everything components have queued.
    pub fn flush(&mut self) {
        let mut queued: Vec<(ComponentKey, Outbound)> = Vec::new();
        for component in self.store.iter_mut() {
            let key = component.key();
            queued.extend(component.take_outbox().into_iter().map(|o| (key, o)));
        }

        for (key, outbound) in queued {
            let is_sync = matches!(outbound.message, ServerMessage::Dispatch { .. });
            let failed = self.send_to(&outbound.to, outbound.message);
            if is_sync && !failed.is_empty() {
                if let Some(component) = self.store.get_mut(key) {
                    for player in &failed {
                        warn!("Sync to {} failed; it will be re-hydrated", player);
                        component.mark_desynced(player);
                    }
                }
            }
        }
    }

    /// Send `message` to `to`. Returns the players whose queue is closed.
    fn send_to(&self, to: &Recipients, message: ServerMessage) -> Vec<PlayerId> {
        let targets: Vec<PlayerId> = match to {
            Recipients::Player(player) => vec![*player],
            Recipients::Players(players) => players.clone(),
            Recipients::Except(excluded) => self
                .players
                .keys()
                .filter(|p| !excluded.contains(p))
                .copied()
                .collect(),
            Recipients::All => self.players.keys().copied().collect(),
        };

        let mut failed = Vec::new();
        for player in targets {
            match self.players.get(&player) {
                Some(session) => {
                    if session.sender.send(message.clone()).is_err() {
                        failed.push(player);
                    }
                }
                None => debug!("Dropping message for absent player {}", player),
            }
        }
        failed
    }
}

impl std::fmt::Debug for ServerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRuntime")
            .field("components", &self.store.len())
            .field("players", &self.players.len())
            .field("ids", &self.allocator.len())
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
    use crate::core::ids::InstanceId;
    use crate::network::protocol::NOT_CONNECTED;
    use serde_json::json;

    const ALICE: PlayerId = PlayerId::new([1; 16]);
    const BOB: PlayerId = PlayerId::new([2; 16]);

    struct Counter;
    struct Lobby;

    fn registry() -> Arc<Registry> {
        let counter = ComponentDescriptor::builder::<Counter>("Counter")
            .initial_state(json!({ "value": 0 }))
            .remote_function("add", guard::typed::<(i64,)>())
            .action("add", |state, args| {
                json!({ "value": state["value"].as_i64().unwrap_or(0) + args[0].as_i64().unwrap_or(0) })
            })
            .on_request("add", |component, _, args| {
                let _ = component.call_action("add", &args);
                component.state()["value"].clone()
            })
            .build();
        let lobby = ComponentDescriptor::builder::<Lobby>("Lobby")
            .initial_state(json!({ "open": true }))
            .sync_scope(SyncScope::Started)
            .build();
        Registry::builder().component(counter).component(lobby).build()
    }

    fn runtime() -> ServerRuntime {
        ServerRuntime::new(registry(), RuntimeConfig::default())
    }

    fn join(rt: &mut ServerRuntime, player: PlayerId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        rt.player_joined(player, tx).unwrap();
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn reference(rt: &ServerRuntime, key: ComponentKey) -> ComponentReference {
        rt.component(key).unwrap().reference().unwrap()
    }

    fn connect(rt: &mut ServerRuntime, player: PlayerId, key: ComponentKey, request_id: u64) {
        let reference = reference(rt, key);
        rt.handle_client_message(
            player,
            ClientMessage::ConnectionRequest { request_id, reference, action: PlayerAction::Connect },
        );
    }

    fn call(rt: &mut ServerRuntime, player: PlayerId, key: ComponentKey, args: Vec<Value>) {
        let reference = reference(rt, key);
        rt.handle_client_message(
            player,
            ClientMessage::RemoteFunction { request_id: 9, reference, name: "add".into(), args },
        );
    }

    #[tokio::test]
    async fn test_join_announces_existing_components() {
        let mut rt = runtime();
        let key = rt.add::<Counter>(InstanceHandle(1)).unwrap();
        let mut rx = join(&mut rt, ALICE);

        let messages = drain(&mut rx);
        assert!(matches!(&messages[0], ServerMessage::ReceiveInstanceId { instance: InstanceHandle(1), .. }));
        match &messages[1] {
            ServerMessage::ComponentInteraction { reference: r, interaction, .. } => {
                assert_eq!(*interaction, Interaction::Add);
                assert_eq!(*r, reference(&rt, key));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_broadcasts_fresh_id_once() {
        let mut rt = runtime();
        let mut rx = join(&mut rt, ALICE);
        rt.add::<Counter>(InstanceHandle(1)).unwrap();
        rt.add::<Lobby>(InstanceHandle(1)).unwrap();

        let ids = drain(&mut rx)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::ReceiveInstanceId { .. }))
            .count();
        assert_eq!(ids, 2);
        assert_eq!(rt.allocator().len(), 2);
    }

    #[tokio::test]
    async fn test_connect_hydrates_and_double_connect_fails() {
        let mut rt = runtime();
        let key = rt.add::<Counter>(InstanceHandle(1)).unwrap();
        let mut rx = join(&mut rt, ALICE);
        drain(&mut rx);

        connect(&mut rt, ALICE, key, 1);
        let messages = drain(&mut rx);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::ConnectionResponse { request_id: 1, success: true, .. }
        )));
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::Dispatch { frame, .. } if frame.payload.is_init()
        )));

        connect(&mut rt, ALICE, key, 2);
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::ConnectionResponse { success, instance_id, .. } => {
                assert!(!success);
                assert!(instance_id.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_function_after_disconnect_is_not_connected() {
        let mut rt = runtime();
        let key = rt.add::<Counter>(InstanceHandle(1)).unwrap();
        let mut rx = join(&mut rt, ALICE);
        connect(&mut rt, ALICE, key, 1);

        call(&mut rt, ALICE, key, vec![json!(5)]);
        let reference = reference(&rt, key);
        rt.handle_client_message(
            ALICE,
            ClientMessage::ConnectionRequest { request_id: 2, reference, action: PlayerAction::Disconnect },
        );
        drain(&mut rx);

        call(&mut rt, ALICE, key, vec![json!(5)]);
        let messages = drain(&mut rx);
        match &messages[0] {
            ServerMessage::FunctionResponse { outcome, .. } => {
                assert_eq!(outcome.sentinel(), Some(NOT_CONNECTED));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rt.component(key).unwrap().state(), &json!({ "value": 5 }));
    }

    #[tokio::test]
    async fn test_unresolved_function_reply() {
        let mut rt = runtime();
        let mut rx = join(&mut rt, ALICE);
        let reference = ComponentReference {
            instance_id: InstanceId::new("missing"),
            identifier: "Counter".into(),
            shared_identifier: "Counter".into(),
            pointer_id: None,
        };
        rt.handle_client_message(
            ALICE,
            ClientMessage::RemoteFunction { request_id: 3, reference, name: "add".into(), args: vec![] },
        );
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::FunctionResponse { request_id: 3, outcome: RemoteOutcome::Unresolved }]
        ));
    }

    #[tokio::test]
    async fn test_started_scope_hydrates_on_start() {
        let mut rt = runtime();
        let key = rt.add::<Lobby>(InstanceHandle(2)).unwrap();
        let mut rx = join(&mut rt, BOB);
        drain(&mut rx);

        let reference = reference(&rt, key);
        rt.handle_client_message(BOB, ClientMessage::Start { reference: reference.clone() });
        let first = drain(&mut rx);
        assert!(matches!(&first[..], [ServerMessage::Dispatch { frame, .. }] if frame.epoch == 1));

        rt.handle_client_message(BOB, ClientMessage::Start { reference });
        let second = drain(&mut rx);
        assert!(matches!(&second[..], [ServerMessage::Dispatch { frame, .. }] if frame.epoch == 2 && frame.payload.is_init()));
    }

    #[tokio::test]
    async fn test_connected_scope_ignores_start_before_connect() {
        let mut rt = runtime();
        let key = rt.add::<Counter>(InstanceHandle(1)).unwrap();
        let mut rx = join(&mut rt, ALICE);
        drain(&mut rx);

        let reference = reference(&rt, key);
        rt.handle_client_message(ALICE, ClientMessage::Start { reference });
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_get_instance_id() {
        let mut rt = runtime();
        let key = rt.add::<Counter>(InstanceHandle(1)).unwrap();
        let mut rx = join(&mut rt, ALICE);
        drain(&mut rx);

        rt.handle_client_message(
            ALICE,
            ClientMessage::GetInstanceId { request_id: 1, instance: InstanceHandle(1), metadata: "Counter".into() },
        );
        rt.handle_client_message(
            ALICE,
            ClientMessage::GetInstanceId { request_id: 2, instance: InstanceHandle(9), metadata: "Counter".into() },
        );

        let expected = rt.component(key).unwrap().instance_id().cloned();
        let messages = drain(&mut rx);
        assert!(matches!(&messages[0], ServerMessage::InstanceIdResponse { request_id: 1, id } if *id == expected));
        assert!(matches!(&messages[1], ServerMessage::InstanceIdResponse { request_id: 2, id: None }));
    }

    #[tokio::test]
    async fn test_player_left_disconnects_everywhere() {
        let mut rt = runtime();
        let key = rt.add::<Counter>(InstanceHandle(1)).unwrap();
        let _rx = join(&mut rt, ALICE);
        connect(&mut rt, ALICE, key, 1);
        assert!(rt.component(key).unwrap().is_connected_player(&ALICE));

        assert!(rt.player_left(&ALICE));
        assert!(!rt.component(key).unwrap().is_connected_player(&ALICE));
        assert!(!rt.player_left(&ALICE));
    }

    #[tokio::test]
    async fn test_remove_component_releases_id() {
        let mut rt = runtime();
        let key = rt.add::<Counter>(InstanceHandle(1)).unwrap();
        let mut rx = join(&mut rt, ALICE);
        drain(&mut rx);

        rt.remove_component(key).unwrap();
        assert!(rt.allocator().is_empty());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::ComponentInteraction { interaction: Interaction::Remove, .. }]
        ));
        assert!(matches!(rt.remove_component(key), Err(RuntimeError::UnknownComponent(_))));
    }

    #[tokio::test]
    async fn test_closed_queue_desyncs_observer() {
        let mut rt = runtime();
        let key = rt.add::<Counter>(InstanceHandle(1)).unwrap();
        let rx = join(&mut rt, ALICE);
        connect(&mut rt, ALICE, key, 1);
        drop(rx);

        rt.dispatch(key, json!({ "value": 1 })).unwrap();
        assert!(rt.component(key).unwrap().is_observing(&ALICE));
    }

    #[tokio::test]
    async fn test_abstract_and_unknown_types_rejected() {
        struct Base;
        let base = ComponentDescriptor::builder::<Base>("Base").abstract_type().build();
        let mut rt = ServerRuntime::new(Registry::builder().component(base).build(), RuntimeConfig::default());

        assert!(matches!(rt.add::<Base>(InstanceHandle(1)), Err(RuntimeError::AbstractType(_))));
        assert!(matches!(
            rt.add_component(InstanceHandle(1), &"Nope".into()),
            Err(RuntimeError::UnknownType(_))
        ));
    }
}
