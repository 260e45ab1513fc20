//! In-process loopback between one server runtime and several clients.
//!
//! Messages travel over the same unbounded queues the WebSocket transports
//! use; [`Loopback::pump`] shuttles them until both directions are quiet.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::RuntimeConfig;
use crate::core::ids::PlayerId;
use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::registry::Registry;
use crate::runtime::{ClientRuntime, ServerRuntime};

pub(crate) struct LoopClient {
    pub player: PlayerId,
    pub runtime: ClientRuntime,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

pub(crate) struct Loopback {
    pub server: ServerRuntime,
    pub clients: Vec<LoopClient>,
}

impl Loopback {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            server: ServerRuntime::new(registry, RuntimeConfig::default()),
            clients: Vec::new(),
        }
    }

    /// Join a new player whose client uses `registry`. Returns its index.
    pub fn join(&mut self, registry: Arc<Registry>) -> usize {
        let player = PlayerId::random();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (to_server, outbound) = mpsc::unbounded_channel();
        self.server.player_joined(player, to_client).unwrap();
        self.clients.push(LoopClient {
            player,
            runtime: ClientRuntime::new(registry, RuntimeConfig::default(), to_server),
            outbound,
            inbound,
        });
        self.pump();
        self.clients.len() - 1
    }

    pub fn client(&mut self, index: usize) -> &mut ClientRuntime {
        &mut self.clients[index].runtime
    }

    pub fn player(&self, index: usize) -> PlayerId {
        self.clients[index].player
    }

    /// Deliver queued messages both ways until nothing moves.
    pub fn pump(&mut self) {
        loop {
            let mut moved = false;
            for client in &mut self.clients {
                while let Ok(message) = client.outbound.try_recv() {
                    self.server.handle_client_message(client.player, message);
                    moved = true;
                }
            }
            for client in &mut self.clients {
                while let Ok(message) = client.inbound.try_recv() {
                    client.runtime.handle_server_message(message);
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::descriptor::{ComponentDescriptor, SyncScope};
    use crate::component::guard;
    use crate::component::hooks::ComponentHooks;
    use crate::component::shared::Recipients;
    use crate::core::ids::{ComponentKey, InstanceHandle};
    use crate::network::protocol::NOT_CONNECTED;
    use crate::runtime::CallError;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Storage;
    struct MoneyStorage;
    struct ItemStorage;
    struct ClientMoney;
    struct Vault;

    struct HideBalances;

    impl ComponentHooks for HideBalances {
        fn sync_for_player(&self, player: &PlayerId, mut state: Value) -> Value {
            let own = player.to_uuid_string();
            if let Some(balances) = state.get_mut("balances").and_then(Value::as_object_mut) {
                balances.retain(|k, _| *k == own);
            }
            state
        }
    }

    struct CountDisconnects(Arc<AtomicUsize>);

    impl ComponentHooks for CountDisconnects {
        fn on_disconnected(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn storage() -> Arc<ComponentDescriptor> {
        ComponentDescriptor::builder::<Storage>("Storage")
            .initial_state(json!({ "amount": 0 }))
            .remote_function("buy", guard::typed::<(i64,)>())
            .server_event("notify", guard::any())
            .abstract_type()
            .build()
    }

    fn server_registry() -> Arc<Registry> {
        let storage = storage();
        let money = ComponentDescriptor::builder::<MoneyStorage>("MoneyStorage")
            .extends(&storage)
            .on_request("buy", |component, _player, args| {
                let price = args[0].as_i64().unwrap_or(0);
                let amount = component.state()["amount"].as_i64().unwrap_or(0);
                let _ = component.dispatch(json!({ "amount": amount - price }));
                json!(amount - price)
            })
            .build();
        let items = ComponentDescriptor::builder::<ItemStorage>("ItemStorage")
            .extends(&storage)
            .build();
        let vault = ComponentDescriptor::builder::<Vault>("Vault")
            .initial_state(json!({ "balances": {} }))
            .sync_scope(SyncScope::Started)
            .hooks(|| HideBalances)
            .build();
        Registry::builder()
            .component(storage)
            .component(money)
            .component(items)
            .component(vault)
            .build()
    }

    fn client_registry() -> Arc<Registry> {
        let storage = storage();
        let money = ComponentDescriptor::builder::<ClientMoney>("ClientMoney")
            .extends(&storage)
            .build();
        let vault = ComponentDescriptor::builder::<Vault>("Vault")
            .initial_state(json!({ "balances": {} }))
            .sync_scope(SyncScope::Started)
            .build();
        Registry::builder().component(storage).component(money).component(vault).build()
    }

    fn replica(lb: &Loopback, index: usize, instance: u64) -> ComponentKey {
        let store = lb.clients[index].runtime.store();
        *store.on_instance(InstanceHandle(instance)).first().unwrap()
    }

    async fn connect(lb: &mut Loopback, index: usize, key: ComponentKey) -> bool {
        let pending = lb.client(index).connect(key).unwrap();
        lb.pump();
        pending.wait().await.unwrap()
    }

    #[tokio::test]
    async fn test_hydrate_then_patch() {
        let mut lb = Loopback::new(server_registry());
        let server_key = lb.server.add::<MoneyStorage>(InstanceHandle(1)).unwrap();
        lb.server.dispatch(server_key, json!({ "amount": 100 })).unwrap();
        let c = lb.join(client_registry());

        let key = replica(&lb, c, 1);
        assert_eq!(lb.client(c).component(key).unwrap().type_id().as_str(), "ClientMoney");
        assert!(!lb.client(c).component(key).unwrap().is_ready());

        let ready = lb.client(c).ready(key).unwrap();
        assert!(connect(&mut lb, c, key).await);
        assert!(ready.wait().await);
        assert_eq!(lb.client(c).state(key), Some(&json!({ "amount": 100 })));

        lb.server.dispatch(server_key, json!({ "amount": 75 })).unwrap();
        lb.pump();
        assert_eq!(lb.client(c).state(key), Some(&json!({ "amount": 75 })));
    }

    #[tokio::test]
    async fn test_remote_function_then_not_connected_after_disconnect() {
        let mut lb = Loopback::new(server_registry());
        lb.server.add::<MoneyStorage>(InstanceHandle(1)).unwrap();
        let c = lb.join(client_registry());
        let key = replica(&lb, c, 1);

        let early = lb.client(c).invoke(key, "buy", vec![json!(5)]).unwrap();
        lb.pump();
        assert_eq!(early.wait().await, Err(CallError::Rejected(NOT_CONNECTED)));

        assert!(connect(&mut lb, c, key).await);
        let call = lb.client(c).invoke(key, "buy", vec![json!(30)]).unwrap();
        lb.pump();
        assert_eq!(call.wait().await, Ok(json!(-30)));
        assert_eq!(lb.client(c).state(key), Some(&json!({ "amount": -30 })));

        let pending = lb.client(c).disconnect(key).unwrap();
        lb.pump();
        assert!(pending.wait().await.unwrap());

        let late = lb.client(c).invoke(key, "buy", vec![json!(1)]).unwrap();
        lb.pump();
        assert_eq!(late.wait().await, Err(CallError::Rejected(NOT_CONNECTED)));
    }

    #[tokio::test]
    async fn test_guard_rejects_before_sending() {
        let mut lb = Loopback::new(server_registry());
        lb.server.add::<MoneyStorage>(InstanceHandle(1)).unwrap();
        let c = lb.join(client_registry());
        let key = replica(&lb, c, 1);

        let err = lb.client(c).invoke(key, "buy", vec![json!("free")]).unwrap_err();
        assert!(matches!(err, CallError::Remote(_)));
    }

    #[tokio::test]
    async fn test_shared_type_ambiguity_is_unresolved() {
        let mut lb = Loopback::new(server_registry());
        lb.server.add::<MoneyStorage>(InstanceHandle(1)).unwrap();
        lb.server.add::<ItemStorage>(InstanceHandle(1)).unwrap();
        let c = lb.join(client_registry());

        // Both server types mirror to the one local Storage type.
        let keys = lb.clients[c].runtime.store().on_instance(InstanceHandle(1)).to_vec();
        assert_eq!(keys.len(), 1);

        let call = lb.client(c).invoke(keys[0], "buy", vec![json!(1)]).unwrap();
        lb.pump();
        assert_eq!(call.wait().await, Err(CallError::Unresolved));
    }

    #[tokio::test]
    async fn test_double_connect_fails() {
        let mut lb = Loopback::new(server_registry());
        let server_key = lb.server.add::<MoneyStorage>(InstanceHandle(1)).unwrap();
        let c = lb.join(client_registry());
        let key = replica(&lb, c, 1);

        assert!(connect(&mut lb, c, key).await);
        assert!(!connect(&mut lb, c, key).await);
        let player = lb.player(c);
        assert!(lb.server.component(server_key).unwrap().is_connected_player(&player));
    }

    #[tokio::test]
    async fn test_fresh_id_resolves_without_waiting() {
        let mut lb = Loopback::new(server_registry());
        let c = lb.join(client_registry());

        let server_key = lb.server.add::<MoneyStorage>(InstanceHandle(9)).unwrap();
        lb.pump();

        let id = lb.server.component(server_key).unwrap().instance_id().cloned().unwrap();
        let pending = lb.client(c).resolve_local_instance(&id, None);
        assert_eq!(pending.now(), Some(InstanceHandle(9)));
    }

    #[tokio::test]
    async fn test_redaction_per_player() {
        let mut lb = Loopback::new(server_registry());
        let a = lb.join(client_registry());
        let b = lb.join(client_registry());
        let (pa, pb) = (lb.player(a), lb.player(b));

        let server_key = lb.server.add::<Vault>(InstanceHandle(3)).unwrap();
        let mut balances = serde_json::Map::new();
        balances.insert(pa.to_uuid_string(), json!(10));
        balances.insert(pb.to_uuid_string(), json!(20));
        lb.server.dispatch(server_key, json!({ "balances": balances })).unwrap();
        lb.pump();

        let ka = replica(&lb, a, 3);
        let kb = replica(&lb, b, 3);
        let seen_a = lb.client(a).state(ka).unwrap().clone();
        let seen_b = lb.client(b).state(kb).unwrap().clone();
        assert_eq!(seen_a["balances"].as_object().unwrap().len(), 1);
        assert_eq!(seen_a["balances"][pa.to_uuid_string()], json!(10));
        assert_eq!(seen_b["balances"][pb.to_uuid_string()], json!(20));

        let canonical = lb.server.component(server_key).unwrap().state();
        assert_eq!(canonical["balances"].as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_server_event_reaches_targets() {
        let mut lb = Loopback::new(server_registry());
        let server_key = lb.server.add::<MoneyStorage>(InstanceHandle(1)).unwrap();
        let a = lb.join(client_registry());
        let b = lb.join(client_registry());

        let received: Arc<Mutex<Vec<(usize, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        for index in [a, b] {
            let key = replica(&lb, index, 1);
            let sink = Arc::clone(&received);
            lb.client(index)
                .with_component(key, move |c| {
                    c.on_server_event("notify", move |_, args| {
                        sink.lock().unwrap().push((index, args[0].clone()));
                    })
                })
                .unwrap();
        }

        let only_b = Recipients::Player(lb.player(b));
        lb.server.fire_event(server_key, "notify", only_b, vec![json!("sale")]).unwrap();
        lb.pump();
        assert_eq!(*received.lock().unwrap(), vec![(b, json!("sale"))]);

        lb.server.fire_event(server_key, "notify", Recipients::All, vec![json!("all")]).unwrap();
        lb.pump();
        assert_eq!(received.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_player_left_frees_connection() {
        let mut lb = Loopback::new(server_registry());
        let server_key = lb.server.add::<MoneyStorage>(InstanceHandle(1)).unwrap();
        let c = lb.join(client_registry());
        let key = replica(&lb, c, 1);
        assert!(connect(&mut lb, c, key).await);

        let player = lb.player(c);
        assert!(lb.server.player_left(&player));
        assert!(!lb.server.component(server_key).unwrap().is_connected_player(&player));
    }

    #[tokio::test]
    async fn test_client_disconnect_runs_disconnect_hook() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let storage = storage();
        let money = ComponentDescriptor::builder::<ClientMoney>("ClientMoney")
            .extends(&storage)
            .hooks(move || CountDisconnects(Arc::clone(&counter)))
            .build();
        let registry = Registry::builder().component(storage).component(money).build();

        let mut lb = Loopback::new(server_registry());
        let server_key = lb.server.add::<MoneyStorage>(InstanceHandle(1)).unwrap();
        let c = lb.join(registry);
        let key = replica(&lb, c, 1);
        assert!(connect(&mut lb, c, key).await);

        let pending = lb.client(c).disconnect(key).unwrap();
        lb.pump();
        assert_eq!(pending.wait().await, Ok(true));
        assert!(!lb.client(c).component(key).unwrap().is_connected());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let player = lb.player(c);
        assert!(!lb.server.component(server_key).unwrap().is_connected_player(&player));

        // A second disconnect is refused and runs nothing.
        let again = lb.client(c).disconnect(key).unwrap();
        lb.pump();
        assert_eq!(again.wait().await, Ok(false));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
