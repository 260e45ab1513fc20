//! Component Descriptors
//!
//! A descriptor is the declaration of one component type: its id and
//! ancestry, its initial state, the remote channels it exposes, named
//! actions, standing subscriptions and per-component hooks. Descriptors are
//! built once at startup and shared by every instance of the type.
//!
//! ```ignore
//! struct Wallet;
//!
//! let wallet = ComponentDescriptor::builder::<Wallet>("Wallet")
//!     .initial_state(json!({ "money": 0 }))
//!     .remote_function("deposit", guard::typed::<(u64,)>())
//!     .action("deposit", |state, args| {
//!         let money = state["money"].as_u64().unwrap_or(0) + args[0].as_u64().unwrap_or(0);
//!         json!({ "money": money })
//!     })
//!     .build();
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::component::guard::ArgGuard;
use crate::component::hooks::{ComponentHooks, DefaultHooks};
use crate::component::shared::SharedComponent;
use crate::core::atom::Selector;
use crate::core::ids::{ComponentTypeId, PlayerId, PointerId, TypeKey};

/// Direction and shape of a remote channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    /// Fire-and-forget, server to client.
    ServerEvent,
    /// Fire-and-forget, client to server.
    ClientEvent,
    /// Request/response, client to server.
    Function,
}

/// A declared remote channel.
#[derive(Clone)]
pub struct RemoteSpec {
    /// Channel name, unique within the component.
    pub name: String,
    /// Channel kind.
    pub kind: RemoteKind,
    /// Argument validator.
    pub guard: ArgGuard,
}

impl fmt::Debug for RemoteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Pure reducer `(state, args) -> state'`.
pub type ActionReducer = Arc<dyn Fn(&Value, &[Value]) -> Value + Send + Sync>;

/// Server-side handler of a remote function. Its return value is the reply.
pub type RequestHandler = Arc<dyn Fn(&mut SharedComponent, &PlayerId, Vec<Value>) -> Value + Send + Sync>;

/// Server-side listener of a client event.
pub type ClientEventHandler = Arc<dyn Fn(&mut SharedComponent, &PlayerId, Vec<Value>) + Send + Sync>;

/// Client-side listener of a server event.
pub type ServerEventHandler = Arc<dyn Fn(&mut SharedComponent, Vec<Value>) + Send + Sync>;

/// Builds a fresh hooks object for each component instance.
pub type HooksFactory = Arc<dyn Fn() -> Box<dyn ComponentHooks> + Send + Sync>;

/// Standing state subscription attached to every instance.
#[derive(Clone)]
pub struct SubscriptionSpec {
    /// Optional projection; the listener fires only when it changes.
    pub selector: Option<Selector>,
    /// Receives `(current, previous)`.
    pub listener: Arc<dyn Fn(&Value, &Value) + Send + Sync>,
}

/// Who receives state sync for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncScope {
    /// Only players that completed a connection handshake.
    Connected,
    /// Any player that asked for hydration.
    Started,
}

/// Declaration of one component type.
pub struct ComponentDescriptor {
    pub(crate) type_key: TypeKey,
    pub(crate) id: ComponentTypeId,
    pub(crate) parent: Option<TypeKey>,
    pub(crate) implements: Vec<ComponentTypeId>,
    pub(crate) shared_root: bool,
    pub(crate) is_abstract: bool,
    pub(crate) initial_state: Value,
    pub(crate) remotes: BTreeMap<String, RemoteSpec>,
    pub(crate) actions: BTreeMap<String, ActionReducer>,
    pub(crate) subscriptions: Vec<SubscriptionSpec>,
    pub(crate) pointer: Option<PointerId>,
    pub(crate) sync_scope: SyncScope,
    pub(crate) hooks: HooksFactory,
    pub(crate) request_handlers: BTreeMap<String, RequestHandler>,
    pub(crate) client_event_handlers: BTreeMap<String, Vec<ClientEventHandler>>,
    pub(crate) server_event_handlers: BTreeMap<String, Vec<ServerEventHandler>>,
}

impl ComponentDescriptor {
    /// Start declaring marker type `T` under `id`.
    pub fn builder<T: 'static>(id: impl Into<ComponentTypeId>) -> DescriptorBuilder {
        DescriptorBuilder::new(TypeKey::of::<T>(), id.into())
    }

    /// Marker type key.
    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    /// Declared id.
    pub fn id(&self) -> &ComponentTypeId {
        &self.id
    }

    /// Declared parent.
    pub fn parent(&self) -> Option<TypeKey> {
        self.parent
    }

    /// True for types that are never instantiated.
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// State a new instance starts with.
    pub fn initial_state(&self) -> &Value {
        &self.initial_state
    }

    /// Remote channel by name.
    pub fn remote(&self, name: &str) -> Option<&RemoteSpec> {
        self.remotes.get(name)
    }

    /// All remote channels.
    pub fn remotes(&self) -> impl Iterator<Item = &RemoteSpec> {
        self.remotes.values()
    }

    /// Action reducer by name.
    pub fn action(&self, name: &str) -> Option<&ActionReducer> {
        self.actions.get(name)
    }

    /// Declared pointer alias.
    pub fn pointer(&self) -> Option<&PointerId> {
        self.pointer.as_ref()
    }

    /// Sync scope.
    pub fn sync_scope(&self) -> SyncScope {
        self.sync_scope
    }

    /// Build a hooks object for a new instance.
    pub fn make_hooks(&self) -> Box<dyn ComponentHooks> {
        (self.hooks)()
    }
}

impl fmt::Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("id", &self.id)
            .field("type", &self.type_key)
            .field("parent", &self.parent)
            .field("remotes", &self.remotes.keys().collect::<Vec<_>>())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("pointer", &self.pointer)
            .finish()
    }
}

/// Builder for [`ComponentDescriptor`].
pub struct DescriptorBuilder {
    inner: ComponentDescriptor,
}

impl DescriptorBuilder {
    fn new(type_key: TypeKey, id: ComponentTypeId) -> Self {
        Self {
            inner: ComponentDescriptor {
                type_key,
                id,
                parent: None,
                implements: Vec::new(),
                shared_root: false,
                is_abstract: false,
                initial_state: Value::Object(Default::default()),
                remotes: BTreeMap::new(),
                actions: BTreeMap::new(),
                subscriptions: Vec::new(),
                pointer: None,
                sync_scope: SyncScope::Connected,
                hooks: Arc::new(|| Box::new(DefaultHooks)),
                request_handlers: BTreeMap::new(),
                client_event_handlers: BTreeMap::new(),
                server_event_handlers: BTreeMap::new(),
            },
        }
    }

    /// Inherit from `parent`: its ancestry, state, channels, actions,
    /// subscriptions, scope, hooks and handlers. Call before overriding any
    /// of those.
    pub fn extends(mut self, parent: &ComponentDescriptor) -> Self {
        let d = &mut self.inner;
        d.parent = Some(parent.type_key);
        d.initial_state = parent.initial_state.clone();
        d.remotes = parent.remotes.clone();
        d.actions = parent.actions.clone();
        d.subscriptions = parent.subscriptions.clone();
        d.sync_scope = parent.sync_scope;
        d.hooks = Arc::clone(&parent.hooks);
        d.request_handlers = parent.request_handlers.clone();
        d.client_event_handlers = parent.client_event_handlers.clone();
        d.server_event_handlers = parent.server_event_handlers.clone();
        self
    }

    /// Declare an extra id this type satisfies.
    pub fn implements(mut self, id: impl Into<ComponentTypeId>) -> Self {
        let id = id.into();
        if !self.inner.implements.contains(&id) {
            self.inner.implements.push(id);
        }
        self
    }

    /// Address descendants of this type by this type's id.
    pub fn shared_root(mut self) -> Self {
        self.inner.shared_root = true;
        self
    }

    /// Never instantiate this type directly.
    pub fn abstract_type(mut self) -> Self {
        self.inner.is_abstract = true;
        self
    }

    /// Initial state of new instances.
    pub fn initial_state(mut self, state: Value) -> Self {
        self.inner.initial_state = state;
        self
    }

    fn remote(mut self, name: &str, kind: RemoteKind, guard: ArgGuard) -> Self {
        self.inner.remotes.insert(
            name.to_string(),
            RemoteSpec { name: name.to_string(), kind, guard },
        );
        self
    }

    /// Declare a server-to-client event.
    pub fn server_event(self, name: &str, guard: ArgGuard) -> Self {
        self.remote(name, RemoteKind::ServerEvent, guard)
    }

    /// Declare a client-to-server event.
    pub fn client_event(self, name: &str, guard: ArgGuard) -> Self {
        self.remote(name, RemoteKind::ClientEvent, guard)
    }

    /// Declare a client-to-server remote function.
    pub fn remote_function(self, name: &str, guard: ArgGuard) -> Self {
        self.remote(name, RemoteKind::Function, guard)
    }

    /// Register a named reducer. Invoking it dispatches its result.
    pub fn action<F>(mut self, name: &str, reducer: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Value + Send + Sync + 'static,
    {
        self.inner.actions.insert(name.to_string(), Arc::new(reducer));
        self
    }

    /// Standing listener on the whole state.
    pub fn subscribe<F>(mut self, listener: F) -> Self
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.inner.subscriptions.push(SubscriptionSpec {
            selector: None,
            listener: Arc::new(listener),
        });
        self
    }

    /// Standing listener on a projection of the state.
    pub fn subscribe_selector<S, F>(mut self, selector: S, listener: F) -> Self
    where
        S: Fn(&Value) -> Value + Send + Sync + 'static,
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.inner.subscriptions.push(SubscriptionSpec {
            selector: Some(Arc::new(selector)),
            listener: Arc::new(listener),
        });
        self
    }

    /// Network alias this type answers to.
    pub fn pointer(mut self, pointer: impl Into<PointerId>) -> Self {
        self.inner.pointer = Some(pointer.into());
        self
    }

    /// Who receives state sync.
    pub fn sync_scope(mut self, scope: SyncScope) -> Self {
        self.inner.sync_scope = scope;
        self
    }

    /// Per-instance hooks.
    pub fn hooks<H, F>(mut self, factory: F) -> Self
    where
        H: ComponentHooks + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.inner.hooks = Arc::new(move || Box::new(factory()));
        self
    }

    /// Server handler for a remote function.
    pub fn on_request<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut SharedComponent, &PlayerId, Vec<Value>) -> Value + Send + Sync + 'static,
    {
        self.inner.request_handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    /// Server listener for a client event.
    pub fn on_client_event<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut SharedComponent, &PlayerId, Vec<Value>) + Send + Sync + 'static,
    {
        self.inner
            .client_event_handlers
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Client listener for a server event.
    pub fn on_server_event<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut SharedComponent, Vec<Value>) + Send + Sync + 'static,
    {
        self.inner
            .server_event_handlers
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Finish the declaration.
    pub fn build(self) -> Arc<ComponentDescriptor> {
        Arc::new(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::guard;
    use serde_json::json;

    struct Base;
    struct Derived;

    #[test]
    fn test_builder_records_declarations() {
        let desc = ComponentDescriptor::builder::<Base>("Base")
            .initial_state(json!({ "value": 0 }))
            .server_event("ping", guard::any())
            .client_event("pong", guard::no_args())
            .remote_function("increment", guard::typed::<(i64,)>())
            .action("reset", |_, _| json!({ "value": 0 }))
            .pointer("base-ptr")
            .build();

        assert_eq!(desc.id().as_str(), "Base");
        assert_eq!(desc.remote("ping").unwrap().kind, RemoteKind::ServerEvent);
        assert_eq!(desc.remote("pong").unwrap().kind, RemoteKind::ClientEvent);
        assert_eq!(desc.remote("increment").unwrap().kind, RemoteKind::Function);
        assert!(desc.action("reset").is_some());
        assert_eq!(desc.pointer().map(|p| p.as_str()), Some("base-ptr"));
        assert_eq!(desc.sync_scope(), SyncScope::Connected);
    }

    #[test]
    fn test_extends_inherits_and_overrides() {
        let base = ComponentDescriptor::builder::<Base>("Base")
            .initial_state(json!({ "value": 0 }))
            .remote_function("increment", guard::any())
            .sync_scope(SyncScope::Started)
            .abstract_type()
            .pointer("base-ptr")
            .build();

        let derived = ComponentDescriptor::builder::<Derived>("Derived")
            .extends(&base)
            .initial_state(json!({ "value": 10 }))
            .build();

        assert_eq!(derived.parent(), Some(TypeKey::of::<Base>()));
        assert!(derived.remote("increment").is_some());
        assert_eq!(derived.initial_state(), &json!({ "value": 10 }));
        assert_eq!(derived.sync_scope(), SyncScope::Started);
        assert!(!derived.is_abstract());
        assert!(derived.pointer().is_none());
    }
}
