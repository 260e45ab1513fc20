//! Atomic State Cell
//!
//! Holds one component's state. Every write replaces the whole value, so a
//! reader holding the previous snapshot never observes a partial update.
//! Listeners run synchronously after each replacement.

use std::sync::Arc;

use serde_json::Value;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Projection of the state a selector-based listener is interested in.
pub type Selector = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Listener receiving `(current, previous)`.
pub type Listener = Box<dyn FnMut(&Value, &Value) + Send>;

struct Subscription {
    id: SubscriptionId,
    selector: Option<Selector>,
    listener: Listener,
}

/// The state cell.
pub struct StateAtom {
    current: Arc<Value>,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
}

impl StateAtom {
    /// Create a cell holding `initial`.
    pub fn new(initial: Value) -> Self {
        Self {
            current: Arc::new(initial),
            subscriptions: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Current state.
    pub fn get(&self) -> &Value {
        &self.current
    }

    /// Shared snapshot of the current state.
    pub fn snapshot(&self) -> Arc<Value> {
        Arc::clone(&self.current)
    }

    /// Replace the state and notify listeners. Returns the previous value.
    pub fn set(&mut self, next: Value) -> Arc<Value> {
        let previous = std::mem::replace(&mut self.current, Arc::new(next));
        let current = Arc::clone(&self.current);

        for subscription in &mut self.subscriptions {
            match &subscription.selector {
                Some(selector) => {
                    let selected_now = selector(&current);
                    let selected_before = selector(&previous);
                    if selected_now != selected_before {
                        (subscription.listener)(&selected_now, &selected_before);
                    }
                }
                None => {
                    if *current != *previous {
                        (subscription.listener)(&current, &previous);
                    }
                }
            }
        }

        previous
    }

    /// Listen to every change of the whole state.
    pub fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        self.push_subscription(None, listener)
    }

    /// Listen to changes of `selector(state)` only.
    pub fn subscribe_selector(&mut self, selector: Selector, listener: Listener) -> SubscriptionId {
        self.push_subscription(Some(selector), listener)
    }

    fn push_subscription(&mut self, selector: Option<Selector>, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscriptions.push(Subscription { id, selector, listener });
        id
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    /// Drop every listener.
    pub fn clear_subscriptions(&mut self) {
        self.subscriptions.clear();
    }

    /// Number of live listeners.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl std::fmt::Debug for StateAtom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateAtom")
            .field("current", &self.current)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<(Value, Value)>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Listener = Box::new(move |now: &Value, before: &Value| {
            sink.lock().unwrap().push((now.clone(), before.clone()));
        });
        (seen, listener)
    }

    #[test]
    fn test_set_replaces_wholesale() {
        let mut atom = StateAtom::new(json!({ "money": 1, "name": "x" }));
        let before = atom.snapshot();
        atom.set(json!({ "money": 2 }));

        assert_eq!(atom.get(), &json!({ "money": 2 }));
        assert_eq!(*before, json!({ "money": 1, "name": "x" }));
    }

    #[test]
    fn test_listener_sees_current_and_previous() {
        let mut atom = StateAtom::new(json!(1));
        let (seen, listener) = recorder();
        atom.subscribe(listener);

        atom.set(json!(2));
        atom.set(json!(2));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (json!(2), json!(1)));
    }

    #[test]
    fn test_selector_listener_only_fires_on_selected_change() {
        let mut atom = StateAtom::new(json!({ "money": 0, "other": 0 }));
        let (seen, listener) = recorder();
        atom.subscribe_selector(Arc::new(|s: &Value| s["money"].clone()), listener);

        atom.set(json!({ "money": 0, "other": 1 }));
        atom.set(json!({ "money": 5, "other": 1 }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(json!(5), json!(0))]);
    }

    #[test]
    fn test_unsubscribe() {
        let mut atom = StateAtom::new(json!(0));
        let (seen, listener) = recorder();
        let id = atom.subscribe(listener);

        assert!(atom.unsubscribe(id));
        assert!(!atom.unsubscribe(id));
        atom.set(json!(1));
        assert!(seen.lock().unwrap().is_empty());
    }
}
