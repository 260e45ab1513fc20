//! Component Hooks
//!
//! Per-component policy: which players may connect, what each player is
//! allowed to see, and lifecycle callbacks. Redaction hooks receive the
//! canonical state by reference or as an owned copy, so they cannot mutate
//! what other observers receive.

use serde_json::Value;

use crate::core::ids::PlayerId;

/// Policy and lifecycle callbacks of a shared component.
pub trait ComponentHooks: Send {
    /// Veto: should `player` receive a sync frame for `state` at all?
    fn is_sync_for_player(&self, _player: &PlayerId, _state: &Value) -> bool {
        true
    }

    /// Transform the state before it is sent to `player`.
    fn sync_for_player(&self, _player: &PlayerId, state: Value) -> Value {
        state
    }

    /// Access gate consulted on every connection request.
    fn is_access_connection_for_player(&self, _player: &PlayerId) -> bool {
        true
    }

    /// Server: `player` has connected.
    fn on_connected_player(&mut self, _player: &PlayerId) {}

    /// Server: `player` has disconnected, explicitly or by leaving.
    fn on_disconnected_player(&mut self, _player: &PlayerId) {}

    /// Client: the server dropped this client's connection.
    fn on_disconnected(&mut self) {}
}

/// Hooks that allow everything and do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl ComponentHooks for DefaultHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct HideSecret;

    impl ComponentHooks for HideSecret {
        fn sync_for_player(&self, _player: &PlayerId, mut state: Value) -> Value {
            if let Some(map) = state.as_object_mut() {
                map.remove("secret");
            }
            state
        }
    }

    #[test]
    fn test_default_hooks_pass_through() {
        let hooks = DefaultHooks;
        let player = PlayerId::new([1; 16]);
        let state = json!({ "a": 1 });
        assert!(hooks.is_sync_for_player(&player, &state));
        assert!(hooks.is_access_connection_for_player(&player));
        assert_eq!(hooks.sync_for_player(&player, state.clone()), state);
    }

    #[test]
    fn test_redaction_leaves_canonical_untouched() {
        let canonical = json!({ "a": 1, "secret": 42 });
        let view = HideSecret.sync_for_player(&PlayerId::new([2; 16]), canonical.clone());
        assert_eq!(view, json!({ "a": 1 }));
        assert_eq!(canonical["secret"], json!(42));
    }
}
