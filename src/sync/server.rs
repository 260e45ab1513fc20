//! Server-side Sync
//!
//! Tracks, per observing player, the last view of the state that player was
//! sent. A player with no recorded view gets an `init`; everyone else gets
//! a delta against their own last view, so redaction can differ per player.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::component::hooks::ComponentHooks;
use crate::core::hash::state_hash_hex;
use crate::core::ids::PlayerId;
use crate::core::patch::Differ;
use crate::sync::payload::{PatchPayload, SyncFrame};

#[derive(Debug)]
struct Observer {
    epoch: u32,
    next_seq: u64,
    last_sent: Option<Value>,
}

/// Outbound replication state of one server component.
pub struct ServerSyncer {
    observers: BTreeMap<PlayerId, Observer>,
    epochs: BTreeMap<PlayerId, u32>,
    differ: Arc<dyn Differ>,
    hash_frames: bool,
}

impl ServerSyncer {
    /// Create a syncer with no observers.
    pub fn new(differ: Arc<dyn Differ>, hash_frames: bool) -> Self {
        Self {
            observers: BTreeMap::new(),
            epochs: BTreeMap::new(),
            differ,
            hash_frames,
        }
    }

    /// Start replicating to `player`. Returns false if already observing.
    pub fn add_observer(&mut self, player: PlayerId) -> bool {
        if self.observers.contains_key(&player) {
            return false;
        }
        self.observers.insert(player, Observer { epoch: 0, next_seq: 0, last_sent: None });
        true
    }

    /// Stop replicating to `player`.
    pub fn remove_observer(&mut self, player: &PlayerId) -> bool {
        self.observers.remove(player).is_some()
    }

    /// Forget what `player` holds; the next collect re-hydrates them.
    pub fn desync(&mut self, player: &PlayerId) -> bool {
        match self.observers.get_mut(player) {
            Some(observer) => {
                observer.last_sent = None;
                true
            }
            None => false,
        }
    }

    /// True if `player` is an observer.
    pub fn is_observing(&self, player: &PlayerId) -> bool {
        self.observers.contains_key(player)
    }

    /// True if `player` observes but has not been hydrated yet.
    pub fn needs_hydration(&self, player: &PlayerId) -> bool {
        self.observers.get(player).map_or(false, |o| o.last_sent.is_none())
    }

    /// Current observers.
    pub fn observers(&self) -> impl Iterator<Item = &PlayerId> {
        self.observers.keys()
    }

    /// Frames every observer needs to catch up with `state`.
    pub fn collect(&mut self, state: &Value, hooks: &dyn ComponentHooks) -> Vec<(PlayerId, SyncFrame)> {
        let players: Vec<PlayerId> = self.observers.keys().copied().collect();
        players
            .into_iter()
            .filter_map(|player| self.collect_for(&player, state, hooks).map(|frame| (player, frame)))
            .collect()
    }

    /// Frame `player` needs to catch up with `state`, if any.
    pub fn collect_for(
        &mut self,
        player: &PlayerId,
        state: &Value,
        hooks: &dyn ComponentHooks,
    ) -> Option<SyncFrame> {
        let observer = self.observers.get_mut(player)?;

        if !hooks.is_sync_for_player(player, state) {
            debug!("Sync to player {} vetoed", player);
            return None;
        }
        let view = hooks.sync_for_player(player, state.clone());

        let (seq, payload) = match &observer.last_sent {
            None => {
                let epoch = self.epochs.entry(*player).or_insert(0);
                *epoch += 1;
                observer.epoch = *epoch;
                observer.next_seq = 1;
                (0, PatchPayload::Init { state: view.clone() })
            }
            Some(previous) => {
                let delta = self.differ.diff(previous, &view)?;
                let seq = observer.next_seq;
                observer.next_seq += 1;
                (seq, PatchPayload::Patch { delta })
            }
        };

        let state_hash = self.hash_frames.then(|| state_hash_hex(&view));
        observer.last_sent = Some(view);

        Some(SyncFrame {
            epoch: observer.epoch,
            seq,
            payload,
            state_hash,
        })
    }
}

impl std::fmt::Debug for ServerSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSyncer")
            .field("observers", &self.observers.len())
            .field("hash_frames", &self.hash_frames)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
