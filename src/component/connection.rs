//! Connection State Machine
//!
//! Per (component, player) lifecycle on the server:
//!
//! ```text
//!   Disconnected ──connect (access granted)──▶ Connected
//!        ▲                                        │
//!        └────── disconnect / player left ────────┘
//! ```
//!
//! Only `Connected` players receive state sync (in the default scope) and
//! may reach the component's remote channels.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ids::PlayerId;

/// Requested transition, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerAction {
    /// Disconnected -> Connected.
    Connect,
    /// Connected -> Disconnected.
    Disconnect,
}

/// State of one (component, player) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not receiving sync, remote channels closed.
    Disconnected,
    /// Receiving sync, remote channels open.
    Connected,
}

/// Connection errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Connect while already connected.
    #[error("player {0} is already connected")]
    AlreadyConnected(PlayerId),
    /// Disconnect while not connected.
    #[error("player {0} is not connected")]
    NotConnected(PlayerId),
    /// The access gate refused the player.
    #[error("player {0} was refused access")]
    AccessDenied(PlayerId),
    /// Connections are tracked by the server component only.
    #[error("connection state lives on the server")]
    ClientSide,
}

/// Bookkeeping for one connected player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
}

/// Players connected to one server component.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRecord {
    connected: BTreeMap<PlayerId, ConnectionInfo>,
}

impl ConnectionRecord {
    /// An empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// State of `player`.
    pub fn state(&self, player: &PlayerId) -> ConnectionState {
        if self.connected.contains_key(player) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// True if `player` is connected.
    pub fn is_connected(&self, player: &PlayerId) -> bool {
        self.connected.contains_key(player)
    }

    /// Disconnected -> Connected, if `gate` admits the player.
    ///
    /// The gate is consulted only for disconnected players; a refused or
    /// repeated connect leaves the record unchanged.
    pub fn connect<G>(&mut self, player: PlayerId, gate: G) -> Result<(), ConnectionError>
    where
        G: FnOnce(&PlayerId) -> bool,
    {
        if self.connected.contains_key(&player) {
            return Err(ConnectionError::AlreadyConnected(player));
        }
        if !gate(&player) {
            return Err(ConnectionError::AccessDenied(player));
        }
        self.connected.insert(player, ConnectionInfo { connected_at: Utc::now() });
        Ok(())
    }

    /// Connected -> Disconnected.
    pub fn disconnect(&mut self, player: &PlayerId) -> Result<ConnectionInfo, ConnectionError> {
        self.connected
            .remove(player)
            .ok_or(ConnectionError::NotConnected(*player))
    }

    /// Connection details of `player`.
    pub fn info(&self, player: &PlayerId) -> Option<&ConnectionInfo> {
        self.connected.get(player)
    }

    /// Connected players, in id order.
    pub fn players(&self) -> impl Iterator<Item = &PlayerId> {
        self.connected.keys()
    }

    /// Number of connected players.
    pub fn len(&self) -> usize {
        self.connected.len()
    }

    /// True if nobody is connected.
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }
}
