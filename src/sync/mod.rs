//! State replication.
//!
//! The server half turns state changes into per-observer frames; the
//! client half applies them to a replica in order.

pub mod client;
pub mod payload;
pub mod server;

pub use client::{ClientReceiver, ReadyGate, ReadyWaiter, ReceiveReport, SyncError};
pub use payload::{PatchPayload, SyncFrame};
pub use server::ServerSyncer;
