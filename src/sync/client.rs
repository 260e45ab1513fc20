//! Client-side Sync
//!
//! Applies frames to a replica strictly in `(epoch, seq)` order. Frames
//! that arrive early wait in a bounded buffer; stale and duplicate frames
//! are dropped. Any failure leaves the replica at its last good state and
//! marks it desynced until a newer `init` arrives.

use std::collections::BTreeMap;

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::core::atom::StateAtom;
use crate::core::hash::state_hash_hex;
use crate::core::patch::{Delta, PatchError};
use crate::sync::payload::{PatchPayload, SyncFrame};

/// Replica sync errors. Each one means the replica needs re-hydration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The delta did not fit the replica.
    #[error("patch failed: {0}")]
    Patch(#[from] PatchError),
    /// The replica diverged from the server's view.
    #[error("state hash mismatch (expected {expected}, got {actual})")]
    HashMismatch {
        /// Hash sent by the server.
        expected: String,
        /// Hash of the local replica.
        actual: String,
    },
    /// Too many frames arrived out of order.
    #[error("reorder buffer overflow ({buffered} frames)")]
    BufferOverflow {
        /// Frames buffered when the limit was hit.
        buffered: usize,
    },
}

/// What one `receive` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveReport {
    /// Frames applied, including drained buffered ones.
    pub applied: usize,
    /// This call performed the first hydration.
    pub hydrated_now: bool,
}

/// Inbound replication state of one client replica.
#[derive(Debug)]
pub struct ClientReceiver {
    epoch: Option<u32>,
    last_seq: u64,
    hydrated: bool,
    desynced: bool,
    blocking: bool,
    verify_hash: bool,
    max_buffered: usize,
    buffered: BTreeMap<(u32, u64), SyncFrame>,
}

impl ClientReceiver {
    /// Create a receiver for a replica that has not been hydrated.
    pub fn new(max_buffered: usize, verify_hash: bool) -> Self {
        Self {
            epoch: None,
            last_seq: 0,
            hydrated: false,
            desynced: false,
            blocking: false,
            verify_hash,
            max_buffered,
            buffered: BTreeMap::new(),
        }
    }

    /// True once an `init` has been applied.
    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    /// True while waiting for re-hydration after a failure.
    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    /// Frames waiting for their predecessors.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Ignore incoming frames while set.
    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    /// True while incoming frames are ignored.
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Apply `frame` (and any frames it unblocks) to `atom`.
    pub fn receive(&mut self, frame: SyncFrame, atom: &mut StateAtom) -> Result<ReceiveReport, SyncError> {
        let mut report = ReceiveReport::default();

        if self.blocking {
            debug!("Dropping frame {}:{} while server dispatches are blocked", frame.epoch, frame.seq);
            return Ok(report);
        }

        if frame.payload.is_init() {
            self.accept_init(frame, atom, &mut report)?;
        } else {
            self.accept_patch(frame, atom, &mut report)?;
        }

        self.drain(atom, &mut report)?;
        Ok(report)
    }

    fn accept_init(
        &mut self,
        frame: SyncFrame,
        atom: &mut StateAtom,
        report: &mut ReceiveReport,
    ) -> Result<(), SyncError> {
        if matches!(self.epoch, Some(current) if frame.epoch < current) {
            debug!("Dropping stale init of epoch {}", frame.epoch);
            return Ok(());
        }

        let PatchPayload::Init { state } = frame.payload else {
            return Ok(());
        };
        if let Err(err) = self.check_hash(frame.state_hash.as_deref(), &state) {
            self.desynced = true;
            return Err(err);
        }

        atom.set(state);
        self.epoch = Some(frame.epoch);
        self.last_seq = frame.seq;
        self.desynced = false;
        report.hydrated_now = !self.hydrated;
        self.hydrated = true;
        report.applied += 1;

        let (epoch, seq) = (frame.epoch, frame.seq);
        self.buffered.retain(|&(e, s), _| e > epoch || (e == epoch && s > seq));
        Ok(())
    }

    fn accept_patch(
        &mut self,
        frame: SyncFrame,
        atom: &mut StateAtom,
        report: &mut ReceiveReport,
    ) -> Result<(), SyncError> {
        let current = match self.epoch {
            Some(epoch) if self.hydrated && frame.epoch <= epoch => epoch,
            _ => return self.buffer(frame),
        };

        if frame.epoch < current || self.desynced {
            debug!("Dropping stale patch {}:{}", frame.epoch, frame.seq);
            return Ok(());
        }
        if frame.seq <= self.last_seq {
            debug!("Dropping duplicate patch {}:{}", frame.epoch, frame.seq);
            return Ok(());
        }
        if frame.seq > self.last_seq + 1 {
            return self.buffer(frame);
        }

        self.apply_patch(frame, atom, report)
    }

    fn buffer(&mut self, frame: SyncFrame) -> Result<(), SyncError> {
        self.buffered.insert((frame.epoch, frame.seq), frame);
        if self.buffered.len() > self.max_buffered {
            let buffered = self.buffered.len();
            self.buffered.clear();
            self.desynced = true;
            return Err(SyncError::BufferOverflow { buffered });
        }
        Ok(())
    }

    fn apply_patch(
        &mut self,
        frame: SyncFrame,
        atom: &mut StateAtom,
        report: &mut ReceiveReport,
    ) -> Result<(), SyncError> {
        let PatchPayload::Patch { delta } = frame.payload else {
            return Ok(());
        };

        match self.patched(atom, &delta, frame.state_hash.as_deref()) {
            Ok(next) => {
                atom.set(next);
                self.last_seq = frame.seq;
                report.applied += 1;
                Ok(())
            }
            Err(err) => {
                self.desynced = true;
                Err(err)
            }
        }
    }

    fn patched(
        &self,
        atom: &StateAtom,
        delta: &Delta,
        expected_hash: Option<&str>,
    ) -> Result<serde_json::Value, SyncError> {
        let mut next = atom.get().clone();
        delta.apply(&mut next)?;
        self.check_hash(expected_hash, &next)?;
        Ok(next)
    }

    fn check_hash(&self, expected: Option<&str>, state: &serde_json::Value) -> Result<(), SyncError> {
        if !self.verify_hash {
            return Ok(());
        }
        match expected {
            Some(expected) => {
                let actual = state_hash_hex(state);
                if actual == expected {
                    Ok(())
                } else {
                    Err(SyncError::HashMismatch { expected: expected.to_string(), actual })
                }
            }
            None => Ok(()),
        }
    }

    fn drain(&mut self, atom: &mut StateAtom, report: &mut ReceiveReport) -> Result<(), SyncError> {
        while let Some(epoch) = self.epoch {
            if self.desynced {
                break;
            }
            match self.buffered.remove(&(epoch, self.last_seq + 1)) {
                Some(frame) => self.apply_patch(frame, atom, report)?,
                None => break,
            }
        }
        Ok(())
    }
}

/// Resolves waiters once a replica is first hydrated.
#[derive(Debug)]
pub struct ReadyGate {
    tx: watch::Sender<bool>,
}

impl ReadyGate {
    /// A gate that is not ready.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Open the gate.
    pub fn mark_ready(&self) {
        self.tx.send_replace(true);
    }

    /// True once opened.
    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// A future-producing handle that outlives borrows of the component.
    pub fn waiter(&self) -> ReadyWaiter {
        ReadyWaiter { rx: self.tx.subscribe() }
    }
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for a [`ReadyGate`] to open.
#[derive(Debug)]
pub struct ReadyWaiter {
    rx: watch::Receiver<bool>,
}

impl ReadyWaiter {
    /// True when the gate opened; false if the component went away first.
    pub async fn wait(mut self) -> bool {
        loop {
            if *self.rx.borrow() {
                return true;
            }
            if self.rx.changed().await.is_err() {
                return *self.rx.borrow();
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
