//! Runtime Configuration
//!
//! Tunables shared by the server and client runtimes.

use std::sync::Arc;
use std::time::Duration;

use crate::core::patch::{Differ, SnapshotDiff, StructuralDiff};

/// How outbound patches are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMode {
    /// Per-field structural deltas.
    Structural,
    /// Full-state replacement on every change.
    Snapshot,
}

impl DiffMode {
    /// Build the differ for this mode.
    pub fn differ(self) -> Arc<dyn Differ> {
        match self {
            DiffMode::Structural => Arc::new(StructuralDiff),
            DiffMode::Snapshot => Arc::new(SnapshotDiff),
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "structural" => Some(DiffMode::Structural),
            "snapshot" => Some(DiffMode::Snapshot),
            _ => None,
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long a client waits for an instance id to become known.
    pub address_timeout: Duration,
    /// How long a client waits for a remote function or connection reply.
    pub call_timeout: Duration,
    /// Out-of-order patches a replica buffers before asking for re-hydration.
    pub max_buffered_patches: usize,
    /// Attach and check a state hash on every sync frame.
    pub verify_state_hash: bool,
    /// Outbound patch strategy.
    pub diff_mode: DiffMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            address_timeout: Duration::from_secs(15),
            call_timeout: Duration::from_secs(30),
            max_buffered_patches: 64,
            verify_state_hash: true,
            diff_mode: DiffMode::Structural,
        }
    }
}

impl RuntimeConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            address_timeout: env_secs("SHARED_COMPONENTS_ADDRESS_TIMEOUT_SECS")
                .unwrap_or(defaults.address_timeout),
            call_timeout: env_secs("SHARED_COMPONENTS_CALL_TIMEOUT_SECS")
                .unwrap_or(defaults.call_timeout),
            max_buffered_patches: std::env::var("SHARED_COMPONENTS_MAX_BUFFERED_PATCHES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_buffered_patches),
            verify_state_hash: std::env::var("SHARED_COMPONENTS_VERIFY_STATE_HASH")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.verify_state_hash),
            diff_mode: std::env::var("SHARED_COMPONENTS_DIFF_MODE")
                .ok()
                .and_then(|v| DiffMode::parse(&v))
                .unwrap_or(defaults.diff_mode),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.address_timeout, Duration::from_secs(15));
        assert!(config.verify_state_hash);
        assert_eq!(config.diff_mode, DiffMode::Structural);
    }

    #[test]
    fn test_diff_mode_parse() {
        assert_eq!(DiffMode::parse("Snapshot"), Some(DiffMode::Snapshot));
        assert_eq!(DiffMode::parse("structural"), Some(DiffMode::Structural));
        assert_eq!(DiffMode::parse("other"), None);
    }

    #[test]
    fn test_snapshot_mode_replaces() {
        let differ = DiffMode::Snapshot.differ();
        let delta = differ.diff(&json!({ "a": 1 }), &json!({ "a": 2 })).unwrap();
        assert_eq!(delta, crate::core::patch::Delta::Replace(json!({ "a": 2 })));
    }
}
