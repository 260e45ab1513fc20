//! State Hashing for Verification
//!
//! Deterministic hashing of JSON component state. Every sync frame carries
//! the hash of the state the receiving replica should hold after applying
//! it, so a diverged replica is detected on the next frame.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_NUMBER: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_ARRAY: u8 = 4;
const TAG_OBJECT: u8 = 5;

/// Deterministic hasher for component state.
///
/// Wraps SHA-256 with a structural walk over `serde_json::Value`.
/// Object keys are visited in sorted order regardless of map ordering.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for replicated component state.
    pub fn for_component_state() -> Self {
        Self::new(b"SHARED_COMPONENT_STATE_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u8 value.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a length-prefixed string.
    pub fn update_str(&mut self, value: &str) {
        self.update_u64(value.len() as u64);
        self.update_bytes(value.as_bytes());
    }

    /// Update with a JSON value, recursively.
    pub fn update_value(&mut self, value: &Value) {
        match value {
            Value::Null => self.update_u8(TAG_NULL),
            Value::Bool(b) => {
                self.update_u8(TAG_BOOL);
                self.update_u8(*b as u8);
            }
            Value::Number(n) => {
                // Number's Display is canonical for a given parsed value.
                self.update_u8(TAG_NUMBER);
                self.update_str(&n.to_string());
            }
            Value::String(s) => {
                self.update_u8(TAG_STRING);
                self.update_str(s);
            }
            Value::Array(items) => {
                self.update_u8(TAG_ARRAY);
                self.update_u64(items.len() as u64);
                for item in items {
                    self.update_value(item);
                }
            }
            Value::Object(map) => {
                self.update_u8(TAG_OBJECT);
                self.update_u64(map.len() as u64);
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for key in keys {
                    self.update_str(key);
                    self.update_value(&map[key]);
                }
            }
        }
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Hash a component state value.
pub fn hash_state(value: &Value) -> StateHash {
    let mut hasher = StateHasher::for_component_state();
    hasher.update_value(value);
    hasher.finalize()
}

/// Hex-encoded state hash, as carried on the wire.
pub fn state_hash_hex(value: &Value) -> String {
    hex::encode(hash_state(value))
}

// =============================================================================
// TESTS
// =============================================================================
