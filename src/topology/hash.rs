//! Topology fingerprints for change detection.

use sha2::{Digest, Sha256};

use super::types::Topology;

/// Computes deterministic fingerprints of topologies.
#[derive(Debug, Default)]
pub struct TopologyHasher;

impl TopologyHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Hex-encoded SHA-256 of the normalized topology.
    ///
    /// Two topologies equal modulo relationship order share a fingerprint.
    #[must_use]
    pub fn fingerprint(&self, topology: &Topology) -> String {
        let mut hasher = Sha256::new();
        // BTreeMap keys serialize in order, so the encoding is canonical
        let encoded = serde_json::to_vec(&topology.normalized()).unwrap_or_default();
        hasher.update(&encoded);
        hex::encode(hasher.finalize())
    }

    /// Short form of a fingerprint for display.
    #[must_use]
    pub fn short(fingerprint: &str) -> &str {
        fingerprint.get(..12).unwrap_or(fingerprint)
    }
}
