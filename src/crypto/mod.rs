//! Cryptographic utilities for the action pipeline
//!
//! Provides hashing, canonical encoding, content-addressed identifiers,
//! signing and Merkle aggregation for:
//! - Action signing (Ed25519 behind the `Signer` capability)
//! - Content-addressed action and proof ids
//! - Batch proof commitments via Merkle trees

pub mod merkle;
pub mod signing;

pub use merkle::{MerkleAggregator, MerkleProof, ProofStep, Side};
pub use signing::{Ed25519Signer, Signer};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Bytes of per-call entropy mixed into every action id.
pub const ACTION_ID_ENTROPY_BYTES: usize = 8;

/// A 64-character all-zero commitment, used when the committed value is absent.
pub const ZERO_COMMITMENT: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Hash data using SHA-256
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// SHA-256 as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Compact JSON with object keys in sorted order.
///
/// `serde_json::Map` is ordered by key, so going through `Value` gives a
/// stable encoding for signing and hashing regardless of field order.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

pub fn random_entropy() -> [u8; ACTION_ID_ENTROPY_BYTES] {
    let mut entropy = [0u8; ACTION_ID_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut entropy);
    entropy
}

/// Content-addressed action id: `act_` + 12 bytes of SHA-256 over the defining fields.
pub fn derive_action_id(actor_id: &str, kind_code: &str, timestamp: i64, entropy: &[u8]) -> String {
    let content = format!(
        "{}:{}:{}:{}",
        actor_id,
        kind_code,
        timestamp,
        hex::encode(entropy)
    );
    format!("act_{}", hex::encode(&sha256(content.as_bytes())[..12]))
}

/// Content-addressed proof id: `prf_` + 12 bytes of SHA-256.
pub fn derive_proof_id(payload_hash: &str, circuit_id: &str, generated_at: i64) -> String {
    let prefix = &payload_hash[..payload_hash.len().min(24)];
    let content = format!("{}:{}:{}", prefix, circuit_id, generated_at);
    format!("prf_{}", hex::encode(&sha256(content.as_bytes())[..12]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_id_is_deterministic() {
        let a = derive_action_id("did:worklog:ab", "NAV_START", 1000, &[1, 2, 3]);
        let b = derive_action_id("did:worklog:ab", "NAV_START", 1000, &[1, 2, 3]);
        assert_eq!(a, b);
        assert!(a.starts_with("act_"));
        assert_eq!(a.len(), 4 + 24);
    }

    #[test]
    fn test_action_id_changes_with_any_input() {
        let base = derive_action_id("did:worklog:ab", "NAV_START", 1000, &[1, 2, 3]);
        assert_ne!(base, derive_action_id("did:worklog:cd", "NAV_START", 1000, &[1, 2, 3]));
        assert_ne!(base, derive_action_id("did:worklog:ab", "NAV_DONE", 1000, &[1, 2, 3]));
        assert_ne!(base, derive_action_id("did:worklog:ab", "NAV_START", 1001, &[1, 2, 3]));
        assert_ne!(base, derive_action_id("did:worklog:ab", "NAV_START", 1000, &[1, 2, 4]));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = serde_json::json!({"b": 1, "a": {"d": 2, "c": 3}});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(bytes, br#"{"a":{"c":3,"d":2},"b":1}"#.to_vec());
    }

    #[test]
    fn test_proof_id_format() {
        let id = derive_proof_id(&sha256_hex(b"payload"), "worklog_standard_v3", 42);
        assert!(id.starts_with("prf_"));
        assert_eq!(id.len(), 28);
    }
}
