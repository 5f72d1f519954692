//! Proof data model
//!
//! Circuit identifiers, the public commitments derived from one action, the
//! opaque proof payload and the artifacts built around it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use crate::actions::{ActionRecord, GPS_KEY};
use crate::crypto::{canonical_json, sha256_hex, MerkleAggregator, MerkleProof, ZERO_COMMITMENT};
use crate::error::{PipelineError, Result};

/// Payload key excluded from the sensor commitment alongside [`GPS_KEY`]
const TIMESTAMP_KEY: &str = "timestamp";

/// Number of public inputs every circuit exposes
pub const PUBLIC_INPUT_COUNT: usize = 6;

/// Index of the payload hash among the public inputs
pub const PAYLOAD_INPUT_INDEX: usize = 1;

/// Index of the zero-padded hex timestamp among the public inputs
pub const TIMESTAMP_INPUT_INDEX: usize = 2;

/// Circuit version shared by every circuit id
pub const CIRCUIT_VERSION: &str = "3.0.0";

/// Available circuits for different verification scenarios
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum CircuitKind {
    #[default]
    #[serde(rename = "worklog_standard_v3")]
    Standard,
    #[serde(rename = "worklog_location_v3")]
    Location,
    #[serde(rename = "worklog_batch_v3")]
    Batch,
    #[serde(rename = "worklog_identity_v3")]
    Identity,
    #[serde(rename = "worklog_light_v3")]
    Lightweight,
}

impl CircuitKind {
    pub const ALL: [CircuitKind; 5] = [
        CircuitKind::Standard,
        CircuitKind::Location,
        CircuitKind::Batch,
        CircuitKind::Identity,
        CircuitKind::Lightweight,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            CircuitKind::Standard => "worklog_standard_v3",
            CircuitKind::Location => "worklog_location_v3",
            CircuitKind::Batch => "worklog_batch_v3",
            CircuitKind::Identity => "worklog_identity_v3",
            CircuitKind::Lightweight => "worklog_light_v3",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|circuit| circuit.id() == id)
    }
}

impl fmt::Display for CircuitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Public commitments for one action. Raw coordinates and sensor readings
/// never leave the action; only their hashes do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitInputs {
    pub actor_hash: String,
    pub payload_hash: String,
    pub timestamp: i64,
    pub location_commitment: String,
    pub sensor_commitment: String,
    pub kind_hash: String,
}

impl CircuitInputs {
    pub fn from_action(action: &ActionRecord) -> Result<Self> {
        let location_commitment = match action.geolocation() {
            Some(point) => sha256_hex(format!("{:.6},{:.6}", point.lat, point.lon).as_bytes()),
            None => ZERO_COMMITMENT.to_string(),
        };

        let mut sensors = action.payload.clone();
        sensors.remove(GPS_KEY);
        sensors.remove(TIMESTAMP_KEY);

        Ok(Self {
            actor_hash: sha256_hex(action.actor_id.as_bytes()),
            payload_hash: sha256_hex(&canonical_json(&action.payload)?),
            timestamp: action.timestamp,
            location_commitment,
            sensor_commitment: sha256_hex(&canonical_json(&sensors)?),
            kind_hash: sha256_hex(action.kind.code().as_bytes()),
        })
    }

    /// Commitments to a Merkle root over member proofs
    pub fn for_batch(actor_hash: String, merkle_root: String, timestamp: i64) -> Self {
        Self {
            actor_hash,
            payload_hash: merkle_root,
            timestamp,
            location_commitment: ZERO_COMMITMENT.to_string(),
            sensor_commitment: ZERO_COMMITMENT.to_string(),
            kind_hash: sha256_hex(b"BATCH"),
        }
    }

    pub fn timestamp_hex(&self) -> String {
        format!("{:016x}", self.timestamp)
    }

    /// The six public input strings, in circuit order
    pub fn to_public_inputs(&self) -> Vec<String> {
        vec![
            self.actor_hash.clone(),
            self.payload_hash.clone(),
            self.timestamp_hex(),
            self.location_commitment.clone(),
            self.sensor_commitment.clone(),
            self.kind_hash.clone(),
        ]
    }
}

/// Private values handed to the prover next to the public inputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub action_id: String,
    pub signature_r: String,
    pub signature_s: String,
    pub inputs: CircuitInputs,
}

impl Witness {
    pub fn new(action_id: impl Into<String>, signature: &str, inputs: CircuitInputs) -> Self {
        let split = signature.len().min(64);
        let (r, s) = signature.split_at(split);
        let or_zero = |part: &str| {
            if part.is_empty() {
                ZERO_COMMITMENT.to_string()
            } else {
                part.to_string()
            }
        };

        Self {
            action_id: action_id.into(),
            signature_r: or_zero(r),
            signature_s: or_zero(s),
            inputs,
        }
    }
}

/// Opaque proof payload: three groups of curve elements (Groth16 layout)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofPayload {
    pub a: Vec<String>,
    pub b: Vec<Vec<String>>,
    pub c: Vec<String>,
}

impl ProofPayload {
    pub fn is_well_formed(&self) -> bool {
        !self.a.is_empty()
            && !self.c.is_empty()
            && !self.b.is_empty()
            && self.b.iter().all(|row| !row.is_empty())
    }
}

/// One generated proof. Immutable once built; actions refer to it by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofArtifact {
    pub proof_id: String,
    pub circuit: CircuitKind,
    /// Unix seconds
    pub generated_at: i64,
    pub payload: ProofPayload,
    pub public_inputs: Vec<String>,
}

impl ProofArtifact {
    /// Compact canonical JSON; used as the Merkle leaf for batches
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        canonical_json(self)
    }

    pub fn size_bytes(&self) -> Result<usize> {
        Ok(self.to_bytes()?.len())
    }
}

/// Aggregate proof over an ordered set of member proofs.
///
/// `members` fixes the leaf order; reordering changes `merkle_root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProofArtifact {
    pub members: Vec<ProofArtifact>,
    pub aggregate: ProofArtifact,
    /// Hex-encoded root over `members[i].to_bytes()`
    pub merkle_root: String,
    pub count: usize,
    pub generated_at: i64,
}

impl BatchProofArtifact {
    pub fn member_ids(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.proof_id.as_str()).collect()
    }

    fn leaves(&self) -> Result<Vec<Vec<u8>>> {
        self.members.iter().map(ProofArtifact::to_bytes).collect()
    }

    /// Rebuild the member tree in recorded order.
    pub fn tree(&self) -> Result<MerkleAggregator> {
        Ok(MerkleAggregator::new(&self.leaves()?))
    }

    pub fn inclusion_proof(&self, index: usize) -> Result<Option<MerkleProof>> {
        Ok(self.tree()?.proof(index))
    }

    /// Check member `index` against the recorded root. Out of range is `false`.
    pub fn verify_member(&self, index: usize) -> Result<bool> {
        let Some(member) = self.members.get(index) else {
            return Ok(false);
        };
        let Some(proof) = self.inclusion_proof(index)? else {
            return Ok(false);
        };
        let Ok(root) = hex::decode(&self.merkle_root) else {
            return Ok(false);
        };
        Ok(MerkleAggregator::verify(&member.to_bytes()?, &proof, &root))
    }
}

/// Verification key used for local pre-submission checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationKey {
    pub version: String,
    pub circuits: BTreeSet<String>,
    pub public_input_count: usize,
}

impl Default for VerificationKey {
    fn default() -> Self {
        Self {
            version: CIRCUIT_VERSION.to_string(),
            circuits: CircuitKind::ALL.iter().map(|c| c.id().to_string()).collect(),
            public_input_count: PUBLIC_INPUT_COUNT,
        }
    }
}

impl VerificationKey {
    /// Load a JSON verification key from disk
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::validation(format!(
                "cannot read verification key {}: {}",
                path.display(),
                e
            ))
        })?;
        let key: VerificationKey = serde_json::from_str(&raw)?;
        if key.circuits.is_empty() {
            return Err(PipelineError::validation("verification key lists no circuits"));
        }
        if key.public_input_count != PUBLIC_INPUT_COUNT {
            return Err(PipelineError::validation(format!(
                "verification key expects {} public inputs, circuits produce {}",
                key.public_input_count, PUBLIC_INPUT_COUNT
            )));
        }
        Ok(key)
    }

    pub fn supports(&self, circuit: CircuitKind) -> bool {
        self.circuits.contains(circuit.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionKind, GeoPoint, NewAction, ProofStatus};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn action(payload: serde_json::Value) -> ActionRecord {
        let new = NewAction::from_json(ActionKind::DeliveryComplete, payload).unwrap();
        ActionRecord {
            id: "act_0001".to_string(),
            actor_id: "did:worklog:robot".to_string(),
            kind: new.kind,
            payload: new.payload,
            timestamp: 1000,
            signature: String::new(),
            status: ProofStatus::Pending,
            tx_ref: None,
            proof_ref: None,
            batch_ref: None,
            tags: BTreeSet::new(),
            metadata: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_circuit_ids() {
        for circuit in CircuitKind::ALL {
            assert_eq!(CircuitKind::from_id(circuit.id()), Some(circuit));
            assert_eq!(
                serde_json::to_string(&circuit).unwrap(),
                format!("\"{}\"", circuit.id())
            );
        }
        assert_eq!(CircuitKind::from_id("unknown_v1"), None);
    }

    #[test]
    fn test_public_inputs_shape() {
        let inputs = CircuitInputs::from_action(&action(json!({"parcel": "P-17"}))).unwrap();
        let public = inputs.to_public_inputs();

        assert_eq!(public.len(), PUBLIC_INPUT_COUNT);
        assert_eq!(public[TIMESTAMP_INPUT_INDEX], "00000000000003e8");
        for (i, value) in public.iter().enumerate() {
            if i != TIMESTAMP_INPUT_INDEX {
                assert_eq!(value.len(), 64);
            }
        }
        assert_eq!(inputs.location_commitment, ZERO_COMMITMENT);
    }

    #[test]
    fn test_location_commitment_hides_coordinates() {
        let mut record = action(json!({"parcel": "P-17"}));
        record
            .payload
            .insert(GPS_KEY.to_string(), GeoPoint::new(52.52, 13.405).to_value());

        let inputs = CircuitInputs::from_action(&record).unwrap();
        assert_eq!(
            inputs.location_commitment,
            sha256_hex(b"52.520000,13.405000")
        );

        // gps and timestamp do not feed the sensor commitment
        let plain = CircuitInputs::from_action(&action(json!({"parcel": "P-17", "timestamp": 5})))
            .unwrap();
        assert_eq!(inputs.sensor_commitment, plain.sensor_commitment);
        assert_ne!(inputs.payload_hash, plain.payload_hash);
    }

    #[test]
    fn test_witness_splits_signature() {
        let inputs = CircuitInputs::from_action(&action(json!({}))).unwrap();
        let signature = "ab".repeat(64);
        let witness = Witness::new("act_1", &signature, inputs.clone());
        assert_eq!(witness.signature_r, "ab".repeat(32));
        assert_eq!(witness.signature_s, "ab".repeat(32));

        let unsigned = Witness::new("act_1", "", inputs);
        assert_eq!(unsigned.signature_r, ZERO_COMMITMENT);
        assert_eq!(unsigned.signature_s, ZERO_COMMITMENT);
    }

    #[test]
    fn test_load_verification_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vk.json");
        std::fs::write(
            &path,
            r#"{"version":"3.0.0","circuits":["worklog_standard_v3"],"public_input_count":6}"#,
        )
        .unwrap();

        let key = VerificationKey::load(&path).unwrap();
        assert!(key.supports(CircuitKind::Standard));
        assert!(!key.supports(CircuitKind::Batch));

        assert!(matches!(
            VerificationKey::load(&dir.path().join("missing.json")),
            Err(PipelineError::Validation(_))
        ));
    }
}
