//! Prover backend capability
//!
//! The engine never looks inside a proof payload. A backend is chosen once
//! at construction; the deterministic stand-in derives its payload from the
//! public inputs so it can also verify what it produced.

use crate::crypto::sha256_hex;
use crate::proof::models::{
    CircuitInputs, CircuitKind, ProofPayload, Witness, PAYLOAD_INPUT_INDEX, PUBLIC_INPUT_COUNT,
    TIMESTAMP_INPUT_INDEX,
};

pub trait ProverBackend: Send + Sync {
    /// Produce a proof payload for `inputs` under `circuit`.
    fn prove(
        &self,
        inputs: &CircuitInputs,
        witness: &Witness,
        circuit: CircuitKind,
    ) -> anyhow::Result<ProofPayload>;

    /// Check a payload against its public inputs.
    fn verify(&self, payload: &ProofPayload, public_inputs: &[String], circuit: CircuitKind)
        -> bool;

    fn name(&self) -> &str;
}

/// Hash-derived stand-in for a real SNARK prover. Not sound; suitable for
/// tests and for deployments where on-chain verification is the trust anchor.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeterministicProver;

impl DeterministicProver {
    fn payload_for(payload_hash: &str, timestamp_hex: &str, circuit: CircuitKind) -> ProofPayload {
        let h = sha256_hex(format!("{}{}{}", payload_hash, timestamp_hex, circuit.id()).as_bytes());

        ProofPayload {
            a: vec![h[..32].to_string(), h[32..].to_string()],
            b: vec![
                vec![h[..16].to_string(), h[16..32].to_string()],
                vec![h[32..48].to_string(), h[48..].to_string()],
            ],
            c: vec![h[..32].to_string(), h[32..].to_string()],
        }
    }
}

impl ProverBackend for DeterministicProver {
    fn prove(
        &self,
        inputs: &CircuitInputs,
        _witness: &Witness,
        circuit: CircuitKind,
    ) -> anyhow::Result<ProofPayload> {
        Ok(Self::payload_for(
            &inputs.payload_hash,
            &inputs.timestamp_hex(),
            circuit,
        ))
    }

    fn verify(&self, payload: &ProofPayload, public_inputs: &[String], circuit: CircuitKind) -> bool {
        if public_inputs.len() != PUBLIC_INPUT_COUNT {
            return false;
        }
        *payload
            == Self::payload_for(
                &public_inputs[PAYLOAD_INPUT_INDEX],
                &public_inputs[TIMESTAMP_INPUT_INDEX],
                circuit,
            )
    }

    fn name(&self) -> &str {
        "deterministic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> CircuitInputs {
        CircuitInputs::for_batch(sha256_hex(b"actor"), sha256_hex(b"root"), 1_700_000_000)
    }

    #[test]
    fn test_prove_then_verify() {
        let prover = DeterministicProver;
        let inputs = inputs();
        let witness = Witness::new("act_1", "", inputs.clone());

        let payload = prover.prove(&inputs, &witness, CircuitKind::Standard).unwrap();
        assert!(payload.is_well_formed());
        assert_eq!(payload.a, payload.c);
        assert_eq!(payload.b.len(), 2);

        let public = inputs.to_public_inputs();
        assert!(prover.verify(&payload, &public, CircuitKind::Standard));
        assert!(!prover.verify(&payload, &public, CircuitKind::Location));
        assert!(!prover.verify(&payload, &public[..5], CircuitKind::Standard));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let prover = DeterministicProver;
        let inputs = inputs();
        let witness = Witness::new("act_1", "", inputs.clone());

        let mut payload = prover.prove(&inputs, &witness, CircuitKind::Batch).unwrap();
        payload.c[0] = "00".repeat(16);
        assert!(!prover.verify(&payload, &inputs.to_public_inputs(), CircuitKind::Batch));
    }
}
