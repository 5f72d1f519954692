//! Proof Engine
//!
//! Derives public commitments for actions, drives the prover backend and
//! aggregates member proofs into batch proofs over a Merkle root.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::actions::ActionRecord;
use crate::clock::Clock;
use crate::config::ProofConfig;
use crate::crypto::{derive_proof_id, sha256_hex, MerkleAggregator};
use crate::error::{PipelineError, Result};
use crate::proof::backend::ProverBackend;
use crate::proof::models::{
    BatchProofArtifact, CircuitInputs, CircuitKind, ProofArtifact, VerificationKey, Witness,
    PAYLOAD_INPUT_INDEX, TIMESTAMP_INPUT_INDEX,
};
use crate::proof::pool::{ProofHandle, ProofWorkerPool};

/// Witness action id used for the aggregate proof of a batch
const BATCH_WITNESS_ID: &str = "batch";

/// Engine statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProofStatistics {
    pub proofs_generated: u64,
    pub batch_proofs_generated: u64,
    pub proofs_submitted: u64,
    pub avg_proving_time: Duration,
    pub cached_proofs: usize,
}

#[derive(Debug, Default)]
struct Counters {
    proofs_generated: u64,
    batch_proofs_generated: u64,
    proofs_submitted: u64,
    total_proving_time: Duration,
}

/// State shared with jobs running on the worker pool
struct Prover {
    backend: Arc<dyn ProverBackend>,
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<String, ProofArtifact>>,
    counters: Mutex<Counters>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Prover {
    fn prove_inputs(
        &self,
        inputs: &CircuitInputs,
        witness: &Witness,
        circuit: CircuitKind,
    ) -> Result<ProofArtifact> {
        let payload = self
            .backend
            .prove(inputs, witness, circuit)
            .map_err(|e| PipelineError::proof_generation(&witness.action_id, format!("{:#}", e)))?;

        let generated_at = self.clock.unix_seconds();
        Ok(ProofArtifact {
            proof_id: derive_proof_id(&inputs.payload_hash, circuit.id(), generated_at),
            circuit,
            generated_at,
            payload,
            public_inputs: inputs.to_public_inputs(),
        })
    }

    fn prove(&self, action: &ActionRecord, circuit: CircuitKind) -> Result<ProofArtifact> {
        let started = Instant::now();

        let inputs = CircuitInputs::from_action(action)?;
        let witness = Witness::new(&action.id, &action.signature, inputs.clone());
        let proof = match self.prove_inputs(&inputs, &witness, circuit) {
            Ok(proof) => proof,
            Err(e) => {
                warn!(action_id = %action.id, circuit = %circuit, "Proof generation failed: {}", e);
                return Err(e);
            }
        };

        let elapsed = started.elapsed();
        {
            let mut counters = lock(&self.counters);
            counters.proofs_generated += 1;
            counters.total_proving_time += elapsed;
        }
        lock(&self.cache).insert(action.id.clone(), proof.clone());

        debug!(
            action_id = %action.id,
            proof_id = %proof.proof_id,
            circuit = %circuit,
            elapsed_ms = elapsed.as_millis() as u64,
            "Generated proof"
        );
        Ok(proof)
    }
}

pub struct ProofEngine {
    config: ProofConfig,
    prover: Arc<Prover>,
    pool: ProofWorkerPool,
    verification_key: Mutex<Option<VerificationKey>>,
}

impl ProofEngine {
    pub fn new(config: ProofConfig, backend: Arc<dyn ProverBackend>, clock: Arc<dyn Clock>) -> Self {
        info!(
            backend = backend.name(),
            workers = config.workers,
            max_batch_size = config.max_batch_size,
            "Proof engine initialized"
        );

        Self {
            pool: ProofWorkerPool::new(config.workers),
            config,
            prover: Arc::new(Prover {
                backend,
                clock,
                cache: Mutex::new(HashMap::new()),
                counters: Mutex::new(Counters::default()),
            }),
            verification_key: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProofConfig {
        &self.config
    }

    // ========================================================================
    // Proof Generation
    // ========================================================================

    /// Generate a proof for one action on the calling thread.
    pub fn generate_proof(&self, action: &ActionRecord, circuit: CircuitKind) -> Result<ProofArtifact> {
        self.prover.prove(action, circuit)
    }

    /// Queue proof generation on the worker pool.
    pub fn generate_proof_async(
        &self,
        action: ActionRecord,
        circuit: CircuitKind,
    ) -> Result<ProofHandle<ProofArtifact>> {
        let prover = self.prover.clone();
        self.pool.spawn(move || prover.prove(&action, circuit))
    }

    /// Prove each action in order under the batch circuit, then prove the
    /// Merkle root over the member proofs.
    pub fn generate_batch_proof(&self, actions: &[ActionRecord]) -> Result<BatchProofArtifact> {
        if actions.is_empty() {
            return Err(PipelineError::validation("batch proof needs at least one action"));
        }
        if actions.len() > self.config.max_batch_size {
            return Err(PipelineError::validation(format!(
                "Batch size {} exceeds maximum {}",
                actions.len(),
                self.config.max_batch_size
            )));
        }

        let members = actions
            .iter()
            .map(|action| self.prover.prove(action, CircuitKind::Batch))
            .collect::<Result<Vec<_>>>()?;

        let leaves = members
            .iter()
            .map(ProofArtifact::to_bytes)
            .collect::<Result<Vec<_>>>()?;
        let tree = MerkleAggregator::new(&leaves);
        let merkle_root = tree.root_hex();

        let actors: BTreeSet<&str> = actions.iter().map(|a| a.actor_id.as_str()).collect();
        let actor_hash = sha256_hex(actors.into_iter().collect::<Vec<_>>().join(",").as_bytes());

        let generated_at = self.prover.clock.unix_seconds();
        let inputs = CircuitInputs::for_batch(actor_hash, merkle_root.clone(), generated_at);
        let witness = Witness::new(BATCH_WITNESS_ID, "", inputs.clone());
        let aggregate = self.prover.prove_inputs(&inputs, &witness, CircuitKind::Batch)?;

        lock(&self.prover.counters).batch_proofs_generated += 1;

        info!(
            proof_id = %aggregate.proof_id,
            members = members.len(),
            merkle_root = %merkle_root,
            "Generated batch proof"
        );

        Ok(BatchProofArtifact {
            count: members.len(),
            members,
            aggregate,
            merkle_root,
            generated_at,
        })
    }

    // ========================================================================
    // Local Verification
    // ========================================================================

    /// Load the verification key from `path`, or the configured path, or the
    /// built-in default when neither is set.
    pub fn load_verification_key(&self, path: Option<&Path>) -> Result<()> {
        let key = match path.or(self.config.verification_key_path.as_deref()) {
            Some(path) => {
                let key = VerificationKey::load(path)?;
                info!(path = %path.display(), circuits = key.circuits.len(), "Loaded verification key");
                key
            }
            None => VerificationKey::default(),
        };
        *lock(&self.verification_key) = Some(key);
        Ok(())
    }

    /// Pre-submission sanity check. Does not replace on-chain verification.
    pub fn verify_locally(&self, proof: &ProofArtifact) -> Result<bool> {
        if lock(&self.verification_key).is_none() {
            self.load_verification_key(None)?;
        }
        let key = lock(&self.verification_key).clone().unwrap_or_default();

        if !key.supports(proof.circuit) {
            warn!(proof_id = %proof.proof_id, circuit = %proof.circuit, "Circuit not in verification key");
            return Ok(false);
        }
        if proof.public_inputs.len() != key.public_input_count {
            warn!(
                proof_id = %proof.proof_id,
                inputs = proof.public_inputs.len(),
                "Unexpected public input count"
            );
            return Ok(false);
        }

        let well_shaped = proof.public_inputs.iter().enumerate().all(|(i, input)| {
            let expected = if i == TIMESTAMP_INPUT_INDEX { 16 } else { 64 };
            input.len() == expected && input.chars().all(|c| c.is_ascii_hexdigit())
        });
        if !well_shaped {
            warn!(proof_id = %proof.proof_id, "Malformed public inputs");
            return Ok(false);
        }

        let payload_hash = match proof.public_inputs.get(PAYLOAD_INPUT_INDEX) {
            Some(hash) => hash,
            None => {
                warn!(proof_id = %proof.proof_id, "Missing payload commitment");
                return Ok(false);
            }
        };
        let expected_id = derive_proof_id(payload_hash, proof.circuit.id(), proof.generated_at);
        if proof.proof_id != expected_id {
            warn!(proof_id = %proof.proof_id, "Proof id does not match its contents");
            return Ok(false);
        }

        if !proof.payload.is_well_formed() {
            warn!(proof_id = %proof.proof_id, "Empty proof payload group");
            return Ok(false);
        }

        let valid = self
            .prover
            .backend
            .verify(&proof.payload, &proof.public_inputs, proof.circuit);
        if !valid {
            warn!(proof_id = %proof.proof_id, "Backend rejected proof payload");
        }
        Ok(valid)
    }

    // ========================================================================
    // Cache & Statistics
    // ========================================================================

    pub fn cached_proof(&self, action_id: &str) -> Option<ProofArtifact> {
        lock(&self.prover.cache).get(action_id).cloned()
    }

    pub fn clear_cache(&self) {
        lock(&self.prover.cache).clear();
    }

    /// Count a proof accepted by the chain client
    pub fn record_submission(&self) {
        lock(&self.prover.counters).proofs_submitted += 1;
    }

    pub fn statistics(&self) -> ProofStatistics {
        let counters = lock(&self.prover.counters);
        let avg_proving_time = average(counters.total_proving_time, counters.proofs_generated);

        ProofStatistics {
            proofs_generated: counters.proofs_generated,
            batch_proofs_generated: counters.batch_proofs_generated,
            proofs_submitted: counters.proofs_submitted,
            avg_proving_time,
            cached_proofs: lock(&self.prover.cache).len(),
        }
    }

    /// Drain the worker pool. Returns whether it drained within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.pool.shutdown(timeout).await
    }
}

/// Mean of `total` over `count` samples; zero when there are none.
fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(total.as_secs_f64() / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionKind, GeoPoint, NewAction, ProofStatus};
    use crate::clock::ManualClock;
    use crate::proof::backend::DeterministicProver;
    use crate::proof::models::{ProofPayload, Witness};
    use chrono::Utc;
    use serde_json::json;

    struct FailingProver;

    impl ProverBackend for FailingProver {
        fn prove(&self, _: &CircuitInputs, _: &Witness, _: CircuitKind) -> anyhow::Result<ProofPayload> {
            anyhow::bail!("prover offline")
        }

        fn verify(&self, _: &ProofPayload, _: &[String], _: CircuitKind) -> bool {
            false
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn engine_with(backend: Arc<dyn ProverBackend>, max_batch_size: usize) -> ProofEngine {
        let config = ProofConfig {
            max_batch_size,
            ..ProofConfig::default()
        };
        ProofEngine::new(config, backend, Arc::new(ManualClock::at_unix(1_700_000_000)))
    }

    fn engine() -> ProofEngine {
        engine_with(Arc::new(DeterministicProver), 100)
    }

    fn action(i: usize) -> ActionRecord {
        let new = NewAction::from_json(ActionKind::TaskCompleted, json!({ "seq": i }))
            .unwrap()
            .with_location(GeoPoint::new(48.1, 11.5));
        ActionRecord {
            id: format!("act_{:04}", i),
            actor_id: "did:worklog:robot".to_string(),
            kind: new.kind,
            payload: new.payload,
            timestamp: 1000 + i as i64,
            signature: "cd".repeat(64),
            status: ProofStatus::Pending,
            tx_ref: None,
            proof_ref: None,
            batch_ref: None,
            tags: BTreeSet::new(),
            metadata: new.metadata,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_generate_and_verify() {
        let engine = engine();
        let proof = engine.generate_proof(&action(1), CircuitKind::Standard).unwrap();

        assert!(proof.proof_id.starts_with("prf_"));
        assert_eq!(proof.generated_at, 1_700_000_000);
        assert!(engine.verify_locally(&proof).unwrap());
        assert_eq!(engine.cached_proof("act_0001"), Some(proof.clone()));

        let mut forged = proof;
        forged.public_inputs[1] = sha256_hex(b"other payload");
        assert!(!engine.verify_locally(&forged).unwrap());

        let stats = engine.statistics();
        assert_eq!(stats.proofs_generated, 1);
        assert_eq!(stats.cached_proofs, 1);
    }

    #[test]
    fn test_backend_failure_is_proof_generation_error() {
        let engine = engine_with(Arc::new(FailingProver), 100);
        let err = engine.generate_proof(&action(1), CircuitKind::Standard).unwrap_err();

        match err {
            PipelineError::ProofGeneration { action_id, reason } => {
                assert_eq!(action_id, "act_0001");
                assert!(reason.contains("prover offline"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.statistics().proofs_generated, 0);
        assert!(engine.cached_proof("act_0001").is_none());
    }

    #[test]
    fn test_batch_limits() {
        let engine = engine_with(Arc::new(DeterministicProver), 3);
        assert!(matches!(
            engine.generate_batch_proof(&[]),
            Err(PipelineError::Validation(_))
        ));

        let actions: Vec<_> = (0..4).map(action).collect();
        assert!(matches!(
            engine.generate_batch_proof(&actions),
            Err(PipelineError::Validation(_))
        ));
        assert_eq!(engine.statistics().proofs_generated, 0);

        let batch = engine.generate_batch_proof(&actions[..3]).unwrap();
        assert_eq!(batch.count, 3);
    }

    #[test]
    fn test_batch_members_verify_in_order() {
        let engine = engine();
        let actions: Vec<_> = (0..5).map(action).collect();
        let batch = engine.generate_batch_proof(&actions).unwrap();

        assert_eq!(batch.aggregate.public_inputs[1], batch.merkle_root);
        assert!(engine.verify_locally(&batch.aggregate).unwrap());
        for i in 0..batch.count {
            assert!(batch.verify_member(i).unwrap());
        }
        assert!(!batch.verify_member(5).unwrap());

        let mut reordered = batch.clone();
        reordered.members.swap(0, 1);
        assert!(!reordered.verify_member(0).unwrap());

        let stats = engine.statistics();
        assert_eq!(stats.proofs_generated, 5);
        assert_eq!(stats.batch_proofs_generated, 1);
    }

    #[tokio::test]
    async fn test_async_generation_and_shutdown() {
        let engine = engine();
        let handle = engine
            .generate_proof_async(action(7), CircuitKind::Location)
            .unwrap();
        let proof = handle.join().await.unwrap();
        assert_eq!(proof.circuit, CircuitKind::Location);
        assert_eq!(engine.cached_proof("act_0007"), Some(proof));

        assert!(engine.shutdown(Duration::from_secs(1)).await);
        assert!(matches!(
            engine.generate_proof_async(action(8), CircuitKind::Standard),
            Err(PipelineError::Concurrency(_))
        ));
    }

    #[test]
    fn test_verification_key_restricts_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vk.json");
        std::fs::write(
            &path,
            r#"{"version":"3.0.0","circuits":["worklog_batch_v3"],"public_input_count":6}"#,
        )
        .unwrap();

        let engine = engine();
        engine.load_verification_key(Some(&path)).unwrap();
        let proof = engine.generate_proof(&action(2), CircuitKind::Standard).unwrap();
        assert!(!engine.verify_locally(&proof).unwrap());
    }

    #[test]
    fn test_short_key_rejected_and_short_proof_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vk.json");
        std::fs::write(
            &path,
            r#"{"version":"3.0.0","circuits":["worklog_standard_v3"],"public_input_count":1}"#,
        )
        .unwrap();

        let engine = engine();
        assert!(matches!(
            engine.load_verification_key(Some(&path)),
            Err(PipelineError::Validation(_))
        ));

        let mut proof = engine.generate_proof(&action(3), CircuitKind::Standard).unwrap();
        proof.public_inputs.truncate(1);
        assert!(!engine.verify_locally(&proof).unwrap());

        // Keys set directly skip `load` validation
        *lock(&engine.verification_key) = Some(VerificationKey {
            public_input_count: 1,
            ..VerificationKey::default()
        });
        assert!(!engine.verify_locally(&proof).unwrap());
        proof.public_inputs.clear();
        *lock(&engine.verification_key) = Some(VerificationKey {
            public_input_count: 0,
            ..VerificationKey::default()
        });
        assert!(!engine.verify_locally(&proof).unwrap());
    }

    #[test]
    fn test_average_proving_time() {
        assert_eq!(average(Duration::from_secs(3), 0), Duration::ZERO);
        assert_eq!(average(Duration::from_secs(3), 3), Duration::from_secs(1));
        // Sample counts beyond u32 still divide
        let huge = u64::from(u32::MAX) + 1;
        assert!(average(Duration::from_secs(huge), huge) > Duration::ZERO);
    }
}
