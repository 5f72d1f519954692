//! Verified Action Pipeline
//!
//! Walks actions through the proof status machine:
//!
//! ```text
//! PENDING -> GENERATING -> GENERATED -> SUBMITTING -> SUBMITTED -> VERIFIED
//!                 |            |            |
//!                 +-> FAILED   +-> FAILED   +-> REJECTED / FAILED
//! ```
//!
//! Every chain outcome is turned into a reputation event for the action's
//! actor. The pipeline never holds the store's write lock and a ledger lock
//! at the same time.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::actions::{ActionRecord, NewAction, ProofStatus};
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::crypto::Signer;
use crate::database::{ActionStore, DatabasePool};
use crate::error::{PipelineError, Result};
use crate::proof::{BatchProofArtifact, CircuitKind, ProofArtifact, ProofEngine, ProverBackend};
use crate::reputation::ReputationLedger;

/// What gets handed to the chain client
#[derive(Debug, Clone, Copy)]
pub enum Submission<'a> {
    Single {
        action_id: &'a str,
        proof: &'a ProofArtifact,
    },
    Batch(&'a BatchProofArtifact),
}

/// Settled result of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    Confirmed { tx_ref: String },
    Rejected { tx_ref: String, reason: String },
}

/// Ledger submission capability. An `Err` is a transport failure; a proof
/// the chain refused is `Ok(ChainOutcome::Rejected { .. })`.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn submit(&self, submission: Submission<'_>) -> anyhow::Result<ChainOutcome>;
}

/// Counts from one `process_pending` run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub attempted: usize,
    pub verified: usize,
    pub rejected: usize,
    /// Proved but not submitted (no chain client)
    pub generated: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct BatchVerification {
    pub batch: BatchProofArtifact,
    /// Member records in batch order, after the final transition
    pub records: Vec<ActionRecord>,
}

pub struct VerifiedActionPipeline {
    store: Arc<ActionStore>,
    engine: Arc<ProofEngine>,
    ledger: Arc<ReputationLedger>,
    chain: Option<Arc<dyn ChainClient>>,
    shutdown_timeout: Duration,
}

impl VerifiedActionPipeline {
    pub fn new(store: Arc<ActionStore>, engine: Arc<ProofEngine>, ledger: Arc<ReputationLedger>) -> Self {
        let shutdown_timeout = engine.config().shutdown_timeout();
        Self {
            store,
            engine,
            ledger,
            chain: None,
            shutdown_timeout,
        }
    }

    /// Open the database described by `config` and wire all three components to it.
    pub async fn open(
        config: &PipelineConfig,
        signer: Arc<dyn Signer>,
        backend: Arc<dyn ProverBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| PipelineError::validation(format!("{:#}", e)))?;
        let db = DatabasePool::open(&config.storage).await?;

        let store = ActionStore::new(db.pool().clone(), signer, clock.clone(), config.storage.clone());
        let engine = ProofEngine::new(config.proof.clone(), backend, clock.clone());
        let ledger = ReputationLedger::new(config.reputation.clone(), clock)?
            .with_repository(db.reputation().clone());

        Ok(Self::new(Arc::new(store), Arc::new(engine), Arc::new(ledger)))
    }

    pub fn with_chain_client(mut self, chain: Arc<dyn ChainClient>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn store(&self) -> &Arc<ActionStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<ProofEngine> {
        &self.engine
    }

    pub fn ledger(&self) -> &Arc<ReputationLedger> {
        &self.ledger
    }

    async fn require(&self, id: &str) -> Result<ActionRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::validation(format!("unknown action {}", id)))
    }

    async fn transition(
        &self,
        id: &str,
        status: ProofStatus,
        tx_ref: Option<&str>,
        proof_ref: Option<&str>,
    ) -> Result<ActionRecord> {
        self.store.update_status(id, status, tx_ref, proof_ref).await
    }

    /// Mark `ids` as FAILED after a proof error, logging rather than masking
    /// the original error if the status write itself fails.
    async fn fail_all(&self, ids: &[String], cause: &PipelineError) {
        for id in ids {
            if let Err(e) = self.transition(id, ProofStatus::Failed, None, None).await {
                warn!(action_id = %id, "Could not mark action failed after {}: {}", cause, e);
            }
        }
    }

    // ========================================================================
    // Single Actions
    // ========================================================================

    pub async fn record(&self, action: NewAction) -> Result<ActionRecord> {
        self.store.append(action).await
    }

    /// Generate a proof for a PENDING (or interrupted GENERATING) action on
    /// the worker pool and move it to GENERATED, or to FAILED on backend error.
    pub async fn prove_action(&self, id: &str, circuit: CircuitKind) -> Result<ProofArtifact> {
        let record = self.require(id).await?;
        let record = match record.status {
            ProofStatus::Pending => self.transition(id, ProofStatus::Generating, None, None).await?,
            ProofStatus::Generating => record,
            other => {
                return Err(PipelineError::validation(format!(
                    "action {} is {}, expected pending",
                    id, other
                )))
            }
        };

        let handle = self.engine.generate_proof_async(record, circuit)?;
        match handle.join().await {
            Ok(proof) => {
                self.transition(id, ProofStatus::Generated, None, Some(&proof.proof_id))
                    .await?;
                Ok(proof)
            }
            Err(e @ PipelineError::ProofGeneration { .. }) => {
                self.fail_all(&[id.to_string()], &e).await;
                Err(e)
            }
            // Pool unavailable: the action stays GENERATING for a retry
            Err(e) => Err(e),
        }
    }

    /// Submit the cached proof of a GENERATED action and settle the outcome.
    pub async fn submit_action(&self, id: &str) -> Result<ActionRecord> {
        let chain = self
            .chain
            .clone()
            .ok_or_else(|| PipelineError::validation("no chain client configured"))?;

        let record = self.require(id).await?;
        if record.status != ProofStatus::Generated {
            return Err(PipelineError::validation(format!(
                "action {} is {}, expected generated",
                id, record.status
            )));
        }
        let proof = self
            .engine
            .cached_proof(id)
            .ok_or_else(|| PipelineError::validation(format!("no proof cached for {}", id)))?;

        self.transition(id, ProofStatus::Submitting, None, None).await?;
        let outcome = chain
            .submit(Submission::Single {
                action_id: id,
                proof: &proof,
            })
            .await;

        let ids = [id.to_string()];
        let mut settled = self.settle(&ids, &record.actor_id, outcome).await?;
        settled
            .pop()
            .ok_or_else(|| PipelineError::validation(format!("unknown action {}", id)))
    }

    /// Prove, check locally, and submit when a chain client is configured.
    pub async fn verify_action(&self, id: &str) -> Result<ActionRecord> {
        let record = self.require(id).await?;
        let proof = match record.status {
            ProofStatus::Generated => self
                .engine
                .cached_proof(id)
                .ok_or_else(|| PipelineError::validation(format!("no proof cached for {}", id)))?,
            _ => self.prove_action(id, CircuitKind::Standard).await?,
        };

        if !self.engine.verify_locally(&proof)? {
            let e = PipelineError::proof_generation(id, "local verification failed");
            self.fail_all(&[id.to_string()], &e).await;
            return Err(e);
        }

        if self.chain.is_some() {
            self.submit_action(id).await
        } else {
            self.require(id).await
        }
    }

    /// Verify up to `limit` pending actions, oldest first. Failures are
    /// counted and logged; they never stop the run.
    pub async fn process_pending(&self, limit: u32) -> Result<ProcessSummary> {
        let pending = self.store.query_pending(limit).await?;
        let mut summary = ProcessSummary {
            attempted: pending.len(),
            ..Default::default()
        };

        for record in pending {
            match self.verify_action(&record.id).await {
                Ok(updated) => match updated.status {
                    ProofStatus::Verified => summary.verified += 1,
                    ProofStatus::Rejected => summary.rejected += 1,
                    _ => summary.generated += 1,
                },
                Err(e) => {
                    warn!(action_id = %record.id, "Verification failed: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            attempted = summary.attempted,
            verified = summary.verified,
            rejected = summary.rejected,
            failed = summary.failed,
            "Processed pending actions"
        );
        Ok(summary)
    }

    // ========================================================================
    // Batches
    // ========================================================================

    /// Prove `ids` as one batch in the given order, attach them to the
    /// aggregate proof id, and submit once.
    pub async fn verify_batch(&self, ids: &[String]) -> Result<BatchVerification> {
        let max = self.engine.config().max_batch_size;
        if ids.is_empty() {
            return Err(PipelineError::validation("batch needs at least one action"));
        }
        if ids.len() > max {
            return Err(PipelineError::validation(format!(
                "Batch size {} exceeds maximum {}",
                ids.len(),
                max
            )));
        }

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let record = self.require(id).await?;
            if record.status != ProofStatus::Pending {
                return Err(PipelineError::validation(format!(
                    "action {} is {}, expected pending",
                    id, record.status
                )));
            }
            records.push(record);
        }

        for id in ids {
            self.transition(id, ProofStatus::Generating, None, None).await?;
        }

        let engine = self.engine.clone();
        let proved = tokio::task::spawn_blocking(move || engine.generate_batch_proof(&records))
            .await
            .map_err(|e| PipelineError::concurrency(format!("batch proof job aborted: {}", e)))?;
        let batch = match proved {
            Ok(batch) => batch,
            Err(e) => {
                self.fail_all(ids, &e).await;
                return Err(e);
            }
        };

        if !self.engine.verify_locally(&batch.aggregate)? {
            let e = PipelineError::proof_generation(&batch.aggregate.proof_id, "local verification failed");
            self.fail_all(ids, &e).await;
            return Err(e);
        }

        self.store.assign_batch(ids, &batch.aggregate.proof_id).await?;
        let mut generated = Vec::with_capacity(ids.len());
        for (id, member) in ids.iter().zip(&batch.members) {
            generated.push(
                self.transition(id, ProofStatus::Generated, None, Some(&member.proof_id))
                    .await?,
            );
        }

        let Some(chain) = self.chain.clone() else {
            return Ok(BatchVerification {
                batch,
                records: generated,
            });
        };

        for id in ids {
            self.transition(id, ProofStatus::Submitting, None, None).await?;
        }
        let outcome = chain.submit(Submission::Batch(&batch)).await;

        // A batch is signed by one store, so every member shares an actor
        let actor_id = generated
            .first()
            .map(|r| r.actor_id.clone())
            .unwrap_or_else(|| self.store.actor_id().to_string());
        let records = self.settle(ids, &actor_id, outcome).await?;

        info!(
            proof_id = %batch.aggregate.proof_id,
            members = batch.count,
            "Batch settled"
        );
        Ok(BatchVerification { batch, records })
    }

    /// Apply a chain outcome to every id (all currently SUBMITTING) and
    /// record the matching reputation events.
    async fn settle(
        &self,
        ids: &[String],
        actor_id: &str,
        outcome: anyhow::Result<ChainOutcome>,
    ) -> Result<Vec<ActionRecord>> {
        let mut records = Vec::with_capacity(ids.len());

        match outcome {
            Ok(ChainOutcome::Confirmed { tx_ref }) => {
                self.engine.record_submission();
                for id in ids {
                    self.transition(id, ProofStatus::Submitted, Some(&tx_ref), None)
                        .await?;
                    records.push(self.transition(id, ProofStatus::Verified, None, None).await?);
                    self.ledger.apply_proof_verified(actor_id, &tx_ref).await?;
                }
                info!(tx_ref = %tx_ref, actions = ids.len(), "Proof verified on-chain");
            }
            Ok(ChainOutcome::Rejected { tx_ref, reason }) => {
                for id in ids {
                    records.push(
                        self.transition(id, ProofStatus::Rejected, Some(&tx_ref), None)
                            .await?,
                    );
                    self.ledger.apply_task_failed(actor_id, id, &reason).await?;
                }
                warn!(tx_ref = %tx_ref, actions = ids.len(), "Proof rejected on-chain: {}", reason);
            }
            Err(e) => {
                let error = PipelineError::Chain(format!("{:#}", e));
                self.fail_all(ids, &error).await;
                return Err(error);
            }
        }

        Ok(records)
    }

    /// Drain the proof worker pool. Jobs still queued at the deadline are
    /// dropped and their actions stay GENERATING.
    pub async fn shutdown(&self) -> bool {
        self.engine.shutdown(self.shutdown_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionKind;
    use crate::clock::ManualClock;
    use crate::config::StorageConfig;
    use crate::crypto::Ed25519Signer;
    use crate::proof::DeterministicProver;
    use serde_json::json;

    async fn pipeline() -> VerifiedActionPipeline {
        let config = PipelineConfig {
            storage: StorageConfig::in_memory(),
            ..PipelineConfig::default()
        };
        VerifiedActionPipeline::open(
            &config,
            Arc::new(Ed25519Signer::from_seed(&[3u8; 32])),
            Arc::new(DeterministicProver),
            Arc::new(ManualClock::at_unix(1_700_000_000)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_verify_without_chain_stops_at_generated() {
        let pipeline = pipeline().await;
        let record = pipeline
            .record(NewAction::from_json(ActionKind::Heartbeat, json!({"battery": 81})).unwrap())
            .await
            .unwrap();

        let updated = pipeline.verify_action(&record.id).await.unwrap();
        assert_eq!(updated.status, ProofStatus::Generated);
        assert!(updated.proof_ref.as_deref().unwrap().starts_with("prf_"));

        assert!(matches!(
            pipeline.submit_action(&record.id).await,
            Err(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_prove_rejects_settled_action() {
        let pipeline = pipeline().await;
        let record = pipeline
            .record(NewAction::from_json(ActionKind::Heartbeat, json!({})).unwrap())
            .await
            .unwrap();
        pipeline
            .prove_action(&record.id, CircuitKind::Lightweight)
            .await
            .unwrap();

        assert!(matches!(
            pipeline.prove_action(&record.id, CircuitKind::Standard).await,
            Err(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_then_prove_keeps_action_retryable() {
        let pipeline = pipeline().await;
        let record = pipeline
            .record(NewAction::from_json(ActionKind::Heartbeat, json!({})).unwrap())
            .await
            .unwrap();

        assert!(pipeline.shutdown().await);
        let err = pipeline
            .prove_action(&record.id, CircuitKind::Standard)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let stored = pipeline.store().get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProofStatus::Generating);
    }

    #[tokio::test]
    async fn test_open_rejects_inverted_reputation_bounds() {
        let mut config = PipelineConfig {
            storage: StorageConfig::in_memory(),
            ..PipelineConfig::default()
        };
        config.reputation.min_score = 10.0;
        config.reputation.max_score = 5.0;

        let result = VerifiedActionPipeline::open(
            &config,
            Arc::new(Ed25519Signer::from_seed(&[3u8; 32])),
            Arc::new(DeterministicProver),
            Arc::new(ManualClock::at_unix(1_700_000_000)),
        )
        .await;
        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }
}
