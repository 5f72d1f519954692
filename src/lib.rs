//! Worklog Ledger
//!
//! Tamper-evident work log for autonomous machines: signed actions are
//! appended to a durable store, proved individually or in Merkle-aggregated
//! batches, submitted through a chain client, and the outcomes drive a
//! decaying per-actor reputation score.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── lib.rs         - Crate root with re-exports
//! ├── config.rs      - Configuration management and logging setup
//! ├── error.rs       - Error taxonomy
//! ├── clock.rs       - Time source capability
//! ├── crypto/        - Cryptographic utilities
//! │   ├── signing.rs - Signer capability, Ed25519
//! │   └── merkle.rs  - Merkle aggregation and inclusion proofs
//! ├── actions/       - Action records
//! │   ├── kind.rs    - Closed action kind enumeration
//! │   ├── status.rs  - Proof status state machine
//! │   └── record.rs  - ActionRecord, NewAction, GeoPoint
//! ├── database/      - SQLite persistence
//! │   ├── pool.rs    - Connection pool and startup migration lock
//! │   ├── schema.rs  - Versioned additive migrations
//! │   ├── reader.rs  - Versioned row reader
//! │   ├── actions.rs - ActionStore
//! │   └── reputation.rs - Durable reputation backing
//! ├── proof/         - Proof generation
//! │   ├── models.rs  - Circuits, inputs, artifacts, verification key
//! │   ├── backend.rs - Prover capability
//! │   ├── pool.rs    - Bounded worker pool
//! │   └── engine.rs  - ProofEngine
//! ├── reputation/    - Reputation ledger
//! │   ├── events.rs  - Event kinds and base deltas
//! │   ├── score.rs   - Score, grade, streak, state
//! │   └── ledger.rs  - ReputationLedger
//! └── pipeline.rs    - VerifiedActionPipeline, ChainClient
//! ```

pub mod actions;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod pipeline;
pub mod proof;
pub mod reputation;

// Re-export main types for convenience
pub use actions::{ActionKind, ActionRecord, GeoPoint, NewAction, Payload, ProofStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    init_logging, LoggingConfig, PipelineConfig, ProofConfig, ReputationConfig, StorageConfig,
};
pub use crypto::{Ed25519Signer, MerkleAggregator, MerkleProof, Side, Signer};
pub use database::{ActionStore, DatabasePool, ReputationRepository, StoreEvent, StoreStatistics};
pub use error::{PipelineError, Result};
pub use pipeline::{
    BatchVerification, ChainClient, ChainOutcome, ProcessSummary, Submission, VerifiedActionPipeline,
};
pub use proof::{
    BatchProofArtifact, CircuitKind, DeterministicProver, ProofArtifact, ProofEngine, ProofHandle,
    ProofStatistics, ProverBackend,
};
pub use reputation::{
    Grade, ReputationEvent, ReputationLedger, ReputationRecord, ReputationSnapshot,
    ReputationStatistics,
};
