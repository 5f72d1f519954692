//! Proof generation and aggregation
//!
//! ## Flow
//!
//! ```text
//! ActionRecord ──► CircuitInputs (6 public commitments) ──► ProverBackend ──► ProofArtifact
//!                                                                                  │
//!                  [ProofArtifact; n] ──► MerkleAggregator ──► root ──► aggregate ─┘
//!                                                                   BatchProofArtifact
//! ```
//!
//! Single proofs may run on the bounded [`ProofWorkerPool`]; batch members
//! are proved sequentially so leaf order is exactly the caller's order.

pub mod backend;
pub mod engine;
pub mod models;
pub mod pool;

pub use backend::{DeterministicProver, ProverBackend};
pub use engine::{ProofEngine, ProofStatistics};
pub use models::{
    BatchProofArtifact, CircuitInputs, CircuitKind, ProofArtifact, ProofPayload, VerificationKey,
    Witness, PUBLIC_INPUT_COUNT,
};
pub use pool::{ProofHandle, ProofWorkerPool};
