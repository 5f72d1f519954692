//! Error taxonomy shared by the store, the proof engine, the ledger and the pipeline.

use thiserror::Error;

/// Errors surfaced by every component of the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad caller input. Rejected synchronously, nothing was applied.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Storage I/O failure. Always propagated.
    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),

    /// The prover backend failed for an action.
    #[error("proof generation failed for {action_id}: {reason}")]
    ProofGeneration { action_id: String, reason: String },

    /// Lock acquisition timed out or the worker pool is unavailable. Retryable.
    #[error("concurrency failure: {0}")]
    Concurrency(String),

    /// Payload or metadata could not be encoded/decoded.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The chain client reported a transport failure.
    #[error("chain client failure: {0}")]
    Chain(String),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn concurrency(msg: impl Into<String>) -> Self {
        Self::Concurrency(msg.into())
    }

    pub fn proof_generation(action_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProofGeneration {
            action_id: action_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call can succeed without changing the input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Concurrency(_) | PipelineError::ProofGeneration { .. }
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::concurrency("lock timeout").is_retryable());
        assert!(PipelineError::proof_generation("act_1", "backend down").is_retryable());
        assert!(!PipelineError::validation("batch too large").is_retryable());
        assert!(!PipelineError::Chain("rpc unreachable".into()).is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = PipelineError::proof_generation("act_1", "backend down");
        assert_eq!(
            err.to_string(),
            "proof generation failed for act_1: backend down"
        );
    }
}
