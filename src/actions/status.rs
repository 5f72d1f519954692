use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Proof lifecycle of an action record.
///
/// ```text
/// PENDING -> GENERATING -> GENERATED -> SUBMITTING -> SUBMITTED -> VERIFIED
/// any non-terminal state -> FAILED | REJECTED | EXPIRED
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofStatus {
    #[default]
    Pending,
    Generating,
    Generated,
    Submitting,
    Submitted,
    Verified,
    Failed,
    Rejected,
    Expired,
}

impl ProofStatus {
    pub const ALL: [ProofStatus; 9] = [
        ProofStatus::Pending,
        ProofStatus::Generating,
        ProofStatus::Generated,
        ProofStatus::Submitting,
        ProofStatus::Submitted,
        ProofStatus::Verified,
        ProofStatus::Failed,
        ProofStatus::Rejected,
        ProofStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProofStatus::Pending => "pending",
            ProofStatus::Generating => "generating",
            ProofStatus::Generated => "generated",
            ProofStatus::Submitting => "submitting",
            ProofStatus::Submitted => "submitted",
            ProofStatus::Verified => "verified",
            ProofStatus::Failed => "failed",
            ProofStatus::Rejected => "rejected",
            ProofStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProofStatus::Verified | ProofStatus::Failed | ProofStatus::Rejected | ProofStatus::Expired
        )
    }

    /// Next state on the happy path, if any.
    pub fn successor(&self) -> Option<ProofStatus> {
        match self {
            ProofStatus::Pending => Some(ProofStatus::Generating),
            ProofStatus::Generating => Some(ProofStatus::Generated),
            ProofStatus::Generated => Some(ProofStatus::Submitting),
            ProofStatus::Submitting => Some(ProofStatus::Submitted),
            ProofStatus::Submitted => Some(ProofStatus::Verified),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal forward edge.
    pub fn can_transition_to(&self, next: ProofStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            ProofStatus::Failed | ProofStatus::Rejected | ProofStatus::Expired => true,
            other => self.successor() == Some(other),
        }
    }
}

impl fmt::Display for ProofStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProofStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProofStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| PipelineError::validation(format!("unknown proof status: {}", s)))
    }
}
