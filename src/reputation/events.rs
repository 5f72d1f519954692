use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Named events that move an actor's reputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReputationEvent {
    ProofVerified,
    TaskCompleted,
    TaskFailed,
    GeofenceViolation,
    TamperDetected,
    UptimeBonus,
    StreakBonus,
    FirstTask,
    QualityBonus,
    SpeedBonus,
    PeerEndorsement,
    OperatorPenalty,
}

impl ReputationEvent {
    pub const ALL: [ReputationEvent; 12] = [
        ReputationEvent::ProofVerified,
        ReputationEvent::TaskCompleted,
        ReputationEvent::TaskFailed,
        ReputationEvent::GeofenceViolation,
        ReputationEvent::TamperDetected,
        ReputationEvent::UptimeBonus,
        ReputationEvent::StreakBonus,
        ReputationEvent::FirstTask,
        ReputationEvent::QualityBonus,
        ReputationEvent::SpeedBonus,
        ReputationEvent::PeerEndorsement,
        ReputationEvent::OperatorPenalty,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ReputationEvent::ProofVerified => "proof_verified",
            ReputationEvent::TaskCompleted => "task_completed",
            ReputationEvent::TaskFailed => "task_failed",
            ReputationEvent::GeofenceViolation => "geofence_violation",
            ReputationEvent::TamperDetected => "tamper_detected",
            ReputationEvent::UptimeBonus => "uptime_bonus",
            ReputationEvent::StreakBonus => "streak_bonus",
            ReputationEvent::FirstTask => "first_task",
            ReputationEvent::QualityBonus => "quality_bonus",
            ReputationEvent::SpeedBonus => "speed_bonus",
            ReputationEvent::PeerEndorsement => "peer_endorsement",
            ReputationEvent::OperatorPenalty => "operator_penalty",
        }
    }

    /// Score change before quality and streak multipliers.
    pub fn base_delta(&self) -> f64 {
        match self {
            ReputationEvent::ProofVerified => 1.0,
            ReputationEvent::TaskCompleted => 2.0,
            ReputationEvent::TaskFailed => -5.0,
            ReputationEvent::GeofenceViolation => -10.0,
            ReputationEvent::TamperDetected => -50.0,
            ReputationEvent::UptimeBonus => 0.5,
            ReputationEvent::StreakBonus => 1.5,
            ReputationEvent::FirstTask => 5.0,
            ReputationEvent::QualityBonus => 3.0,
            ReputationEvent::SpeedBonus => 1.0,
            ReputationEvent::PeerEndorsement => 2.0,
            ReputationEvent::OperatorPenalty => -20.0,
        }
    }

    pub fn is_penalty(&self) -> bool {
        self.base_delta() < 0.0
    }
}

impl fmt::Display for ReputationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReputationEvent {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReputationEvent::ALL
            .iter()
            .copied()
            .find(|event| event.name() == s)
            .ok_or_else(|| PipelineError::validation(format!("unknown reputation event: {}", s)))
    }
}
