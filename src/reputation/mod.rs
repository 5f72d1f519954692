//! Reputation Ledger for Autonomous Actors
//!
//! Scores every actor on a bounded scale from named events. Positive events
//! are amplified by daily activity streaks, penalties are not, and scores
//! decay lazily while an actor is idle.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐     ┌──────────────────────┐
//! │ ReputationEvent │────►│ ReputationLedger │────►│ ReputationRepository │
//! │ (base deltas)   │     │ (per-actor locks)│     │ (optional, SQLite)   │
//! └─────────────────┘     └──────────────────┘     └──────────────────────┘
//!                                  │
//!                                  ▼
//!                          ┌──────────────────┐
//!                          │ ReputationState  │
//!                          │ (score, streak,  │
//!                          │  history)        │
//!                          └──────────────────┘
//! ```
//!
//! ## Score Model
//!
//! - Score starts at the configured initial value and stays in `[min, max]`
//! - Positive delta = base x quality x streak tier, penalties = base x quality
//! - Decay `score * (1 - rate)^hours` runs once at least an hour has passed
//! - Grades: S >= 900, A >= 800, B >= 700, C >= 500, D >= 300, else F

mod events;
mod ledger;
mod score;

pub use events::ReputationEvent;
pub use ledger::{ReputationLedger, STREAK_BONUS_MIN_DAYS};
pub use score::{
    EventCounts, EventTotals, Grade, ReputationRecord, ReputationSnapshot, ReputationState,
    ReputationStatistics, ScoreChanges, StreakData, StreakSummary,
};
