//! Reputation Score Types
//!
//! Score is bounded to `[min, max]`, decays lazily with inactivity and is
//! amplified for positive events by the actor's daily activity streak.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::reputation::ReputationEvent;

/// Letter grade derived from the current score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    S,
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_score(score: f64) -> Self {
        if score >= 900.0 {
            Grade::S
        } else if score >= 800.0 {
            Grade::A
        } else if score >= 700.0 {
            Grade::B
        } else if score >= 500.0 {
            Grade::C
        } else if score >= 300.0 {
            Grade::D
        } else {
            Grade::F
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Grade::S => "S",
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(letter)
    }
}

/// Consecutive-day activity tracking (UTC calendar days)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakData {
    pub current: u32,
    pub longest: u32,
    pub last_activity: Option<NaiveDate>,
    pub started: Option<NaiveDate>,
    pub total_active_days: u32,
}

impl StreakData {
    /// Multiplier applied to positive deltas for the current streak tier
    pub fn multiplier(&self) -> f64 {
        match self.current {
            0..=2 => 1.0,
            3..=6 => 1.1,
            7..=13 => 1.2,
            14..=29 => 1.3,
            _ => 1.5,
        }
    }

    /// Register activity on `today`.
    ///
    /// Same day is a no-op, the next calendar day extends the streak, and any
    /// gap (or a clock that went backwards) restarts it at 1.
    pub fn touch(&mut self, today: NaiveDate) {
        match self.last_activity {
            None => {
                self.current = 1;
                self.longest = self.longest.max(1);
                self.started = Some(today);
                self.total_active_days += 1;
            }
            Some(last) if last == today => {}
            Some(last) if last.succ_opt() == Some(today) => {
                self.current += 1;
                self.longest = self.longest.max(self.current);
                self.total_active_days += 1;
            }
            Some(_) => {
                self.current = 1;
                self.started = Some(today);
                self.total_active_days += 1;
            }
        }
        self.last_activity = Some(today);
    }
}

/// One applied reputation event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub id: String,
    pub event: ReputationEvent,
    /// Delta actually applied, after clamping
    pub delta: f64,
    /// Unix seconds
    pub timestamp: i64,
    pub reason: String,
    /// External reference, e.g. the transaction that verified a proof
    pub reference: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Running counters of applied deltas
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTotals {
    pub positive_events: u64,
    pub negative_events: u64,
    pub total_earned: f64,
    pub total_lost: f64,
}

impl EventTotals {
    pub fn record(&mut self, delta: f64) {
        if delta > 0.0 {
            self.positive_events += 1;
            self.total_earned += delta;
        } else if delta < 0.0 {
            self.negative_events += 1;
            self.total_lost += delta.abs();
        }
    }

    pub fn net(&self) -> f64 {
        self.total_earned - self.total_lost
    }
}

/// Serializable state of one actor, without the event history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationSnapshot {
    pub actor_id: String,
    pub score: f64,
    pub streak: StreakData,
    pub totals: EventTotals,
    /// Unix seconds of the last decay checkpoint
    pub last_decay_check: i64,
}

/// Full in-memory state of one actor
#[derive(Debug, Clone, PartialEq)]
pub struct ReputationState {
    pub actor_id: String,
    pub score: f64,
    pub history: Vec<ReputationRecord>,
    pub streak: StreakData,
    pub totals: EventTotals,
    pub last_decay_check: i64,
}

impl ReputationState {
    pub fn new(actor_id: impl Into<String>, score: f64, now: i64) -> Self {
        Self {
            actor_id: actor_id.into(),
            score,
            history: Vec::new(),
            streak: StreakData::default(),
            totals: EventTotals::default(),
            last_decay_check: now,
        }
    }

    pub fn from_snapshot(snapshot: ReputationSnapshot, history: Vec<ReputationRecord>) -> Self {
        Self {
            actor_id: snapshot.actor_id,
            score: snapshot.score,
            history,
            streak: snapshot.streak,
            totals: snapshot.totals,
            last_decay_check: snapshot.last_decay_check,
        }
    }

    pub fn snapshot(&self) -> ReputationSnapshot {
        ReputationSnapshot {
            actor_id: self.actor_id.clone(),
            score: self.score,
            streak: self.streak.clone(),
            totals: self.totals.clone(),
            last_decay_check: self.last_decay_check,
        }
    }

    /// Undo every change made since `checkpoint` was taken with `history_len` records.
    pub fn rollback(&mut self, checkpoint: ReputationSnapshot, history_len: usize) {
        self.score = checkpoint.score;
        self.streak = checkpoint.streak;
        self.totals = checkpoint.totals;
        self.last_decay_check = checkpoint.last_decay_check;
        self.history.truncate(history_len);
    }

    /// `score *= (1 - rate)^hours`, floored at `min`. The checkpoint only
    /// moves once at least one hour has elapsed. Returns whether decay ran.
    pub fn apply_decay(&mut self, now: i64, rate_per_hour: f64, min: f64) -> bool {
        let hours_elapsed = (now - self.last_decay_check) as f64 / 3600.0;
        if hours_elapsed < 1.0 {
            return false;
        }

        let factor = (1.0 - rate_per_hour).powf(hours_elapsed);
        self.score = (self.score * factor).max(min);
        self.last_decay_check = now;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreakSummary {
    pub current: u32,
    pub longest: u32,
    pub total_active_days: u32,
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventCounts {
    pub total: usize,
    pub positive: u64,
    pub negative: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreChanges {
    pub earned: f64,
    pub lost: f64,
    pub net: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReputationStatistics {
    pub actor_id: String,
    pub current_score: f64,
    pub normalized_score: f64,
    pub grade: Grade,
    pub streak: StreakSummary,
    pub events: EventCounts,
    pub totals: ScoreChanges,
}
