//! Reputation Ledger - Main Orchestrator
//!
//! Keeps one lazily created, individually locked state per actor. Every
//! mutation (decay, delta, streak update, history append) happens under that
//! actor's lock and, when a repository is attached, is persisted before the
//! lock is released. A failed write rolls the in-memory state back, so memory
//! never runs ahead of the database.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::actions::GeoPoint;
use crate::clock::Clock;
use crate::config::ReputationConfig;
use crate::database::ReputationRepository;
use crate::error::{PipelineError, Result};
use crate::reputation::{
    EventCounts, Grade, ReputationEvent, ReputationRecord, ReputationSnapshot, ReputationState,
    ReputationStatistics, ScoreChanges, StreakSummary,
};

/// Streak length (days) from which the streak bonus can be claimed
pub const STREAK_BONUS_MIN_DAYS: u32 = 7;

/// Upper bound for the streak bonus quality multiplier
const STREAK_BONUS_MAX_MULTIPLIER: f64 = 3.0;

type ActorState = Arc<Mutex<ReputationState>>;

/// Extra inputs for one event application
#[derive(Debug, Clone, Default)]
struct EventInput {
    reason: Option<String>,
    multiplier: Option<f64>,
    metadata: Map<String, Value>,
    reference: Option<String>,
}

pub struct ReputationLedger {
    config: ReputationConfig,
    clock: Arc<dyn Clock>,
    repository: Option<Arc<ReputationRepository>>,

    /// Per-actor state, each behind its own lock
    actors: RwLock<HashMap<String, ActorState>>,
}

impl ReputationLedger {
    /// Fails with a validation error when the configured bounds or decay rate are unusable.
    pub fn new(config: ReputationConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| PipelineError::validation(e.to_string()))?;

        Ok(Self {
            config,
            clock,
            repository: None,
            actors: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_repository(mut self, repository: Arc<ReputationRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    /// Get or create the state for an actor, loading it from the repository on first access
    async fn actor(&self, actor_id: &str) -> Result<ActorState> {
        {
            let actors = self.actors.read().await;
            if let Some(state) = actors.get(actor_id) {
                return Ok(state.clone());
            }
        }

        let loaded = match &self.repository {
            Some(repository) => repository.load(actor_id).await?,
            None => None,
        };
        let state = loaded.unwrap_or_else(|| {
            debug!(actor_id = %actor_id, "New reputation state");
            ReputationState::new(actor_id, self.config.initial_score, self.clock.unix_seconds())
        });

        let mut actors = self.actors.write().await;
        Ok(actors
            .entry(actor_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(state)))
            .clone())
    }

    fn decay(&self, state: &mut ReputationState) -> bool {
        state.apply_decay(
            self.clock.unix_seconds(),
            self.config.decay_rate_per_hour,
            self.config.min_score,
        )
    }

    async fn persist(&self, state: &ReputationState, record: Option<&ReputationRecord>) -> Result<()> {
        if let Some(repository) = &self.repository {
            repository.persist(state, record).await?;
        }
        Ok(())
    }

    /// Persist `state`, or restore it to `checkpoint` if the write fails.
    async fn commit(
        &self,
        state: &mut ReputationState,
        checkpoint: (ReputationSnapshot, usize),
        record: Option<&ReputationRecord>,
    ) -> Result<()> {
        if let Err(e) = self.persist(state, record).await {
            warn!(actor_id = %state.actor_id, error = %e, "Reputation write failed; rolled back");
            let (snapshot, history_len) = checkpoint;
            state.rollback(snapshot, history_len);
            return Err(e);
        }
        Ok(())
    }

    /// Apply pending decay, persisting it if anything changed
    async fn settle_decay(&self, state: &mut ReputationState) -> Result<()> {
        let checkpoint = checkpoint(state);
        if self.decay(state) {
            self.commit(state, checkpoint, None).await?;
        }
        Ok(())
    }

    /// Current score after applying pending decay
    pub async fn score(&self, actor_id: &str) -> Result<f64> {
        let actor = self.actor(actor_id).await?;
        let mut state = actor.lock().await;
        self.settle_decay(&mut state).await?;
        Ok(state.score)
    }

    /// Score scaled to `[0, 1]` by the configured maximum
    pub async fn normalized_score(&self, actor_id: &str) -> Result<f64> {
        Ok(self.score(actor_id).await? / self.config.max_score)
    }

    pub async fn grade(&self, actor_id: &str) -> Result<Grade> {
        Ok(Grade::from_score(self.score(actor_id).await?))
    }

    pub async fn streak(&self, actor_id: &str) -> Result<u32> {
        let actor = self.actor(actor_id).await?;
        let state = actor.lock().await;
        Ok(state.streak.current)
    }

    /// Record an event for an actor and update the score.
    ///
    /// `quality_multiplier` scales the base delta; for positive events the
    /// streak multiplier is applied on top. The applied delta is clamped so
    /// the score stays within bounds, and the clamped value is what gets recorded.
    pub async fn record_event(
        &self,
        actor_id: &str,
        event: ReputationEvent,
        reason: Option<&str>,
        quality_multiplier: f64,
        metadata: Option<Map<String, Value>>,
    ) -> Result<ReputationRecord> {
        self.apply(
            actor_id,
            event,
            EventInput {
                reason: reason.map(str::to_string),
                multiplier: Some(quality_multiplier),
                metadata: metadata.unwrap_or_default(),
                reference: None,
            },
        )
        .await
    }

    async fn apply(
        &self,
        actor_id: &str,
        event: ReputationEvent,
        input: EventInput,
    ) -> Result<ReputationRecord> {
        let multiplier = input.multiplier.unwrap_or(1.0);
        if !multiplier.is_finite() || multiplier < 0.0 {
            return Err(PipelineError::validation(format!(
                "quality multiplier must be finite and non-negative, got {}",
                multiplier
            )));
        }

        let actor = self.actor(actor_id).await?;
        let mut state = actor.lock().await;
        let checkpoint = checkpoint(&state);
        let record = self.apply_locked(&mut state, event, multiplier, input);
        self.commit(&mut state, checkpoint, Some(&record)).await?;
        Ok(record)
    }

    fn apply_locked(
        &self,
        state: &mut ReputationState,
        event: ReputationEvent,
        multiplier: f64,
        input: EventInput,
    ) -> ReputationRecord {
        self.decay(state);

        let streak_multiplier = state.streak.multiplier();
        let base_delta = event.base_delta();
        let final_delta = if base_delta > 0.0 {
            base_delta * multiplier * streak_multiplier
        } else {
            base_delta * multiplier
        };

        let old_score = state.score;
        state.score = (state.score + final_delta).clamp(self.config.min_score, self.config.max_score);
        let actual_delta = state.score - old_score;
        state.totals.record(actual_delta);

        let now = self.clock.now();
        state.streak.touch(now.date_naive());

        let record = ReputationRecord {
            id: format!("rep_{}_{}", now.timestamp(), state.history.len()),
            event,
            delta: actual_delta,
            timestamp: now.timestamp(),
            reason: input.reason.unwrap_or_else(|| event.name().to_string()),
            reference: input.reference,
            metadata: input.metadata,
        };
        state.history.push(record.clone());

        info!(
            actor_id = %state.actor_id,
            event = %event,
            delta = actual_delta,
            score = state.score,
            "Reputation event"
        );
        record
    }

    /// Successful on-chain verification of a proof
    pub async fn apply_proof_verified(&self, actor_id: &str, tx_ref: &str) -> Result<ReputationRecord> {
        let prefix: String = tx_ref.chars().take(16).collect();
        self.apply(
            actor_id,
            ReputationEvent::ProofVerified,
            EventInput {
                reason: Some(format!("Proof verified on-chain: {}", prefix)),
                metadata: object(json!({ "tx_ref": tx_ref })),
                reference: Some(tx_ref.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    /// Task completion; `quality_score` in `[0, 1]` selects a quality multiplier
    pub async fn apply_task_completed(
        &self,
        actor_id: &str,
        task_id: &str,
        quality_score: f64,
    ) -> Result<ReputationRecord> {
        let multiplier = if quality_score >= 0.95 {
            1.5
        } else if quality_score >= 0.9 {
            1.2
        } else {
            1.0
        };

        self.apply(
            actor_id,
            ReputationEvent::TaskCompleted,
            EventInput {
                reason: Some(format!("Task completed: {}", task_id)),
                multiplier: Some(multiplier),
                metadata: object(json!({ "task_id": task_id, "quality_score": quality_score })),
                reference: Some(task_id.to_string()),
            },
        )
        .await
    }

    pub async fn apply_task_failed(
        &self,
        actor_id: &str,
        task_id: &str,
        reason: &str,
    ) -> Result<ReputationRecord> {
        self.apply(
            actor_id,
            ReputationEvent::TaskFailed,
            EventInput {
                reason: Some(format!("Task failed: {} - {}", task_id, reason)),
                metadata: object(json!({ "task_id": task_id, "failure_reason": reason })),
                reference: Some(task_id.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn apply_geofence_violation(
        &self,
        actor_id: &str,
        zone_id: &str,
        location: GeoPoint,
    ) -> Result<ReputationRecord> {
        warn!(actor_id = %actor_id, zone_id = %zone_id, "Geofence violation");
        self.apply(
            actor_id,
            ReputationEvent::GeofenceViolation,
            EventInput {
                reason: Some(format!("Geofence violation in zone: {}", zone_id)),
                metadata: object(json!({ "zone_id": zone_id, "location": location.to_value() })),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn apply_tamper_detected(&self, actor_id: &str, details: &str) -> Result<ReputationRecord> {
        warn!(actor_id = %actor_id, "Tamper detected: {}", details);
        self.apply(
            actor_id,
            ReputationEvent::TamperDetected,
            EventInput {
                reason: Some(format!("Tamper detected: {}", details)),
                metadata: object(json!({ "details": details })),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn apply_peer_endorsement(
        &self,
        actor_id: &str,
        endorser_id: &str,
        endorsement_type: &str,
    ) -> Result<ReputationRecord> {
        let prefix: String = endorser_id.chars().take(20).collect();
        self.apply(
            actor_id,
            ReputationEvent::PeerEndorsement,
            EventInput {
                reason: Some(format!("Peer endorsement from {}", prefix)),
                metadata: object(json!({ "endorser": endorser_id, "type": endorsement_type })),
                reference: Some(endorser_id.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    /// Apply the streak bonus if the current streak qualifies; the check and
    /// the application happen under one lock.
    pub async fn apply_streak_bonus(&self, actor_id: &str) -> Result<Option<ReputationRecord>> {
        let actor = self.actor(actor_id).await?;
        let mut state = actor.lock().await;

        let streak = state.streak.current;
        if streak < STREAK_BONUS_MIN_DAYS {
            return Ok(None);
        }

        let multiplier = (f64::from(streak) / f64::from(STREAK_BONUS_MIN_DAYS))
            .min(STREAK_BONUS_MAX_MULTIPLIER);
        let checkpoint = checkpoint(&state);
        let record = self.apply_locked(
            &mut state,
            ReputationEvent::StreakBonus,
            multiplier,
            EventInput {
                reason: Some(format!("{}-day streak bonus", streak)),
                metadata: object(json!({ "streak_days": streak })),
                ..Default::default()
            },
        );
        self.commit(&mut state, checkpoint, Some(&record)).await?;
        Ok(Some(record))
    }

    /// Newest-first history, optionally restricted to `kinds`
    pub async fn history(
        &self,
        actor_id: &str,
        limit: usize,
        kinds: Option<&[ReputationEvent]>,
    ) -> Result<Vec<ReputationRecord>> {
        let actor = self.actor(actor_id).await?;
        let state = actor.lock().await;
        Ok(state
            .history
            .iter()
            .rev()
            .filter(|record| kinds.map_or(true, |kinds| kinds.contains(&record.event)))
            .take(limit)
            .cloned()
            .collect())
    }

    pub async fn statistics(&self, actor_id: &str) -> Result<ReputationStatistics> {
        let actor = self.actor(actor_id).await?;
        let mut state = actor.lock().await;
        self.settle_decay(&mut state).await?;

        Ok(ReputationStatistics {
            actor_id: state.actor_id.clone(),
            current_score: state.score,
            normalized_score: state.score / self.config.max_score,
            grade: Grade::from_score(state.score),
            streak: StreakSummary {
                current: state.streak.current,
                longest: state.streak.longest,
                total_active_days: state.streak.total_active_days,
                multiplier: state.streak.multiplier(),
            },
            events: EventCounts {
                total: state.history.len(),
                positive: state.totals.positive_events,
                negative: state.totals.negative_events,
            },
            totals: ScoreChanges {
                earned: state.totals.total_earned,
                lost: state.totals.total_lost,
                net: state.totals.net(),
            },
        })
    }

    /// Reset an actor to a fresh state. `score` defaults to the configured initial score.
    pub async fn reset(&self, actor_id: &str, score: Option<f64>) -> Result<()> {
        let score = score.unwrap_or(self.config.initial_score);
        self.check_bounds(score)?;

        let actor = self.actor(actor_id).await?;
        let mut state = actor.lock().await;
        let fresh = ReputationState::new(actor_id, score, self.clock.unix_seconds());
        if let Some(repository) = &self.repository {
            repository.replace(&fresh).await?;
        }
        *state = fresh;

        info!(actor_id = %actor_id, score, "Reputation reset");
        Ok(())
    }

    pub async fn snapshot(&self, actor_id: &str) -> Result<ReputationSnapshot> {
        let actor = self.actor(actor_id).await?;
        let state = actor.lock().await;
        Ok(state.snapshot())
    }

    /// Replace an actor's state with `snapshot`. History starts empty.
    pub async fn restore(&self, snapshot: ReputationSnapshot) -> Result<()> {
        self.check_bounds(snapshot.score)?;

        let actor_id = snapshot.actor_id.clone();
        let actor = self.actor(&actor_id).await?;
        let mut state = actor.lock().await;
        let restored = ReputationState::from_snapshot(snapshot, Vec::new());
        if let Some(repository) = &self.repository {
            repository.replace(&restored).await?;
        }
        *state = restored;

        debug!(actor_id = %actor_id, "Reputation restored from snapshot");
        Ok(())
    }

    fn check_bounds(&self, score: f64) -> Result<()> {
        if !(self.config.min_score..=self.config.max_score).contains(&score) {
            return Err(PipelineError::validation(format!(
                "score {} outside [{}, {}]",
                score, self.config.min_score, self.config.max_score
            )));
        }
        Ok(())
    }
}

fn checkpoint(state: &ReputationState) -> (ReputationSnapshot, usize) {
    (state.snapshot(), state.history.len())
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StorageConfig;
    use crate::database::DatabasePool;
    use chrono::Duration;

    const ACTOR: &str = "did:worklog:robot";

    fn ledger() -> (Arc<ManualClock>, ReputationLedger) {
        // 2024-01-01T12:00:00Z
        let clock = Arc::new(ManualClock::at_unix(1_704_110_400));
        let ledger = ReputationLedger::new(ReputationConfig::default(), clock.clone()).unwrap();
        (clock, ledger)
    }

    #[tokio::test]
    async fn test_initial_score_and_grade() {
        let (_clock, ledger) = ledger();
        assert_eq!(ledger.score(ACTOR).await.unwrap(), 100.0);
        assert_eq!(ledger.grade(ACTOR).await.unwrap(), Grade::F);
        assert!((ledger.normalized_score(ACTOR).await.unwrap() - 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_penalty_ignores_streak() {
        let (clock, ledger) = ledger();
        for _ in 0..5 {
            ledger
                .record_event(ACTOR, ReputationEvent::UptimeBonus, None, 1.0, None)
                .await
                .unwrap();
            clock.advance(Duration::days(1));
        }
        assert_eq!(ledger.streak(ACTOR).await.unwrap(), 5);

        let before = ledger.score(ACTOR).await.unwrap();
        let record = ledger.apply_task_failed(ACTOR, "task-9", "timeout").await.unwrap();
        assert!((record.delta + 5.0).abs() < 1e-9);
        assert!((ledger.score(ACTOR).await.unwrap() - (before - 5.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_score_is_clamped_and_actual_delta_recorded() {
        let (_clock, ledger) = ledger();
        ledger.reset(ACTOR, Some(30.0)).await.unwrap();

        let record = ledger.apply_tamper_detected(ACTOR, "case opened").await.unwrap();
        assert_eq!(record.delta, -30.0);
        assert_eq!(ledger.score(ACTOR).await.unwrap(), 0.0);

        ledger.reset(ACTOR, Some(999.5)).await.unwrap();
        let record = ledger
            .record_event(ACTOR, ReputationEvent::FirstTask, None, 1.0, None)
            .await
            .unwrap();
        assert_eq!(record.delta, 0.5);
        assert_eq!(ledger.score(ACTOR).await.unwrap(), 1000.0);
    }

    #[tokio::test]
    async fn test_invalid_multiplier_is_rejected() {
        let (_clock, ledger) = ledger();
        for bad in [f64::NAN, f64::INFINITY, -1.0] {
            assert!(matches!(
                ledger
                    .record_event(ACTOR, ReputationEvent::TaskCompleted, None, bad, None)
                    .await,
                Err(PipelineError::Validation(_))
            ));
        }
        assert!(ledger.history(ACTOR, 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_streak_bonus_requires_seven_days() {
        let (clock, ledger) = ledger();
        for _ in 0..6 {
            ledger.apply_proof_verified(ACTOR, "tx").await.unwrap();
            clock.advance(Duration::days(1));
        }
        assert!(ledger.apply_streak_bonus(ACTOR).await.unwrap().is_none());

        ledger.apply_proof_verified(ACTOR, "tx").await.unwrap();
        assert_eq!(ledger.streak(ACTOR).await.unwrap(), 7);

        let before = ledger.score(ACTOR).await.unwrap();
        let record = ledger.apply_streak_bonus(ACTOR).await.unwrap().unwrap();
        // base 1.5 x min(7/7, 3) x tier 1.2
        assert!((record.delta - 1.5 * 1.0 * 1.2).abs() < 1e-9);
        assert!((ledger.score(ACTOR).await.unwrap() - before - record.delta).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_history_filter_and_order() {
        let (_clock, ledger) = ledger();
        ledger.apply_proof_verified(ACTOR, "tx-1").await.unwrap();
        ledger.apply_task_failed(ACTOR, "t-1", "dropped").await.unwrap();
        ledger.apply_proof_verified(ACTOR, "tx-2").await.unwrap();

        let all = ledger.history(ACTOR, 10, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].reference.as_deref(), Some("tx-2"));

        let verified = ledger
            .history(ACTOR, 1, Some(&[ReputationEvent::ProofVerified]))
            .await
            .unwrap();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].reference.as_deref(), Some("tx-2"));
    }

    #[tokio::test]
    async fn test_statistics_totals() {
        let (_clock, ledger) = ledger();
        ledger.apply_task_completed(ACTOR, "t-1", 0.5).await.unwrap();
        ledger.apply_task_failed(ACTOR, "t-2", "jammed").await.unwrap();

        let stats = ledger.statistics(ACTOR).await.unwrap();
        assert_eq!(stats.events.total, 2);
        assert_eq!(stats.events.positive, 1);
        assert_eq!(stats.events.negative, 1);
        assert!((stats.totals.net - (2.0 - 5.0)).abs() < 1e-9);
        assert_eq!(stats.streak.current, 1);
        assert_eq!(stats.grade, Grade::F);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let (_clock, ledger) = ledger();
        ledger.apply_task_completed(ACTOR, "t-1", 1.0).await.unwrap();
        let snapshot = ledger.snapshot(ACTOR).await.unwrap();

        let (_clock, other) = self::ledger();
        other.restore(snapshot.clone()).await.unwrap();
        assert_eq!(other.snapshot(ACTOR).await.unwrap(), snapshot);

        let mut bad = snapshot;
        bad.score = 5000.0;
        assert!(other.restore(bad).await.is_err());
    }

    #[test]
    fn test_unusable_config_is_rejected() {
        let clock = Arc::new(ManualClock::at_unix(0));
        let inverted = ReputationConfig {
            min_score: 10.0,
            max_score: 5.0,
            initial_score: 7.0,
            ..ReputationConfig::default()
        };
        assert!(matches!(
            ReputationLedger::new(inverted, clock.clone()),
            Err(PipelineError::Validation(_))
        ));

        let nan = ReputationConfig {
            min_score: f64::NAN,
            ..ReputationConfig::default()
        };
        assert!(ReputationLedger::new(nan, clock).is_err());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        let db = DatabasePool::open(&StorageConfig::in_memory()).await.unwrap();
        let (clock, ledger) = ledger();
        let ledger = ledger.with_repository(db.reputation().clone());

        ledger.apply_proof_verified(ACTOR, "tx-1").await.unwrap();
        let before = ledger.snapshot(ACTOR).await.unwrap();
        db.close().await;

        let result = ledger
            .record_event(ACTOR, ReputationEvent::TamperDetected, None, 1.0, None)
            .await;
        assert!(matches!(result, Err(PipelineError::Persistence(_))));
        assert_eq!(ledger.snapshot(ACTOR).await.unwrap(), before);
        assert_eq!(ledger.history(ACTOR, 10, None).await.unwrap().len(), 1);

        // Decay that cannot be written is not kept either
        clock.advance(Duration::hours(5));
        assert!(ledger.score(ACTOR).await.is_err());
        assert_eq!(ledger.snapshot(ACTOR).await.unwrap(), before);
    }
}
