//! Reputation Repository - durable backing for the reputation ledger
//!
//! Stores one snapshot row per actor plus an append-only event table. Writes
//! for one mutation (snapshot + event) share a transaction.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::reputation::{ReputationRecord, ReputationSnapshot, ReputationState};

pub struct ReputationRepository {
    pool: SqlitePool,
}

impl ReputationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load an actor's snapshot and full event history, oldest event first.
    pub async fn load(&self, actor_id: &str) -> Result<Option<ReputationState>> {
        let row = sqlx::query("SELECT state FROM reputation_states WHERE actor_id = ?")
            .bind(actor_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let snapshot: ReputationSnapshot = serde_json::from_str(row.try_get("state")?)?;

        let rows = sqlx::query(
            r#"
            SELECT id, event, delta, timestamp, reason, reference, metadata
            FROM reputation_events
            WHERE actor_id = ?
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        let mut history = Vec::with_capacity(rows.len());
        for row in &rows {
            let event: String = row.try_get("event")?;
            history.push(ReputationRecord {
                id: row.try_get("id")?,
                event: event.parse().map_err(|e: PipelineError| {
                    PipelineError::Persistence(sqlx::Error::Decode(e.to_string().into()))
                })?,
                delta: row.try_get("delta")?,
                timestamp: row.try_get("timestamp")?,
                reason: row.try_get("reason")?,
                reference: row.try_get("reference")?,
                metadata: serde_json::from_str(row.try_get("metadata")?)?,
            });
        }

        debug!(actor_id = %actor_id, events = history.len(), "Loaded reputation state");
        Ok(Some(ReputationState::from_snapshot(snapshot, history)))
    }

    /// Upsert the snapshot of `state` and, if given, append `record`.
    pub async fn persist(
        &self,
        state: &ReputationState,
        record: Option<&ReputationRecord>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_snapshot(&mut tx, &state.snapshot()).await?;

        if let Some(record) = record {
            sqlx::query(
                r#"
                INSERT INTO reputation_events
                    (id, actor_id, event, delta, timestamp, reason, reference, metadata)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(&state.actor_id)
            .bind(record.event.name())
            .bind(record.delta)
            .bind(record.timestamp)
            .bind(&record.reason)
            .bind(&record.reference)
            .bind(serde_json::to_string(&record.metadata)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Replace an actor's state wholesale, dropping its stored history.
    pub async fn replace(&self, state: &ReputationState) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM reputation_events WHERE actor_id = ?")
            .bind(&state.actor_id)
            .execute(&mut *tx)
            .await?;
        upsert_snapshot(&mut tx, &state.snapshot()).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn actor_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT actor_id FROM reputation_states ORDER BY actor_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("actor_id").map_err(Into::into))
            .collect()
    }
}

async fn upsert_snapshot(
    conn: &mut sqlx::SqliteConnection,
    snapshot: &ReputationSnapshot,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO reputation_states (actor_id, state, score, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(actor_id) DO UPDATE SET
            state = excluded.state,
            score = excluded.score,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&snapshot.actor_id)
    .bind(serde_json::to_string(snapshot)?)
    .bind(snapshot.score)
    .bind(Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::database::DatabasePool;
    use crate::reputation::ReputationEvent;
    use serde_json::Map;

    fn record(id: &str, event: ReputationEvent, delta: f64, ts: i64) -> ReputationRecord {
        ReputationRecord {
            id: id.to_string(),
            event,
            delta,
            timestamp: ts,
            reason: event.name().to_string(),
            reference: None,
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let db = DatabasePool::open(&StorageConfig::in_memory()).await.unwrap();
        let repo = db.reputation();
        assert!(repo.load("robot-1").await.unwrap().is_none());

        let mut state = ReputationState::new("robot-1", 100.0, 0);
        let first = record("rep_1_0", ReputationEvent::ProofVerified, 1.0, 1);
        state.score = 101.0;
        state.history.push(first.clone());
        repo.persist(&state, Some(&first)).await.unwrap();

        let second = record("rep_2_1", ReputationEvent::TaskFailed, -5.0, 2);
        state.score = 96.0;
        state.history.push(second.clone());
        repo.persist(&state, Some(&second)).await.unwrap();

        let loaded = repo.load("robot-1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(repo.actor_ids().await.unwrap(), vec!["robot-1".to_string()]);
    }

    #[tokio::test]
    async fn test_replace_drops_history() {
        let db = DatabasePool::open(&StorageConfig::in_memory()).await.unwrap();
        let repo = db.reputation();

        let mut state = ReputationState::new("robot-2", 100.0, 0);
        let event = record("rep_1_0", ReputationEvent::TaskCompleted, 2.0, 1);
        state.history.push(event.clone());
        repo.persist(&state, Some(&event)).await.unwrap();

        let fresh = ReputationState::new("robot-2", 250.0, 10);
        repo.replace(&fresh).await.unwrap();

        let loaded = repo.load("robot-2").await.unwrap().unwrap();
        assert_eq!(loaded.score, 250.0);
        assert!(loaded.history.is_empty());
    }
}
