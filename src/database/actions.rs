//! Action Store - durable, append-only log of signed action records
//!
//! Single writer, many readers: every mutation takes the store write lock and
//! performs its whole read-modify-write (action row plus tag rows) inside one
//! SQLite transaction, so readers never see an action without its tags.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::actions::{
    record::signing_bytes, validate_tag, ActionKind, ActionRecord, NewAction, ProofStatus,
};
use crate::clock::Clock;
use crate::config::StorageConfig;
use crate::crypto::{canonical_json, derive_action_id, random_entropy, Signer};
use crate::database::reader::{read_action, read_seq, SELECT_ACTIONS};
use crate::error::{PipelineError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notification sent to subscribers after a write commits.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    ActionAppended {
        action_id: String,
        kind: ActionKind,
        timestamp: i64,
    },
    StatusChanged {
        action_id: String,
        from: ProofStatus,
        to: ProofStatus,
        tx_ref: Option<String>,
        proof_ref: Option<String>,
    },
    BatchAssigned {
        batch_ref: String,
        action_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStatistics {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_kind: BTreeMap<String, i64>,
    pub count_today: i64,
    pub distinct_batches: i64,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
}

impl StoreStatistics {
    fn status_count(&self, status: ProofStatus) -> i64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }

    pub fn pending(&self) -> i64 {
        self.status_count(ProofStatus::Pending)
    }

    pub fn verified(&self) -> i64 {
        self.status_count(ProofStatus::Verified)
    }

    pub fn failed(&self) -> i64 {
        self.status_count(ProofStatus::Failed)
    }
}

pub struct ActionStore {
    pool: SqlitePool,
    signer: Arc<dyn Signer>,
    clock: Arc<dyn Clock>,
    config: StorageConfig,
    write_lock: Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
}

impl ActionStore {
    /// The pool must already be migrated (see `DatabasePool::migrate`).
    pub fn new(
        pool: SqlitePool,
        signer: Arc<dyn Signer>,
        clock: Arc<dyn Clock>,
        config: StorageConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pool,
            signer,
            clock,
            config,
            write_lock: Mutex::new(()),
            events,
        }
    }

    pub fn actor_id(&self) -> &str {
        self.signer.identifier()
    }

    /// Receive events for every committed write. Slow receivers lose the
    /// oldest events rather than blocking writers.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    async fn write_guard(&self) -> Result<MutexGuard<'_, ()>> {
        tokio::time::timeout(self.config.lock_timeout(), self.write_lock.lock())
            .await
            .map_err(|_| {
                PipelineError::concurrency(format!(
                    "store write lock not acquired within {}ms",
                    self.config.lock_timeout_ms
                ))
            })
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is not an error
        let _ = self.events.send(event);
    }

    fn now_millis(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
    }

    /// Validate, derive the id, and sign. No I/O.
    fn prepare(&self, action: NewAction) -> Result<ActionRecord> {
        let encoded = canonical_json(&action.payload)?;
        if encoded.len() > self.config.max_payload_bytes {
            return Err(PipelineError::validation(format!(
                "payload is {} bytes, limit is {}",
                encoded.len(),
                self.config.max_payload_bytes
            )));
        }
        for tag in &action.tags {
            validate_tag(tag)?;
        }

        let actor_id = self.signer.identifier().to_string();
        let timestamp = action
            .timestamp
            .unwrap_or_else(|| self.clock.unix_seconds());
        let id = derive_action_id(&actor_id, action.kind.code(), timestamp, &random_entropy());
        let signature = self
            .signer
            .sign(&signing_bytes(&id, action.kind, &action.payload, timestamp)?);

        Ok(ActionRecord {
            id,
            actor_id,
            kind: action.kind,
            payload: action.payload,
            timestamp,
            signature: hex::encode(signature),
            status: ProofStatus::Pending,
            tx_ref: None,
            proof_ref: None,
            batch_ref: None,
            tags: action.tags,
            metadata: action.metadata,
            created_at: self.now_millis(),
        })
    }

    /// Append one action. The record and its tags commit together or not at all.
    pub async fn append(&self, action: NewAction) -> Result<ActionRecord> {
        let record = self.prepare(action)?;

        {
            let _guard = self.write_guard().await?;
            let mut tx = self.pool.begin().await?;
            insert_record(&mut tx, &record).await?;
            tx.commit().await?;
        }

        debug!(action_id = %record.id, kind = %record.kind, "Action appended");
        self.emit(StoreEvent::ActionAppended {
            action_id: record.id.clone(),
            kind: record.kind,
            timestamp: record.timestamp,
        });
        Ok(record)
    }

    /// Append many actions in a single transaction, all-or-nothing.
    pub async fn append_batch(&self, actions: Vec<NewAction>) -> Result<Vec<ActionRecord>> {
        let records = actions
            .into_iter()
            .map(|action| self.prepare(action))
            .collect::<Result<Vec<_>>>()?;

        {
            let _guard = self.write_guard().await?;
            let mut tx = self.pool.begin().await?;
            for record in &records {
                insert_record(&mut tx, record).await?;
            }
            tx.commit().await?;
        }

        info!(count = records.len(), "Action batch appended");
        for record in &records {
            self.emit(StoreEvent::ActionAppended {
                action_id: record.id.clone(),
                kind: record.kind,
                timestamp: record.timestamp,
            });
        }
        Ok(records)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ActionRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_record(&mut conn, id).await
    }

    /// Oldest-first actions still awaiting proof generation.
    pub async fn query_pending(&self, limit: u32) -> Result<Vec<ActionRecord>> {
        let sql = format!(
            "{} WHERE a.proof_status = ? ORDER BY a.timestamp ASC, a.seq ASC LIMIT ?",
            SELECT_ACTIONS
        );
        let rows = sqlx::query(&sql)
            .bind(ProofStatus::Pending.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        read_rows(&rows)
    }

    /// Newest-first actions of one kind.
    pub async fn query_by_kind(
        &self,
        kind: ActionKind,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ActionRecord>> {
        let sql = format!(
            "{} WHERE a.kind = ? ORDER BY a.timestamp DESC, a.seq DESC LIMIT ? OFFSET ?",
            SELECT_ACTIONS
        );
        let rows = sqlx::query(&sql)
            .bind(kind.code())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        read_rows(&rows)
    }

    /// Newest-first actions carrying `tag`.
    pub async fn query_by_tag(&self, tag: &str, limit: u32) -> Result<Vec<ActionRecord>> {
        let sql = format!(
            "{} JOIN action_tags tt ON tt.action_id = a.id WHERE tt.tag = ? \
             ORDER BY a.timestamp DESC, a.seq DESC LIMIT ?",
            SELECT_ACTIONS
        );
        let rows = sqlx::query(&sql)
            .bind(tag)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        read_rows(&rows)
    }

    /// Oldest-first actions with `start <= timestamp <= end`, optionally restricted to `kinds`.
    pub async fn query_in_range(
        &self,
        start: i64,
        end: i64,
        kinds: Option<&[ActionKind]>,
    ) -> Result<Vec<ActionRecord>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_ACTIONS);
        query
            .push(" WHERE a.timestamp >= ")
            .push_bind(start)
            .push(" AND a.timestamp <= ")
            .push_bind(end);

        if let Some(kinds) = kinds {
            if kinds.is_empty() {
                return Ok(Vec::new());
            }
            query.push(" AND a.kind IN (");
            let mut separated = query.separated(", ");
            for kind in kinds {
                separated.push_bind(kind.code());
            }
            separated.push_unseparated(")");
        }

        query.push(" ORDER BY a.timestamp ASC, a.seq ASC");
        let rows = query.build().fetch_all(&self.pool).await?;
        read_rows(&rows)
    }

    pub async fn query_recent(&self, limit: u32) -> Result<Vec<ActionRecord>> {
        let sql = format!(
            "{} ORDER BY a.timestamp DESC, a.seq DESC LIMIT ?",
            SELECT_ACTIONS
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        read_rows(&rows)
    }

    /// Every record in `(timestamp, insertion)` order, one page in memory at a time.
    pub fn scan(
        &self,
        page_size: Option<u32>,
    ) -> impl Stream<Item = Result<ActionRecord>> + Send + '_ {
        let page_size = page_size.unwrap_or(self.config.scan_page_size).max(1);
        let sql = format!(
            "{} WHERE a.timestamp > ?1 OR (a.timestamp = ?1 AND a.seq > ?2) \
             ORDER BY a.timestamp ASC, a.seq ASC LIMIT ?3",
            SELECT_ACTIONS
        );

        stream::try_unfold(Some((i64::MIN, i64::MIN)), move |cursor| {
            self.scan_page(sql.clone(), cursor, page_size)
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
    }

    /// One keyset page after `cursor`, plus the cursor for the next page
    /// (`None` once a short page shows the log is exhausted).
    async fn scan_page(
        &self,
        sql: String,
        cursor: Option<(i64, i64)>,
        page_size: u32,
    ) -> Result<Option<(Vec<ActionRecord>, Option<(i64, i64)>)>> {
        let Some((timestamp, seq)) = cursor else {
            return Ok(None);
        };
        let rows = sqlx::query(&sql)
            .bind(timestamp)
            .bind(seq)
            .bind(page_size)
            .fetch_all(&self.pool)
            .await?;

        let Some(last) = rows.last() else {
            return Ok(None);
        };
        let next = if rows.len() < page_size as usize {
            None
        } else {
            Some((last.try_get("timestamp")?, read_seq(last)?))
        };
        Ok(Some((read_rows(&rows)?, next)))
    }

    /// Move `id` to `status` along a legal edge. `None` refs keep whatever is stored.
    pub async fn update_status(
        &self,
        id: &str,
        status: ProofStatus,
        tx_ref: Option<&str>,
        proof_ref: Option<&str>,
    ) -> Result<ActionRecord> {
        let (previous, updated) = {
            let _guard = self.write_guard().await?;
            let mut tx = self.pool.begin().await?;

            let current = fetch_record(&mut tx, id)
                .await?
                .ok_or_else(|| PipelineError::validation(format!("unknown action {}", id)))?;
            if !current.status.can_transition_to(status) {
                return Err(PipelineError::validation(format!(
                    "illegal status transition {} -> {} for {}",
                    current.status, status, id
                )));
            }

            sqlx::query(
                r#"
                UPDATE actions
                SET proof_status = ?, tx_ref = COALESCE(?, tx_ref), proof_ref = COALESCE(?, proof_ref)
                WHERE id = ?
                "#,
            )
            .bind(status.as_str())
            .bind(tx_ref)
            .bind(proof_ref)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            let updated = fetch_record(&mut tx, id)
                .await?
                .ok_or_else(|| PipelineError::validation(format!("unknown action {}", id)))?;
            tx.commit().await?;
            (current.status, updated)
        };

        info!(
            action_id = %id,
            from = %previous,
            to = %status,
            "Proof status changed"
        );
        self.emit(StoreEvent::StatusChanged {
            action_id: id.to_string(),
            from: previous,
            to: status,
            tx_ref: updated.tx_ref.clone(),
            proof_ref: updated.proof_ref.clone(),
        });
        Ok(updated)
    }

    /// Attach every action in `ids` to `batch_ref`. A record already in a
    /// different batch rejects the whole call.
    pub async fn assign_batch(&self, ids: &[String], batch_ref: &str) -> Result<()> {
        if batch_ref.is_empty() {
            return Err(PipelineError::validation("batch reference must not be empty"));
        }

        {
            let _guard = self.write_guard().await?;
            let mut tx = self.pool.begin().await?;

            for id in ids {
                let record = fetch_record(&mut tx, id)
                    .await?
                    .ok_or_else(|| PipelineError::validation(format!("unknown action {}", id)))?;
                match record.batch_ref.as_deref() {
                    Some(existing) if existing != batch_ref => {
                        return Err(PipelineError::validation(format!(
                            "action {} already belongs to batch {}",
                            id, existing
                        )));
                    }
                    _ => {}
                }

                sqlx::query("UPDATE actions SET batch_ref = ? WHERE id = ?")
                    .bind(batch_ref)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
        }

        debug!(batch_ref, count = ids.len(), "Batch assigned");
        self.emit(StoreEvent::BatchAssigned {
            batch_ref: batch_ref.to_string(),
            action_ids: ids.to_vec(),
        });
        Ok(())
    }

    /// Returns whether the tag was newly added.
    pub async fn add_tag(&self, id: &str, tag: &str) -> Result<bool> {
        validate_tag(tag)?;
        let _guard = self.write_guard().await?;
        let mut tx = self.pool.begin().await?;

        ensure_exists(&mut tx, id).await?;
        let result = sqlx::query("INSERT OR IGNORE INTO action_tags (action_id, tag) VALUES (?, ?)")
            .bind(id)
            .bind(tag)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns whether the tag was present.
    pub async fn remove_tag(&self, id: &str, tag: &str) -> Result<bool> {
        let _guard = self.write_guard().await?;
        let mut tx = self.pool.begin().await?;

        ensure_exists(&mut tx, id).await?;
        let result = sqlx::query("DELETE FROM action_tags WHERE action_id = ? AND tag = ?")
            .bind(id)
            .bind(tag)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn statistics(&self) -> Result<StoreStatistics> {
        let mut conn = self.pool.acquire().await?;
        let mut stats = StoreStatistics::default();

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total, MIN(timestamp) AS first_ts, MAX(timestamp) AS last_ts,
                   COUNT(DISTINCT batch_ref) AS batches
            FROM actions
            "#,
        )
        .fetch_one(&mut *conn)
        .await?;
        stats.total = row.try_get("total")?;
        stats.first_timestamp = row.try_get("first_ts")?;
        stats.last_timestamp = row.try_get("last_ts")?;
        stats.distinct_batches = row.try_get("batches")?;

        let rows = sqlx::query("SELECT proof_status, COUNT(*) AS n FROM actions GROUP BY proof_status")
            .fetch_all(&mut *conn)
            .await?;
        for row in &rows {
            stats
                .by_status
                .insert(row.try_get("proof_status")?, row.try_get("n")?);
        }

        let rows = sqlx::query("SELECT kind, COUNT(*) AS n FROM actions GROUP BY kind")
            .fetch_all(&mut *conn)
            .await?;
        for row in &rows {
            stats.by_kind.insert(row.try_get("kind")?, row.try_get("n")?);
        }

        let today_start = self
            .clock
            .now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc().timestamp())
            .unwrap_or_default();
        let row = sqlx::query("SELECT COUNT(*) AS n FROM actions WHERE timestamp >= ?")
            .bind(today_start)
            .fetch_one(&mut *conn)
            .await?;
        stats.count_today = row.try_get("n")?;

        Ok(stats)
    }

    /// Rebuild the database file. Takes the write lock for the duration.
    pub async fn vacuum(&self) -> Result<()> {
        let _guard = self.write_guard().await?;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        info!("Action store vacuumed");
        Ok(())
    }

    /// Wait for in-flight writes, then close the pool. Later calls fail with a persistence error.
    pub async fn close(&self) {
        match self.write_guard().await {
            Ok(_guard) => self.pool.close().await,
            Err(e) => {
                warn!("Closing action store without write lock: {}", e);
                self.pool.close().await;
            }
        }
        info!("Action store closed");
    }
}

async fn insert_record(conn: &mut SqliteConnection, record: &ActionRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO actions
            (id, actor_id, kind, payload, timestamp, signature, proof_status, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.actor_id)
    .bind(record.kind.code())
    .bind(serde_json::to_string(&record.payload)?)
    .bind(record.timestamp)
    .bind(&record.signature)
    .bind(record.status.as_str())
    .bind(serde_json::to_string(&record.metadata)?)
    .bind(record.created_at.timestamp_millis())
    .execute(&mut *conn)
    .await?;

    insert_tags(conn, &record.id, &record.tags).await
}

async fn insert_tags(conn: &mut SqliteConnection, id: &str, tags: &BTreeSet<String>) -> Result<()> {
    for tag in tags {
        sqlx::query("INSERT OR IGNORE INTO action_tags (action_id, tag) VALUES (?, ?)")
            .bind(id)
            .bind(tag)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn fetch_record(conn: &mut SqliteConnection, id: &str) -> Result<Option<ActionRecord>> {
    let sql = format!("{} WHERE a.id = ?", SELECT_ACTIONS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(read_action).transpose()
}

async fn ensure_exists(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    let found = sqlx::query("SELECT 1 FROM actions WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    match found {
        Some(_) => Ok(()),
        None => Err(PipelineError::validation(format!("unknown action {}", id))),
    }
}

fn read_rows(rows: &[SqliteRow]) -> Result<Vec<ActionRecord>> {
    rows.iter().map(read_action).collect()
}
