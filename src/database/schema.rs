//! Versioned, additive schema migrations
//!
//! Each version only creates tables, adds columns or adds indexes; nothing is
//! ever dropped or reordered. Every step is idempotent so a partially applied
//! version can be re-run safely.

use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 4;

/// Bring the schema on `conn` up to [`SCHEMA_VERSION`]. Returns the version
/// found before migrating. The caller holds the startup lock.
pub async fn migrate(conn: &mut SqliteConnection) -> Result<i64> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER))
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    let current = current_version(conn).await?;
    if current >= SCHEMA_VERSION {
        debug!(version = current, "Schema up to date");
        return Ok(current);
    }

    for version in (current + 1)..=SCHEMA_VERSION {
        match version {
            1 => create_actions(conn).await?,
            2 => add_proof_references(conn).await?,
            3 => add_tags_and_metadata(conn).await?,
            4 => create_reputation(conn).await?,
            _ => {}
        }

        sqlx::query("INSERT OR REPLACE INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut *conn)
            .await?;
        debug!(version, "Applied schema migration");
    }

    info!(from = current, to = SCHEMA_VERSION, "Schema migrated");
    Ok(current)
}

pub async fn current_version(conn: &mut SqliteConnection) -> Result<i64> {
    let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS version FROM schema_version")
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.try_get("version")?)
}

async fn create_actions(conn: &mut SqliteConnection) -> Result<()> {
    // `seq` is the insertion sequence; it survives VACUUM, unlike an implicit rowid.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS actions (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            actor_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            signature TEXT NOT NULL,
            proof_status TEXT NOT NULL DEFAULT 'pending',
            tx_ref TEXT,
            created_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER) * 1000)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_actions_timestamp ON actions(timestamp, seq)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_actions_proof_status ON actions(proof_status)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_actions_kind ON actions(kind)")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn add_proof_references(conn: &mut SqliteConnection) -> Result<()> {
    add_column_if_missing(conn, "actions", "proof_ref", "TEXT").await?;
    add_column_if_missing(conn, "actions", "batch_ref", "TEXT").await?;
    Ok(())
}

async fn add_tags_and_metadata(conn: &mut SqliteConnection) -> Result<()> {
    add_column_if_missing(conn, "actions", "metadata", "TEXT NOT NULL DEFAULT '{}'").await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_actions_batch ON actions(batch_ref) WHERE batch_ref IS NOT NULL",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS action_tags (
            action_id TEXT NOT NULL REFERENCES actions(id),
            tag TEXT NOT NULL,
            PRIMARY KEY (action_id, tag)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_action_tags_tag ON action_tags(tag)")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn create_reputation(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reputation_states (
            actor_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            score REAL NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reputation_events (
            id TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            event TEXT NOT NULL,
            delta REAL NOT NULL,
            timestamp INTEGER NOT NULL,
            reason TEXT NOT NULL DEFAULT '',
            reference TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (actor_id, id)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_reputation_events_actor ON reputation_events(actor_id, timestamp)",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// `ALTER TABLE .. ADD COLUMN` only when the column is not already present.
async fn add_column_if_missing(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    declaration: &str,
) -> Result<bool> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM pragma_table_info(?) WHERE name = ?")
        .bind(table)
        .bind(column)
        .fetch_one(&mut *conn)
        .await?;
    let existing: i64 = row.try_get("n")?;
    if existing > 0 {
        return Ok(false);
    }

    let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, declaration);
    sqlx::query(&sql).execute(&mut *conn).await?;
    debug!(table, column, "Added column");
    Ok(true)
}

/// Column names of `table`, in declaration order.
pub async fn table_columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT name FROM pragma_table_info(?) ORDER BY cid")
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("name").map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Connection;

    async fn memory_conn() -> SqliteConnection {
        SqliteConnection::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_migrate_fresh_database() {
        let mut conn = memory_conn().await;
        let from = migrate(&mut conn).await.unwrap();
        assert_eq!(from, 0);
        assert_eq!(current_version(&mut conn).await.unwrap(), SCHEMA_VERSION);

        let columns = table_columns(&mut conn, "actions").await.unwrap();
        for expected in ["id", "proof_ref", "batch_ref", "metadata", "created_at"] {
            assert!(columns.iter().any(|c| c == expected), "missing {}", expected);
        }
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let mut conn = memory_conn().await;
        migrate(&mut conn).await.unwrap();
        let before = table_columns(&mut conn, "actions").await.unwrap();

        let from = migrate(&mut conn).await.unwrap();
        assert_eq!(from, SCHEMA_VERSION);
        assert_eq!(before, table_columns(&mut conn, "actions").await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_version_is_completed() {
        let mut conn = memory_conn().await;
        migrate(&mut conn).await.unwrap();

        // Pretend v2 never got recorded even though its columns exist
        sqlx::query("DELETE FROM schema_version WHERE version >= 2")
            .execute(&mut conn)
            .await
            .unwrap();

        migrate(&mut conn).await.unwrap();
        assert_eq!(current_version(&mut conn).await.unwrap(), SCHEMA_VERSION);
    }
}
