//! Database Connection Pool using sqlx

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::StorageConfig;
use crate::database::reputation::ReputationRepository;
use crate::database::schema;
use crate::error::Result;

pub struct DatabasePool {
    pool: SqlitePool,
    reputation: Arc<ReputationRepository>,
}

impl DatabasePool {
    /// Open (creating if needed) the database described by `config`.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let pool = if config.in_memory {
            // A private in-memory database lives exactly as long as its one connection.
            let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = config.database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
                }
            }

            let options = SqliteConnectOptions::new()
                .filename(&config.database_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(config.lock_timeout());
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .connect_with(options)
                .await?
        };

        if config.in_memory {
            info!("Connected to in-memory SQLite database");
        } else {
            info!(path = %config.database_path.display(), "Connected to SQLite database");
        }

        let reputation = Arc::new(ReputationRepository::new(pool.clone()));

        Ok(Self { pool, reputation })
    }

    /// Run pending schema migrations under an exclusive startup lock.
    ///
    /// `BEGIN IMMEDIATE` takes SQLite's reserved lock, so concurrent openers of
    /// the same file serialize here and only the first applies each version.
    pub async fn migrate(&self) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match schema::migrate(&mut *conn).await {
            Ok(previous) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(previous)
            }
            Err(e) => {
                error!("Schema migration failed: {}", e);
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    error!("Rollback after failed migration also failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    /// Connect and migrate in one step.
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let db = Self::connect(config).await?;
        db.migrate().await?;
        Ok(db)
    }

    pub async fn schema_version(&self) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        schema::current_version(&mut *conn).await
    }

    pub fn reputation(&self) -> &Arc<ReputationRepository> {
        &self.reputation
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}
