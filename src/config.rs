use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Configuration for the verified action pipeline.
///
/// Every component receives its own section at construction; nothing reads
/// configuration from global state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Action store configuration
    pub storage: StorageConfig,
    /// Proof engine configuration
    pub proof: ProofConfig,
    /// Reputation ledger configuration
    pub reputation: ReputationConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    pub database_path: PathBuf,
    /// Use a private in-memory database instead of `database_path`
    pub in_memory: bool,
    /// Connection pool size (forced to 1 for in-memory databases)
    pub max_connections: u32,
    /// How long a writer waits for the store write lock
    pub lock_timeout_ms: u64,
    /// Upper bound on the canonical payload encoding
    pub max_payload_bytes: usize,
    /// Records per page for full scans
    pub scan_page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofConfig {
    /// Size of the proving worker pool
    pub workers: usize,
    /// Largest accepted batch proof
    pub max_batch_size: usize,
    /// Drain timeout for the worker pool on shutdown
    pub shutdown_timeout_secs: u64,
    /// Optional verification key file, the built-in key is used when unset
    pub verification_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationConfig {
    /// Score assigned to an actor on first sight
    pub initial_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    /// Fractional decay applied per elapsed hour
    pub decay_rate_per_hour: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Emit span open/close events
    pub log_spans: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/actions.db"),
            in_memory: false,
            max_connections: 8,
            lock_timeout_ms: 30_000,
            max_payload_bytes: 1024 * 1024, // 1MB
            scan_page_size: 1000,
        }
    }
}

impl StorageConfig {
    /// Private in-memory database, mostly for tests.
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            ..Self::default()
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: path.into(),
            ..Self::default()
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_batch_size: 100,
            shutdown_timeout_secs: 30,
            verification_key_path: None,
        }
    }
}

impl ProofConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            initial_score: 100.0,
            min_score: 0.0,
            max_score: 1000.0,
            decay_rate_per_hour: 0.001,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_spans: false,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `WORKLOG_*` environment variables over the defaults, then validate
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        // Storage configuration
        if let Ok(path) = env::var("WORKLOG_DATABASE_PATH") {
            config.storage.database_path = PathBuf::from(path);
        }

        if let Ok(in_memory) = env::var("WORKLOG_DATABASE_IN_MEMORY") {
            config.storage.in_memory = in_memory
                .parse()
                .context("Invalid WORKLOG_DATABASE_IN_MEMORY value")?;
        }

        if let Ok(max) = env::var("WORKLOG_DB_MAX_CONNECTIONS") {
            config.storage.max_connections =
                max.parse().context("Invalid WORKLOG_DB_MAX_CONNECTIONS value")?;
        }

        if let Ok(timeout) = env::var("WORKLOG_LOCK_TIMEOUT_MS") {
            config.storage.lock_timeout_ms = timeout
                .parse()
                .context("Invalid WORKLOG_LOCK_TIMEOUT_MS value")?;
        }

        if let Ok(bytes) = env::var("WORKLOG_MAX_PAYLOAD_BYTES") {
            config.storage.max_payload_bytes = bytes
                .parse()
                .context("Invalid WORKLOG_MAX_PAYLOAD_BYTES value")?;
        }

        if let Ok(size) = env::var("WORKLOG_SCAN_PAGE_SIZE") {
            config.storage.scan_page_size =
                size.parse().context("Invalid WORKLOG_SCAN_PAGE_SIZE value")?;
        }

        // Proof configuration
        if let Ok(workers) = env::var("WORKLOG_PROOF_WORKERS") {
            config.proof.workers = workers
                .parse()
                .context("Invalid WORKLOG_PROOF_WORKERS value")?;
        }

        if let Ok(size) = env::var("WORKLOG_MAX_BATCH_SIZE") {
            config.proof.max_batch_size =
                size.parse().context("Invalid WORKLOG_MAX_BATCH_SIZE value")?;
        }

        if let Ok(secs) = env::var("WORKLOG_SHUTDOWN_TIMEOUT_SECS") {
            config.proof.shutdown_timeout_secs = secs
                .parse()
                .context("Invalid WORKLOG_SHUTDOWN_TIMEOUT_SECS value")?;
        }

        if let Ok(path) = env::var("WORKLOG_VERIFICATION_KEY_PATH") {
            config.proof.verification_key_path = Some(PathBuf::from(path));
        }

        // Reputation configuration
        if let Ok(score) = env::var("WORKLOG_REPUTATION_INITIAL") {
            config.reputation.initial_score = score
                .parse()
                .context("Invalid WORKLOG_REPUTATION_INITIAL value")?;
        }

        if let Ok(score) = env::var("WORKLOG_REPUTATION_MIN") {
            config.reputation.min_score =
                score.parse().context("Invalid WORKLOG_REPUTATION_MIN value")?;
        }

        if let Ok(score) = env::var("WORKLOG_REPUTATION_MAX") {
            config.reputation.max_score =
                score.parse().context("Invalid WORKLOG_REPUTATION_MAX value")?;
        }

        if let Ok(rate) = env::var("WORKLOG_REPUTATION_DECAY_RATE") {
            config.reputation.decay_rate_per_hour = rate
                .parse()
                .context("Invalid WORKLOG_REPUTATION_DECAY_RATE value")?;
        }

        // Logging configuration
        if let Ok(level) = env::var("WORKLOG_LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Ok(spans) = env::var("WORKLOG_LOG_SPANS") {
            config.logging.log_spans = spans.parse().context("Invalid WORKLOG_LOG_SPANS value")?;
        }

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if !self.storage.in_memory && self.storage.database_path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("Database path cannot be empty"));
        }

        if self.storage.max_connections == 0 {
            return Err(anyhow::anyhow!("Database pool size must be non-zero"));
        }

        if self.storage.max_payload_bytes == 0 {
            return Err(anyhow::anyhow!("Maximum payload size must be non-zero"));
        }

        if self.storage.scan_page_size == 0 {
            return Err(anyhow::anyhow!("Scan page size must be non-zero"));
        }

        if self.proof.workers == 0 {
            return Err(anyhow::anyhow!("Proof worker count must be non-zero"));
        }

        if self.proof.max_batch_size == 0 {
            return Err(anyhow::anyhow!("Maximum batch size must be non-zero"));
        }

        self.reputation.validate()?;

        Ok(())
    }
}

impl ReputationConfig {
    /// Check that the score bounds are ordered and finite and the decay rate is in range
    pub fn validate(&self) -> Result<()> {
        if !self.min_score.is_finite() || !self.max_score.is_finite() {
            return Err(anyhow::anyhow!(
                "Reputation bounds must be finite, got [{}, {}]",
                self.min_score,
                self.max_score
            ));
        }

        if self.min_score >= self.max_score {
            return Err(anyhow::anyhow!(
                "Reputation minimum ({}) must be below maximum ({})",
                self.min_score,
                self.max_score
            ));
        }

        if !(self.min_score..=self.max_score).contains(&self.initial_score) {
            return Err(anyhow::anyhow!(
                "Initial reputation {} is outside [{}, {}]",
                self.initial_score,
                self.min_score,
                self.max_score
            ));
        }

        if !(0.0..1.0).contains(&self.decay_rate_per_hour) {
            return Err(anyhow::anyhow!(
                "Reputation decay rate must be in [0, 1), got {}",
                self.decay_rate_per_hour
            ));
        }

        Ok(())
    }
}

/// Install the global `tracing` subscriber described by `config`.
///
/// Fails if a global subscriber has already been set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter(config))
        .with_span_events(if config.log_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    Ok(())
}

/// `RUST_LOG` wins when set; otherwise the configured level, defaulting to info.
fn log_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match config.level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        };
        EnvFilter::new(level)
    })
}
