//! Store configuration.
//!
//! Defaults match the bootstrap every ouroboros SQLite store uses: WAL
//! journal, a 3 second busy timeout, and the database file created on first
//! open.

use serde::Deserialize;
use sqlx::sqlite::{SqliteJournalMode, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{KvError, Result};

/// Whole-scope retry policy for `KvStore::retry_scoped`.
///
/// A scope that fails on a busy or locked database is run again from the
/// start in a fresh transaction. Sleeps between runs start at
/// `initial_delay_ms`, grow by `backoff_multiplier` and never exceed
/// `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Re-runs allowed after the first attempt; 0 runs the scope once.
    pub max_retries: u32,
    /// Sleep before the first re-run, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on a single sleep, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between sleeps. Values below 1.0 count as 1.0.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 50,
            max_delay_ms: 2000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Runs each scope exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Sleep before re-run number `attempt + 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(63) as i32);
        let grown = self.initial_delay_ms as f64 * factor;
        Duration::from_millis(grown.min(self.max_delay_ms as f64) as u64)
    }

    /// The sleeps of every allowed re-run, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }
}

/// How a scope opens its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeginMode {
    /// `BEGIN`: locks are taken by the first read and the first write.
    Deferred,
    /// `BEGIN IMMEDIATE`: the write lock is taken up front, waiting up to the
    /// busy timeout for other writers.
    #[default]
    Immediate,
}

impl BeginMode {
    pub(crate) fn statement(self) -> &'static str {
        match self {
            BeginMode::Deferred => "begin deferred",
            BeginMode::Immediate => "begin immediate",
        }
    }
}

impl FromStr for BeginMode {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "deferred" => Ok(BeginMode::Deferred),
            "immediate" => Ok(BeginMode::Immediate),
            other => Err(KvError::Configuration(format!(
                "Unknown begin mode: '{}'",
                other
            ))),
        }
    }
}

/// SQLite journal mode, kept as our own enum so the config stays deserializable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    #[default]
    Wal,
    Off,
}

impl JournalMode {
    pub(crate) fn to_sqlite(self) -> SqliteJournalMode {
        match self {
            JournalMode::Delete => SqliteJournalMode::Delete,
            JournalMode::Truncate => SqliteJournalMode::Truncate,
            JournalMode::Persist => SqliteJournalMode::Persist,
            JournalMode::Memory => SqliteJournalMode::Memory,
            JournalMode::Wal => SqliteJournalMode::Wal,
            JournalMode::Off => SqliteJournalMode::Off,
        }
    }
}

impl FromStr for JournalMode {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "delete" => Ok(JournalMode::Delete),
            "truncate" => Ok(JournalMode::Truncate),
            "persist" => Ok(JournalMode::Persist),
            "memory" => Ok(JournalMode::Memory),
            "wal" => Ok(JournalMode::Wal),
            "off" => Ok(JournalMode::Off),
            other => Err(KvError::Configuration(format!(
                "Unknown journal mode: '{}'",
                other
            ))),
        }
    }
}

/// SQLite `synchronous` pragma.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    Off,
    #[default]
    Normal,
    Full,
    Extra,
}

impl Synchronous {
    pub(crate) fn to_sqlite(self) -> SqliteSynchronous {
        match self {
            Synchronous::Off => SqliteSynchronous::Off,
            Synchronous::Normal => SqliteSynchronous::Normal,
            Synchronous::Full => SqliteSynchronous::Full,
            Synchronous::Extra => SqliteSynchronous::Extra,
        }
    }
}

/// Connection pool and engine configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Minimum number of connections in the pool.
    pub min_connections: u32,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Pool acquire timeout in seconds.
    pub acquire_timeout: u64,
    /// How long a statement waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Transaction start used by every scope.
    pub begin_mode: BeginMode,
    pub journal_mode: JournalMode,
    pub synchronous: Synchronous,
    /// Create the database file if it does not exist.
    pub create_if_missing: bool,
    /// Number of prepared statements to cache per connection.
    pub statement_cache_capacity: usize,
    /// Retry policy used by `KvStore::retry_scoped_default`.
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 8,
            acquire_timeout: 30,
            busy_timeout_ms: 3000,
            begin_mode: BeginMode::Immediate,
            journal_mode: JournalMode::Wal,
            synchronous: Synchronous::Normal,
            create_if_missing: true,
            statement_cache_capacity: 100,
            retry: RetryConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create store configuration from environment variables.
    ///
    /// Reads `SQLKV_MAX_CONNECTIONS`, `SQLKV_BUSY_TIMEOUT_MS`,
    /// `SQLKV_BEGIN_MODE`, `SQLKV_JOURNAL_MODE` and `SQLKV_MAX_RETRIES`.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("SQLKV_MAX_CONNECTIONS") {
            config.max_connections = parse_var("SQLKV_MAX_CONNECTIONS", &raw)?;
        }
        if let Some(raw) = lookup("SQLKV_BUSY_TIMEOUT_MS") {
            config.busy_timeout_ms = parse_var("SQLKV_BUSY_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("SQLKV_BEGIN_MODE") {
            config.begin_mode = raw.parse()?;
        }
        if let Some(raw) = lookup("SQLKV_JOURNAL_MODE") {
            config.journal_mode = raw.parse()?;
        }
        if let Some(raw) = lookup("SQLKV_MAX_RETRIES") {
            config.retry.max_retries = parse_var("SQLKV_MAX_RETRIES", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks pool size constraints.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(KvError::Configuration(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(KvError::Configuration(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        KvError::Configuration(format!("Invalid value for {}: '{}'", name, raw))
    })
}
