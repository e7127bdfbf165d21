//! Store handle: SQLite pool plus transaction scopes.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Connection;
use tracing::{debug, info, instrument, warn};

use crate::config::{JournalMode, RetryConfig, StoreConfig};
use crate::error::Result;
use crate::schema::init_schema;
use crate::scope::{drive, ScopeOptions};
use crate::tx::KvTx;

/// Typed KV store over a SQLite connection pool.
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct KvStore {
    pool: SqlitePool,
    config: StoreConfig,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("size", &self.pool.size())
            .field("num_idle", &self.pool.num_idle())
            .finish()
    }
}

impl KvStore {
    /// Opens (and by default creates) the database file at `path` and
    /// bootstraps the KV tables.
    ///
    /// # Errors
    ///
    /// Returns `KvError::Configuration` for an invalid config and
    /// `KvError::Engine` if the file cannot be opened or the tables cannot
    /// be created.
    #[instrument(skip_all, fields(
        path = %path.as_ref().display(),
        max_connections = config.max_connections,
        journal_mode = ?config.journal_mode
    ))]
    pub async fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path.as_ref());
        Self::open_with_options(options, config).await
    }

    /// Opens a private in-memory database. Everything is lost when the
    /// store is dropped.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let config = StoreConfig {
            // every connection to :memory: is a separate database
            min_connections: 1,
            max_connections: 1,
            journal_mode: JournalMode::Memory,
            ..Default::default()
        };
        Self::open_with_options(options, config).await
    }

    /// Opens a pool from explicit connect options. `config` overrides the
    /// journal mode, busy timeout and the other engine settings it carries.
    pub async fn open_with_options(
        options: SqliteConnectOptions,
        config: StoreConfig,
    ) -> Result<Self> {
        config.validate()?;

        let options = options
            .create_if_missing(config.create_if_missing)
            .journal_mode(config.journal_mode.to_sqlite())
            .synchronous(config.synchronous.to_sqlite())
            .busy_timeout(config.busy_timeout())
            .statement_cache_capacity(config.statement_cache_capacity);

        let mut pool_options = SqlitePoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout))
            .after_release(|conn, _meta| {
                Box::pin(async move {
                    // the ping lands after any rollback queued by an abandoned scope
                    conn.ping().await?;
                    Ok(!conn.is_in_transaction())
                })
            });
        if config.min_connections > 0 {
            // keep pinned connections alive; an in-memory database dies with its last one
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        init_schema(&pool).await?;

        info!("KV store opened");
        Ok(Self { pool, config })
    }

    /// Wraps an existing pool, creating the KV tables if needed.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        init_schema(&pool).await?;
        Ok(Self {
            pool,
            config: StoreConfig::default(),
        })
    }

    /// Gets a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Pings the database to verify connectivity.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("select 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("KV store closed");
    }

    /// Begins a transaction for manual control. Prefer [`KvStore::run_scoped`],
    /// which always finishes the transaction.
    ///
    /// With the default [`BeginMode::Immediate`](crate::BeginMode::Immediate)
    /// this waits up to the busy timeout for other writers and then holds
    /// the write lock.
    pub async fn begin(&self) -> Result<KvTx> {
        let mode = self.config.begin_mode;
        let raw = self.pool.begin_with(mode.statement()).await?;
        debug!(mode = ?mode, "Started transaction");
        Ok(KvTx::new(raw))
    }

    /// Runs `work` inside one transaction.
    ///
    /// Commits if `work` returns `Ok` and rolls back otherwise. A panic in
    /// `work` is caught and reported as `KvError::Panicked`. If the rollback
    /// itself fails, the returned `KvError::Rollback` carries both errors.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let total = store.run_scoped(|tx| Box::pin(async move {
    ///     tx.hash("stats").set("name", "ouroboros").await?;
    ///     tx.hash("stats").incr("visits", 1).await
    /// })).await?;
    /// ```
    pub async fn run_scoped<T, F>(&self, work: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut KvTx) -> BoxFuture<'c, Result<T>>,
    {
        self.run_scoped_with(ScopeOptions::default(), work).await
    }

    /// [`KvStore::run_scoped`] with a deadline and/or cancellation token.
    ///
    /// The deadline covers the wait for the transaction as well as `work`.
    /// An interrupted scope returns immediately and its rollback is queued
    /// on the connection.
    #[instrument(skip_all, fields(
        deadline_ms = options.deadline.map(|d| d.as_millis() as u64),
        cancellable = options.cancel.is_some()
    ))]
    pub async fn run_scoped_with<T, F>(&self, options: ScopeOptions, work: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut KvTx) -> BoxFuture<'c, Result<T>>,
    {
        let watch = options.watch();
        let mut tx = drive(self.begin(), &watch).await?;

        let outcome = drive(async { work(&mut tx).await }, &watch).await;
        match outcome {
            Err(err) if err.is_interrupted() => {
                tx.abandon();
                Err(err)
            }
            outcome => tx.finish(outcome).await,
        }
    }

    /// Runs the scope again, in a fresh transaction, while it fails with a
    /// retryable error (busy or locked database).
    pub async fn retry_scoped<T, F>(&self, retry: &RetryConfig, work: F) -> Result<T>
    where
        F: for<'c> Fn(&'c mut KvTx) -> BoxFuture<'c, Result<T>>,
    {
        let mut delays = retry.delays();
        let mut retries = 0u32;
        loop {
            let err = match self.run_scoped(&work).await {
                Ok(value) => {
                    if retries > 0 {
                        info!(retries = retries, "Scope succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            let Some(delay) = delays.next() else {
                warn!(retries = retries, error = %err, "Scope still busy, giving up");
                return Err(err);
            };
            retries += 1;
            warn!(
                retry = retries,
                max_retries = retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Scope failed on a busy database, retrying after delay"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// [`KvStore::retry_scoped`] with the store's configured retry policy.
    pub async fn retry_scoped_default<T, F>(&self, work: F) -> Result<T>
    where
        F: for<'c> Fn(&'c mut KvTx) -> BoxFuture<'c, Result<T>>,
    {
        let retry = self.config.retry.clone();
        self.retry_scoped(&retry, work).await
    }
}
