//! Transaction handle bound to one SQLite transaction.

use sqlx::{Sqlite, SqliteConnection};
use tracing::{debug, instrument, warn};

use crate::error::{KvError, Result};
use crate::hash::HashHandle;
use crate::kind::KeyKind;
use crate::string::StringHandle;

const DEL_SAVEPOINT: &str = "kv_del_key";

/// An open transaction over the KV tables.
///
/// All registry and store operations run on the single underlying
/// transaction, in the order they are awaited. Handles returned by
/// [`KvTx::string`] and [`KvTx::hash`] borrow the transaction mutably, so
/// only one operation is ever in flight.
///
/// Dropping a `KvTx` without committing rolls it back.
pub struct KvTx {
    raw: sqlx::Transaction<'static, Sqlite>,
}

impl std::fmt::Debug for KvTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvTx").finish_non_exhaustive()
    }
}

/// Outcome of a whole-key delete over several keys.
#[derive(Debug, Default)]
pub struct DelReport {
    /// Keys whose rows and registration were both removed.
    pub deleted: usize,
    /// One entry per key that could not be deleted.
    pub errors: Vec<KvError>,
}

impl DelReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl KvTx {
    pub(crate) fn new(raw: sqlx::Transaction<'static, Sqlite>) -> Self {
        Self { raw }
    }

    /// Returns the underlying connection for running custom SQL inside this transaction.
    pub fn as_mut_connection(&mut self) -> &mut SqliteConnection {
        &mut self.raw
    }

    /// Scalar accessor for `key`.
    pub fn string(&mut self, key: impl Into<String>) -> StringHandle<'_> {
        StringHandle::new(self, key.into())
    }

    /// Hash accessor for `key`.
    pub fn hash(&mut self, key: impl Into<String>) -> HashHandle<'_> {
        HashHandle::new(self, key.into())
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns `KvError::Commit` if the engine refuses the commit. The writes
    /// may or may not be durable in that case.
    pub async fn commit(self) -> Result<()> {
        self.raw.commit().await.map_err(KvError::Commit)?;
        debug!("Committed transaction");
        Ok(())
    }

    /// Rolls back the transaction.
    pub async fn rollback(self) -> Result<()> {
        self.raw.rollback().await?;
        debug!("Rolled back transaction");
        Ok(())
    }

    /// Gives the transaction up without waiting for its rollback.
    ///
    /// The rollback is queued on the connection and runs as soon as the
    /// statement currently executing there returns.
    pub(crate) fn abandon(self) {
        drop(self.raw);
        debug!("Abandoned transaction, rollback queued");
    }

    /// Commits on `Ok`, rolls back on `Err`. A failed rollback is reported
    /// together with the error that caused it.
    pub(crate) async fn finish<T>(self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(cause) => match self.raw.rollback().await {
                Ok(()) => {
                    debug!(error = %cause, "Rolled back transaction");
                    Err(cause)
                }
                Err(rollback) => {
                    warn!(error = %cause, rollback_error = %rollback, "Rollback failed");
                    Err(KvError::Rollback {
                        rollback,
                        cause: Box::new(cause),
                    })
                }
            },
        }
    }

    /// Deletes whole keys of any kind.
    ///
    /// Each key is handled independently: absent keys are skipped without an
    /// error, failures are collected and the remaining keys are still
    /// processed. A key that fails is left exactly as it was.
    #[instrument(skip_all)]
    pub async fn del<I, K>(&mut self, keys: I) -> DelReport
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut report = DelReport::default();

        for key in keys {
            let key: &str = key.as_ref();
            match self.del_one(key).await {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(key = key, error = %err, "Failed to delete key");
                    report.errors.push(err);
                }
            }
        }

        debug!(
            deleted = report.deleted,
            failed = report.errors.len(),
            "Deleted keys"
        );
        report
    }

    async fn del_one(&mut self, key: &str) -> Result<bool> {
        let kind = match self.kind_of(key).await {
            Ok(kind) => kind,
            Err(err) if err.is_absent() => return Ok(false),
            Err(err) => return Err(err),
        };

        self.savepoint(DEL_SAVEPOINT).await?;
        let removed = self.remove_key(key, kind).await;
        match removed {
            Ok(()) => {
                self.release_savepoint(DEL_SAVEPOINT).await?;
                Ok(true)
            }
            Err(cause) => {
                let restored = match self.rollback_to(DEL_SAVEPOINT).await {
                    Ok(()) => self.release_savepoint(DEL_SAVEPOINT).await,
                    Err(err) => Err(err),
                };
                match restored {
                    Ok(()) => Err(cause),
                    Err(KvError::Engine(rollback)) => Err(KvError::Rollback {
                        rollback,
                        cause: Box::new(cause),
                    }),
                    Err(other) => Err(other),
                }
            }
        }
    }

    async fn remove_key(&mut self, key: &str, kind: KeyKind) -> Result<()> {
        match kind {
            KeyKind::String => {
                self.string(key).delete().await?;
            }
            KeyKind::Hash => {
                self.hash(key).remove_all().await?;
            }
            KeyKind::Undefined => {
                return Err(KvError::UnknownKind {
                    key: key.to_string(),
                    code: kind.code(),
                });
            }
        }
        self.unregister(key).await?;
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        sqlx::query(&format!("savepoint {}", name))
            .execute(self.as_mut_connection())
            .await?;
        Ok(())
    }

    async fn rollback_to(&mut self, name: &str) -> Result<()> {
        sqlx::query(&format!("rollback to savepoint {}", name))
            .execute(self.as_mut_connection())
            .await?;
        debug!(savepoint = name, "Rolled back to savepoint");
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        sqlx::query(&format!("release savepoint {}", name))
            .execute(self.as_mut_connection())
            .await?;
        Ok(())
    }
}
