//! Kind registry: the single source of truth for a key's type.
//!
//! Every accessor asks the registry first. A key is registered in the same
//! transaction as its first type-specific row and its kind never changes
//! afterwards.

use tracing::debug;

use crate::error::{KvError, Result};
use crate::kind::KeyKind;
use crate::tx::KvTx;

impl KvTx {
    /// Returns the registered kind of `key`, or `KvError::Absent` if the key
    /// has never been written (or was deleted).
    pub async fn kind_of(&mut self, key: &str) -> Result<KeyKind> {
        let code: Option<i64> = sqlx::query_scalar("select kind from kv_index where key = ?")
            .bind(key)
            .fetch_optional(self.as_mut_connection())
            .await?;

        let code = code.ok_or_else(|| KvError::absent(key))?;
        KeyKind::from_code(code).ok_or_else(|| KvError::UnknownKind {
            key: key.to_string(),
            code,
        })
    }

    /// Returns true if `key` is registered with any kind.
    pub async fn exists(&mut self, key: &str) -> Result<bool> {
        match self.kind_of(key).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_absent() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Succeeds only if `key` is registered as `expected`.
    ///
    /// Absent keys report `KvError::Absent`; keys of another kind report
    /// `KvError::KindMismatch` with both kinds.
    pub async fn ensure_kind(&mut self, key: &str, expected: KeyKind) -> Result<()> {
        let actual = self.kind_of(key).await?;
        if actual != expected {
            return Err(KvError::KindMismatch {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Inserts a new `kv_index` row. Fails with a constraint error if the key
    /// is already registered; call only after `ensure_kind` reported absence.
    pub(crate) async fn register_kind(&mut self, key: &str, kind: KeyKind) -> Result<()> {
        sqlx::query("insert into kv_index (key, kind) values (?, ?)")
            .bind(key)
            .bind(kind.code())
            .execute(self.as_mut_connection())
            .await?;
        debug!(key = key, kind = %kind, "Registered key");
        Ok(())
    }

    /// Write-path check: registers `key` as `kind` on first write, fails on a
    /// kind mismatch, otherwise does nothing.
    pub(crate) async fn ensure_or_register(&mut self, key: &str, kind: KeyKind) -> Result<()> {
        match self.ensure_kind(key, kind).await {
            Err(err) if err.is_absent() => self.register_kind(key, kind).await,
            other => other,
        }
    }

    /// Like `ensure_kind`, but an absent key is `Ok(false)` instead of an error.
    pub(crate) async fn is_registered_as(&mut self, key: &str, kind: KeyKind) -> Result<bool> {
        match self.ensure_kind(key, kind).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_absent() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Deletes the `kv_index` row. Last step of a whole-key delete.
    pub(crate) async fn unregister(&mut self, key: &str) -> Result<u64> {
        let result = sqlx::query("delete from kv_index where key = ?")
            .bind(key)
            .execute(self.as_mut_connection())
            .await?;
        Ok(result.rows_affected())
    }
}
