//! Scalar store: one value per String-kind key.

use crate::error::{KvError, Result};
use crate::kind::KeyKind;
use crate::tx::KvTx;
use crate::value::Value;

/// Scalar accessor bound to an open transaction and one key.
#[derive(Debug)]
pub struct StringHandle<'t> {
    tx: &'t mut KvTx,
    key: String,
}

impl<'t> StringHandle<'t> {
    pub(crate) fn new(tx: &'t mut KvTx, key: String) -> Self {
        Self { tx, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reads the value.
    ///
    /// # Errors
    ///
    /// `KvError::Absent` if the key is not registered, `KvError::KindMismatch`
    /// if it is registered as another kind.
    pub async fn get(&mut self) -> Result<Value> {
        self.tx.ensure_kind(&self.key, KeyKind::String).await?;

        let raw: Option<Vec<u8>> = sqlx::query_scalar("select value from kv_string where key = ?")
            .bind(&self.key)
            .fetch_optional(self.tx.as_mut_connection())
            .await?;

        // a registration without its row is treated as absent
        raw.map(Value::from).ok_or_else(|| KvError::absent(&self.key))
    }

    /// Stores `value`, registering the key as String on first write.
    pub async fn set(&mut self, value: impl Into<Value>) -> Result<()> {
        self.tx
            .ensure_or_register(&self.key, KeyKind::String)
            .await?;
        self.write(&value.into()).await
    }

    /// Adds `amount` to the integer value and returns the new total.
    ///
    /// An absent key counts as 0, so the first call stores `amount` itself.
    ///
    /// # Errors
    ///
    /// `KvError::Decode` if the stored value is not a decimal integer,
    /// `KvError::Overflow` if the sum leaves the i64 range.
    pub async fn incr(&mut self, amount: i64) -> Result<i64> {
        let current = match self.get().await {
            Ok(value) => value.as_i64()?,
            Err(err) if err.is_absent() => {
                self.set(Value::int(amount)).await?;
                return Ok(amount);
            }
            Err(err) => return Err(err),
        };

        let next = current
            .checked_add(amount)
            .ok_or(KvError::Overflow { current, amount })?;
        self.write(&Value::int(next)).await?;
        Ok(next)
    }

    /// Returns true if the key holds a value.
    pub async fn exists(&mut self) -> Result<bool> {
        match self.get().await {
            Ok(_) => Ok(true),
            Err(err) if err.is_absent() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn write(&mut self, value: &Value) -> Result<()> {
        sqlx::query("insert or replace into kv_string (key, value) values (?, ?)")
            .bind(&self.key)
            .bind(value.as_bytes())
            .execute(self.tx.as_mut_connection())
            .await?;
        Ok(())
    }

    /// Removes the value row. The caller removes the registration.
    pub(crate) async fn delete(&mut self) -> Result<u64> {
        let result = sqlx::query("delete from kv_string where key = ?")
            .bind(&self.key)
            .execute(self.tx.as_mut_connection())
            .await?;
        Ok(result.rows_affected())
    }
}
