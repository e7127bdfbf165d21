//! Hash store: field-value pairs per Hash-kind key.
//!
//! Read operations over the whole hash (`size`, `items`, `keys`) and the
//! deleting operations treat an unregistered key as an empty hash. Point
//! reads (`get`, `incr`) report `KvError::Absent` for both a missing key and
//! a missing field.

use std::collections::HashMap;

use crate::error::{KvError, Result};
use crate::kind::KeyKind;
use crate::tx::KvTx;
use crate::value::Value;

/// Hash accessor bound to an open transaction and one key.
#[derive(Debug)]
pub struct HashHandle<'t> {
    tx: &'t mut KvTx,
    key: String,
}

impl<'t> HashHandle<'t> {
    pub(crate) fn new(tx: &'t mut KvTx, key: String) -> Self {
        Self { tx, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reads one field.
    pub async fn get(&mut self, field: &str) -> Result<Value> {
        self.tx
            .ensure_kind(&self.key, KeyKind::Hash)
            .await
            .map_err(|err| match err {
                KvError::Absent { .. } => KvError::absent_field(&self.key, field),
                other => other,
            })?;

        let raw: Option<Vec<u8>> =
            sqlx::query_scalar("select value from kv_hash where key = ? and field = ?")
                .bind(&self.key)
                .bind(field)
                .fetch_optional(self.tx.as_mut_connection())
                .await?;

        raw.map(Value::from)
            .ok_or_else(|| KvError::absent_field(&self.key, field))
    }

    /// Stores one field, registering the key as Hash on first write.
    pub async fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        self.tx.ensure_or_register(&self.key, KeyKind::Hash).await?;
        self.write(field, &value.into()).await
    }

    /// Stores every pair. An empty input does nothing, not even registering
    /// the key.
    ///
    /// Pairs are written one by one; wrap the call in a scope for
    /// all-or-nothing behavior.
    pub async fn set_all<I, F, V>(&mut self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<String>,
        V: Into<Value>,
    {
        let pairs: Vec<(String, Value)> = pairs
            .into_iter()
            .map(|(field, value)| (field.into(), value.into()))
            .collect();
        if pairs.is_empty() {
            return Ok(());
        }

        self.tx.ensure_or_register(&self.key, KeyKind::Hash).await?;
        for (field, value) in &pairs {
            self.write(field, value).await?;
        }
        Ok(())
    }

    /// Adds `amount` to an integer field and returns the new total.
    /// A missing field (or key) counts as 0.
    pub async fn incr(&mut self, field: &str, amount: i64) -> Result<i64> {
        let current = match self.get(field).await {
            Ok(value) => value.as_i64()?,
            Err(err) if err.is_absent() => {
                self.set(field, Value::int(amount)).await?;
                return Ok(amount);
            }
            Err(err) => return Err(err),
        };

        let next = current
            .checked_add(amount)
            .ok_or(KvError::Overflow { current, amount })?;
        self.write(field, &Value::int(next)).await?;
        Ok(next)
    }

    /// Returns true if the field holds a value.
    pub async fn exists(&mut self, field: &str) -> Result<bool> {
        match self.get(field).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_absent() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Number of fields; 0 for an unregistered key.
    pub async fn size(&mut self) -> Result<usize> {
        if !self.tx.is_registered_as(&self.key, KeyKind::Hash).await? {
            return Ok(0);
        }

        let count: i64 = sqlx::query_scalar("select count(field) from kv_hash where key = ?")
            .bind(&self.key)
            .fetch_one(self.tx.as_mut_connection())
            .await?;
        Ok(count as usize)
    }

    /// All field/value pairs; empty for an unregistered key.
    pub async fn items(&mut self) -> Result<HashMap<String, Value>> {
        if !self.tx.is_registered_as(&self.key, KeyKind::Hash).await? {
            return Ok(HashMap::new());
        }

        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("select field, value from kv_hash where key = ?")
                .bind(&self.key)
                .fetch_all(self.tx.as_mut_connection())
                .await?;

        Ok(rows
            .into_iter()
            .map(|(field, value)| (field, Value::from(value)))
            .collect())
    }

    /// All field names in ascending order; empty for an unregistered key.
    pub async fn keys(&mut self) -> Result<Vec<String>> {
        if !self.tx.is_registered_as(&self.key, KeyKind::Hash).await? {
            return Ok(Vec::new());
        }

        let fields: Vec<String> =
            sqlx::query_scalar("select field from kv_hash where key = ? order by field")
                .bind(&self.key)
                .fetch_all(self.tx.as_mut_connection())
                .await?;
        Ok(fields)
    }

    /// Deletes the listed fields and returns how many existed.
    /// An unregistered key deletes nothing.
    pub async fn del<I, F>(&mut self, fields: I) -> Result<u64>
    where
        I: IntoIterator<Item = F>,
        F: AsRef<str>,
    {
        let fields: Vec<F> = fields.into_iter().collect();
        if fields.is_empty() {
            return Ok(0);
        }
        if !self.tx.is_registered_as(&self.key, KeyKind::Hash).await? {
            return Ok(0);
        }

        let mut deleted = 0;
        for field in &fields {
            let field: &str = field.as_ref();
            let result = sqlx::query("delete from kv_hash where key = ? and field = ?")
                .bind(&self.key)
                .bind(field)
                .execute(self.tx.as_mut_connection())
                .await?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    /// Deletes every field but keeps the key registered as an empty Hash.
    pub async fn clear(&mut self) -> Result<u64> {
        if !self.tx.is_registered_as(&self.key, KeyKind::Hash).await? {
            return Ok(0);
        }
        self.remove_all().await
    }

    /// Deletes every field row without checking the kind. The caller removes
    /// the registration.
    pub(crate) async fn remove_all(&mut self) -> Result<u64> {
        let result = sqlx::query("delete from kv_hash where key = ?")
            .bind(&self.key)
            .execute(self.tx.as_mut_connection())
            .await?;
        Ok(result.rows_affected())
    }

    async fn write(&mut self, field: &str, value: &Value) -> Result<()> {
        sqlx::query("insert or replace into kv_hash (key, field, value) values (?, ?, ?)")
            .bind(&self.key)
            .bind(field)
            .bind(value.as_bytes())
            .execute(self.tx.as_mut_connection())
            .await?;
        Ok(())
    }
}
