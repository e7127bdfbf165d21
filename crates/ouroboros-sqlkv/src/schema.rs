//! Table bootstrap.
//!
//! Three relations back the key namespace:
//!
//! ```text
//! kv_index  (key PK, kind)            one row per registered key
//! kv_string (key PK, value)           kind = String
//! kv_hash   (key, field, value)       kind = Hash, PK (key, field)
//! ```

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::Result;

pub(crate) const CREATE_INDEX_TABLE: &str = "create table if not exists kv_index (
    key text primary key not null,
    kind integer not null
)";

pub(crate) const CREATE_STRING_TABLE: &str = "create table if not exists kv_string (
    key text primary key not null,
    value blob not null
)";

pub(crate) const CREATE_HASH_TABLE: &str = "create table if not exists kv_hash (
    key text not null,
    field text not null,
    value blob not null,
    primary key (key, field)
)";

/// Creates the KV tables if they are missing. Safe to call on every open.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for ddl in [CREATE_INDEX_TABLE, CREATE_STRING_TABLE, CREATE_HASH_TABLE] {
        sqlx::query(ddl).execute(pool).await?;
    }
    debug!("KV schema ready");
    Ok(())
}
