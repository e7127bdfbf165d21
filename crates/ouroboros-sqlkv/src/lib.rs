//! Typed, transactional key-value layer on top of SQLite.
//!
//! This crate gives ouroboros Redis-style primitives (scalar strings and
//! field-value hashes) while persisting them as plain relational rows, so
//! they can share a database file and a transaction with ordinary tables.
//!
//! # Architecture
//!
//! ```text
//!   KvStore::run_scoped(work)           one SQLite transaction per scope
//!           |
//!        KvTx ── kind registry (kv_index)
//!        /   \
//!  StringHandle  HashHandle             accessors bound to (tx, key)
//!   (kv_string)  (kv_hash)
//!           |
//!         SQLx (SQLite driver)
//! ```
//!
//! Every key has exactly one kind, recorded in `kv_index` the first time the
//! key is written. Accessors check the registered kind before touching their
//! table and fail with [`KvError::KindMismatch`] instead of coercing. A
//! missing key or field is reported as [`KvError::Absent`], which callers
//! can treat as an ordinary branch.
//!
//! # Usage Examples
//!
//! ```rust,ignore
//! use ouroboros_sqlkv::{KvError, KvStore, StoreConfig};
//!
//! # async fn example() -> Result<(), KvError> {
//! let store = KvStore::open("./kv.db", StoreConfig::default()).await?;
//!
//! store.run_scoped(|tx| Box::pin(async move {
//!     tx.string("greeting").set("hello").await?;
//!     tx.hash("user:1").set("name", "alice").await?;
//!     tx.hash("user:1").incr("logins", 1).await?;
//!     Ok::<_, KvError>(())
//! })).await?;
//!
//! let name = store.run_scoped(|tx| Box::pin(async move {
//!     tx.hash("user:1").get("name").await
//! })).await?;
//! assert_eq!(name.as_str()?, "alice");
//! # Ok(())
//! # }
//! ```
//!
//! # Transactions
//!
//! A scope commits when its work returns `Ok` and rolls back when it returns
//! `Err`, panics, is cancelled or runs past its deadline (see
//! [`ScopeOptions`]). Scopes open with `BEGIN IMMEDIATE` by default, so
//! writers queue for the write lock for up to the configured busy timeout.
//! A database that stays busy past it surfaces as a retryable engine error,
//! which [`KvStore::retry_scoped`] handles with exponential backoff.

pub mod config;
pub mod error;
pub mod hash;
pub mod kind;
mod registry;
pub mod schema;
pub mod scope;
pub mod store;
pub mod string;
pub mod tx;
pub mod value;

pub use config::{BeginMode, JournalMode, RetryConfig, StoreConfig, Synchronous};
pub use error::{KvError, Result};
pub use hash::HashHandle;
pub use kind::KeyKind;
pub use schema::init_schema;
pub use scope::ScopeOptions;
pub use store::KvStore;
pub use string::StringHandle;
pub use tx::{DelReport, KvTx};
pub use value::Value;

pub use tokio_util::sync::CancellationToken;
