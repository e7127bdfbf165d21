//! Error types for typed KV operations

use std::time::Duration;

use thiserror::Error;

use crate::kind::KeyKind;

/// Result type alias for ouroboros-sqlkv operations
pub type Result<T> = std::result::Result<T, KvError>;

// SQLite primary result codes (extended codes carry these in the low byte).
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CONSTRAINT: i32 = 19;

/// Errors produced by the typed KV layer.
///
/// `Absent` is an ordinary outcome (missing key or field), not a failure of
/// the engine; match on it with [`KvError::is_absent`].
#[derive(Error, Debug)]
pub enum KvError {
    /// Key or field has no data.
    #[error("{}", absent_message(.key, .field.as_deref()))]
    Absent { key: String, field: Option<String> },

    /// The key is registered with a different kind than the accessor expects.
    #[error("Bad key kind for {key:?}: expected {expected}, but it is a {actual}")]
    KindMismatch {
        key: String,
        expected: KeyKind,
        actual: KeyKind,
    },

    /// Stored bytes cannot be read as the requested type.
    #[error("Decode error: {reason}")]
    Decode { reason: String },

    /// Integer arithmetic left the i64 range.
    #[error("Integer overflow: {current} + {amount}")]
    Overflow { current: i64, amount: i64 },

    /// `kv_index` holds a kind code this crate cannot act on.
    #[error("Unknown key kind code {code} for {key:?}")]
    UnknownKind { key: String, code: i64 },

    /// Storage engine failure, passed through untouched.
    #[error("Engine error: {0}")]
    Engine(#[from] sqlx::Error),

    /// Commit failed; the writes may or may not be durable.
    #[error("Commit failed: {0}")]
    Commit(#[source] sqlx::Error),

    /// Rollback failed after `cause` aborted the scope.
    #[error("Rollback failed: {rollback}; original error: {cause}")]
    Rollback {
        #[source]
        rollback: sqlx::Error,
        cause: Box<KvError>,
    },

    /// The scope's cancellation token fired.
    #[error("Transaction scope cancelled")]
    Cancelled,

    /// The scope ran past its deadline.
    #[error("Transaction scope exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),

    /// Scope work panicked; the payload message is kept.
    #[error("Transaction scope recovered from panic: {0}")]
    Panicked(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

fn absent_message(key: &str, field: Option<&str>) -> String {
    match field {
        Some(field) => format!("Nil: {key:?} has no field {field:?}"),
        None => format!("Nil: {key:?} not found"),
    }
}

impl KvError {
    pub(crate) fn absent(key: &str) -> Self {
        KvError::Absent {
            key: key.to_string(),
            field: None,
        }
    }

    pub(crate) fn absent_field(key: &str, field: &str) -> Self {
        KvError::Absent {
            key: key.to_string(),
            field: Some(field.to_string()),
        }
    }

    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        KvError::Decode {
            reason: reason.into(),
        }
    }

    /// Returns true if the key or field simply does not exist
    pub fn is_absent(&self) -> bool {
        matches!(self, KvError::Absent { .. })
    }

    pub fn is_kind_mismatch(&self) -> bool {
        matches!(self, KvError::KindMismatch { .. })
    }

    /// Returns true if the scope was cancelled or ran out of time
    pub fn is_interrupted(&self) -> bool {
        matches!(self, KvError::Cancelled | KvError::DeadlineExceeded(_))
    }

    /// Returns true if re-running the whole scope may succeed
    /// (SQLite BUSY/LOCKED or an exhausted pool).
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Engine(err) | KvError::Commit(err) => is_busy(err),
            KvError::Rollback { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if the engine rejected a write on a constraint
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            KvError::Engine(err) | KvError::Commit(err) => {
                primary_code(err) == Some(SQLITE_CONSTRAINT)
            }
            _ => false,
        }
    }
}

/// Primary SQLite result code of a database error, if any.
fn primary_code(err: &sqlx::Error) -> Option<i32> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    let code = db_err.code()?;
    code.parse::<i32>().ok().map(|c| c & 0xff)
}

fn is_busy(err: &sqlx::Error) -> bool {
    if matches!(err, sqlx::Error::PoolTimedOut) {
        return true;
    }
    matches!(primary_code(err), Some(SQLITE_BUSY) | Some(SQLITE_LOCKED))
}
