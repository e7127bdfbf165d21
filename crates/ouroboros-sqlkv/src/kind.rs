//! Logical key types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared logical type of a key.
///
/// Stored in `kv_index.kind` as a small integer. A key's kind is fixed the
/// first time it is written and only goes away with a whole-key delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KeyKind {
    /// Placeholder code; never written by this crate.
    #[default]
    Undefined,
    /// Single scalar value per key (`kv_string`).
    String,
    /// Field-value pairs per key (`kv_hash`).
    Hash,
}

impl KeyKind {
    /// Integer code persisted in `kv_index`.
    pub fn code(&self) -> i64 {
        match self {
            KeyKind::Undefined => 0,
            KeyKind::String => 1,
            KeyKind::Hash => 2,
        }
    }

    /// Maps a persisted code back to a kind, `None` for codes this crate never writes.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(KeyKind::Undefined),
            1 => Some(KeyKind::String),
            2 => Some(KeyKind::Hash),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Undefined => "Undefined",
            KeyKind::String => "String",
            KeyKind::Hash => "Hash",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
