//! Value codec shared by the string and hash stores.
//!
//! A [`Value`] is an opaque byte payload. Integers are stored as their
//! canonical decimal text (`-42` is the three bytes `b"-42"`), so the same row
//! can be read back either as text or as an `i64`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{KvError, Result};

/// Opaque byte payload stored in `kv_string.value` and `kv_hash.value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Value(Vec<u8>);

impl Value {
    /// Raw-string form.
    pub fn string(s: impl Into<String>) -> Self {
        Self(s.into().into_bytes())
    }

    /// Raw-bytes form.
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Self(b.into())
    }

    /// Integer form: decimal text of `i`.
    pub fn int(i: i64) -> Self {
        Self(i.to_string().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reads the payload as UTF-8 text.
    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.0)
            .map_err(|e| KvError::decode(format!("value is not valid UTF-8: {e}")))
    }

    /// Parses the payload as a decimal `i64`.
    ///
    /// Accepts an optional leading `+` or `-`; anything else that is not an
    /// ASCII digit (whitespace included) is rejected.
    pub fn as_i64(&self) -> Result<i64> {
        let text = std::str::from_utf8(&self.0)
            .map_err(|_| KvError::decode(format!("{:?} is not an integer", self)))?;
        text.parse::<i64>()
            .map_err(|e| KvError::decode(format!("{text:?} is not an integer: {e}")))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::bytes(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::bytes(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::int(i)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}
