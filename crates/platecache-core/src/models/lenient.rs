//! Deserializers for fields the API sends with inconsistent types.

use serde::{de::Error, Deserialize, Deserializer};
use serde_json::Value;

/// Accept `true`, `"true"`, `false`, `"false"` or null (false).
pub fn bool_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") || s.is_empty() => Ok(false),
        Value::Null => Ok(false),
        other => Err(D::Error::custom(format!("expected boolean, got {}", other))),
    }
}

/// Accept an integer or a string holding an integer.
pub fn int_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| D::Error::custom(format!("expected integer, got {}", n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("expected integer, got {:?}", s))),
        other => Err(D::Error::custom(format!("expected integer, got {}", other))),
    }
}
