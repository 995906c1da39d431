//! Cache-aside reads and optimistic local writes over the durable store.
//!
//! - `CacheReader`: serves a resource from the store, falling back to the
//!   network on a miss and populating the store with the result
//! - `CacheWriter`: applies local mutations to cached records before the
//!   matching request is delivered
//!
//! Cached payloads never expire. They are only replaced by a later fetch or a
//! local mutation.

mod reader;
mod records;
mod writer;

use serde_json::Value;

pub use reader::{CacheReader, ResourceKey, ALL_RESTAURANTS_KEY};
pub use records::{CachedRecord, ReviewRecord};
pub use writer::CacheWriter;

/// Whether a payload carries no data: null, or an empty string, array or object.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_blank() {
        assert!(is_blank(&json!(null)));
        assert!(is_blank(&json!("")));
        assert!(is_blank(&json!([])));
        assert!(is_blank(&json!({})));
        assert!(!is_blank(&json!(0)));
        assert!(!is_blank(&json!(false)));
        assert!(!is_blank(&json!([{}])));
        assert!(!is_blank(&json!({"id": 1})));
    }
}
