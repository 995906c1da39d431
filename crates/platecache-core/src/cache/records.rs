use serde_json::Value;

use crate::store::{Key, Record, RESTAURANT_ID_INDEX};

/// A cached API response, keyed by resource identity.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRecord {
    pub key: Key,
    pub payload: Value,
}

impl CachedRecord {
    pub fn new(key: impl Into<Key>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

impl From<CachedRecord> for Record {
    fn from(record: CachedRecord) -> Self {
        Record::new(record.key, record.payload)
    }
}

impl From<Record> for CachedRecord {
    fn from(record: Record) -> Self {
        Self {
            key: record.key,
            payload: record.value,
        }
    }
}

/// One review, grouped under its restaurant through the `restaurant_id` index.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRecord {
    pub id: i64,
    pub restaurant_id: i64,
    pub payload: Value,
}

impl ReviewRecord {
    /// Build a record from a review payload as returned by the API.
    ///
    /// Returns `None` when the payload has no usable id.
    pub fn from_payload(payload: Value, restaurant_id: i64) -> Option<Self> {
        let id = payload.get("id").and_then(lenient_int)?;
        Some(Self {
            id,
            restaurant_id,
            payload,
        })
    }

    /// Stored value: the payload with a numeric `restaurant_id`, so the index
    /// sees the same value whether the server sent a number or a string.
    fn stored_value(self) -> Value {
        match self.payload {
            Value::Object(mut fields) => {
                fields.insert(RESTAURANT_ID_INDEX.to_string(), Value::from(self.restaurant_id));
                Value::Object(fields)
            }
            other => other,
        }
    }
}

impl From<ReviewRecord> for Record {
    fn from(review: ReviewRecord) -> Self {
        let id = review.id;
        Record::new(id, review.stored_value())
    }
}

/// Read an integer that the API may have sent as a number or a numeric string.
pub(crate) fn lenient_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_review_record_normalises_restaurant_id() {
        let review = ReviewRecord::from_payload(
            json!({"id": "7", "restaurant_id": "3", "name": "Jo", "rating": 4}),
            3,
        )
        .unwrap();
        assert_eq!(review.id, 7);

        let record: Record = review.into();
        assert_eq!(record.key, Key::Int(7));
        assert_eq!(record.value["restaurant_id"], json!(3));
        assert_eq!(record.value["name"], json!("Jo"));
    }

    #[test]
    fn test_review_without_id_is_skipped() {
        assert!(ReviewRecord::from_payload(json!({"name": "anon"}), 1).is_none());
        assert!(ReviewRecord::from_payload(json!({"id": null}), 1).is_none());
    }

    #[test]
    fn test_lenient_int() {
        assert_eq!(lenient_int(&json!(5)), Some(5));
        assert_eq!(lenient_int(&json!(" 12 ")), Some(12));
        assert_eq!(lenient_int(&json!("abc")), None);
        assert_eq!(lenient_int(&json!(1.5)), None);
    }
}
