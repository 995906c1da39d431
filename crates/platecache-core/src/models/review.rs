use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::lenient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Review {
    // Reviews created offline have no server id yet
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(deserialize_with = "lenient::int_or_string")]
    pub restaurant_id: i64,
    pub name: String,
    #[serde(deserialize_with = "lenient::int_or_string")]
    pub rating: i64,
    #[serde(default)]
    pub comments: String,
    /// Milliseconds since the Unix epoch
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<i64>,
}

/// A review as entered by the user, before it is stored or sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct NewReview {
    pub restaurant_id: i64,
    pub name: String,
    pub rating: i64,
    pub comments: String,
}

impl NewReview {
    /// Request body for `POST /reviews`
    pub fn to_body(&self, created_at_ms: i64) -> Value {
        json!({
            "restaurant_id": self.restaurant_id,
            "name": self.name,
            "rating": self.rating,
            "comments": self.comments,
            "createdAt": created_at_ms,
        })
    }
}
