//! Durable FIFO of mutating requests awaiting confirmed delivery.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::api::{Method, Request};
use crate::cache::is_blank;
use crate::error::{Error, Result};
use crate::store::{Key, Record, Store, PENDING};

/// Store-assigned id of a queued operation; also its position in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub i64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted shape of a queued operation. Every field is optional on read so
/// that damaged entries still load and can be purged.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredOperation {
    #[serde(default)]
    url: String,
    #[serde(default)]
    method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enqueued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub id: OperationId,
    pub url: String,
    /// `None` when the stored method is missing or not one we can send.
    pub method: Option<Method>,
    pub body: Option<Value>,
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl PendingOperation {
    fn from_record(record: Record) -> Self {
        let id = OperationId(record.key.as_int().unwrap_or_default());
        let stored: StoredOperation = serde_json::from_value(record.value).unwrap_or_else(|e| {
            debug!(id = %id, error = %e, "Unreadable pending operation");
            StoredOperation::default()
        });
        Self {
            id,
            url: stored.url,
            method: stored.method.parse().ok(),
            body: stored.body,
            enqueued_at: stored.enqueued_at,
        }
    }

    /// Check the queue invariants: non-empty url and method, and a POST carries a body.
    pub fn validate(&self) -> Result<Method> {
        let malformed = |reason: &str| Error::MalformedOperation {
            id: Some(self.id),
            reason: reason.to_string(),
        };

        if self.url.trim().is_empty() {
            return Err(malformed("missing url"));
        }
        let method = self.method.ok_or_else(|| malformed("missing or unsupported method"))?;
        if method == Method::Post && self.body.as_ref().map_or(true, is_blank) {
            return Err(malformed("POST without body"));
        }
        Ok(method)
    }

    /// Build the network request replaying this operation.
    pub fn to_request(&self) -> Result<Request> {
        let method = self.validate()?;
        Ok(Request {
            method,
            url: self.url.clone(),
            body: self.body.clone(),
        })
    }
}

/// The pending write queue, backed by the `pending` partition.
#[derive(Clone)]
pub struct PendingQueue {
    store: Store,
}

impl PendingQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append an operation. Operations that could never be delivered are rejected.
    pub async fn enqueue(
        &self,
        url: impl Into<String>,
        method: Method,
        body: Option<Value>,
    ) -> Result<OperationId> {
        let url = url.into();
        let candidate = PendingOperation {
            id: OperationId(0),
            url: url.clone(),
            method: Some(method),
            body: body.clone(),
            enqueued_at: Some(Utc::now()),
        };
        if let Err(Error::MalformedOperation { reason, .. }) = candidate.validate() {
            return Err(Error::MalformedOperation { id: None, reason });
        }

        let stored = StoredOperation {
            url,
            method: method.as_str().to_string(),
            body,
            enqueued_at: candidate.enqueued_at,
        };
        let value = serde_json::to_value(&stored).map_err(Error::store)?;
        let key = self.store.add(PENDING, value).await?;
        let id = OperationId(key.as_int().unwrap_or_default());
        info!(id = %id, method = %method, url = %candidate.url, "Queued pending operation");
        Ok(id)
    }

    pub async fn peek_oldest(&self) -> Result<Option<PendingOperation>> {
        Ok(self
            .store
            .first(PENDING)
            .await?
            .map(PendingOperation::from_record))
    }

    /// Remove the head of the queue, but only if it is still `expected`.
    ///
    /// Fails with `QueueChanged`, deleting nothing, when the head has a
    /// different id than the one captured by the caller's peek.
    pub async fn remove_oldest(&self, expected: OperationId) -> Result<()> {
        self.store
            .transact(PENDING, |data| {
                let head = data.first().map(|(key, _)| key.clone());
                match head {
                    Some(Key::Int(id)) if id == expected.0 => {
                        data.remove(&Key::Int(id));
                        Ok(())
                    }
                    other => Err(Error::QueueChanged {
                        expected,
                        found: other.and_then(|k| k.as_int()).map(OperationId),
                    }),
                }
            })
            .await
    }

    pub async fn len(&self) -> Result<usize> {
        self.store.count(PENDING).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// All queued operations, oldest first.
    pub async fn list(&self) -> Result<Vec<PendingOperation>> {
        Ok(self
            .store
            .scan(PENDING, None, None)
            .await?
            .into_iter()
            .map(PendingOperation::from_record)
            .collect())
    }
}
