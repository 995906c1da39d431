use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::api::{ApiError, Request, Transport};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::store::{Key, Record, Store, RESTAURANTS, RESTAURANT_ID_INDEX, REVIEWS};

use super::is_blank;
use super::records::{CachedRecord, ReviewRecord};

/// Key under which the full restaurant collection is cached.
pub const ALL_RESTAURANTS_KEY: &str = "restaurants";

/// Identity of a readable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    AllRestaurants,
    Restaurant(i64),
    ReviewsFor(i64),
}

impl ResourceKey {
    /// API path serving this resource.
    pub fn path(&self) -> String {
        match self {
            ResourceKey::AllRestaurants => "/restaurants".to_string(),
            ResourceKey::Restaurant(id) => format!("/restaurants/{}", id),
            ResourceKey::ReviewsFor(id) => format!("/reviews/?restaurant_id={}", id),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Cache-aside reader: store first, network on a miss.
#[derive(Clone)]
pub struct CacheReader {
    store: Store,
    transport: Arc<dyn Transport>,
}

impl CacheReader {
    pub fn new(ctx: &Context) -> Self {
        Self {
            store: ctx.store.clone(),
            transport: ctx.transport.clone(),
        }
    }

    /// Return the cached payload, fetching and caching it on a miss.
    ///
    /// Reviews come back as a JSON array of review payloads.
    pub async fn read(&self, key: ResourceKey) -> Result<Value> {
        if let Some(cached) = self.lookup(key).await {
            debug!(resource = %key, "Cache hit");
            return Ok(cached);
        }

        debug!(resource = %key, "Cache miss, fetching");
        match self.fetch(key).await {
            Ok(fresh) => {
                self.populate(key, &fresh).await;
                Ok(fresh)
            }
            Err(e) => Err(unavailable(key, e)),
        }
    }

    /// Fetch from the network even when cached, falling back to the cache
    /// if the network is unreachable.
    pub async fn refresh(&self, key: ResourceKey) -> Result<Value> {
        match self.fetch(key).await {
            Ok(fresh) => {
                self.populate(key, &fresh).await;
                Ok(fresh)
            }
            Err(e @ Error::NotFound(_)) => Err(e),
            Err(e) => match self.lookup(key).await {
                Some(cached) => {
                    debug!(resource = %key, error = %e, "Refresh failed, serving cached copy");
                    Ok(cached)
                }
                None => Err(unavailable(key, e)),
            },
        }
    }

    /// Cached payload, or `None` on a miss. Store failures count as a miss.
    async fn lookup(&self, key: ResourceKey) -> Option<Value> {
        let found = match key {
            ResourceKey::AllRestaurants => self
                .store
                .get(RESTAURANTS, &Key::from(ALL_RESTAURANTS_KEY))
                .await
                .map(|r| r.map(|r| r.value)),
            ResourceKey::Restaurant(id) => self
                .store
                .get(RESTAURANTS, &Key::Int(id))
                .await
                .map(|r| r.map(|r| r.value)),
            ResourceKey::ReviewsFor(id) => self
                .store
                .scan(REVIEWS, Some(RESTAURANT_ID_INDEX), Some(&json!(id)))
                .await
                .map(|records| Some(Value::Array(records.into_iter().map(|r| r.value).collect()))),
        };

        match found {
            Ok(Some(value)) if !is_blank(&value) => Some(value),
            Ok(_) => None,
            Err(e) => {
                warn!(resource = %key, error = %e, "Store lookup failed, going to network");
                None
            }
        }
    }

    async fn fetch(&self, key: ResourceKey) -> Result<Value> {
        let response = self.transport.send(&Request::get(key.path())).await?;
        match response.error_for_status() {
            Ok(response) => Ok(response.json()?),
            Err(ApiError::NotFound(_)) => match key {
                ResourceKey::Restaurant(id) => Err(Error::NotFound(id)),
                _ => Err(ApiError::NotFound(key.path()).into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Write a fetched payload back. Failures are logged and otherwise ignored.
    async fn populate(&self, key: ResourceKey, payload: &Value) {
        let written = match key {
            ResourceKey::AllRestaurants => {
                let record = CachedRecord::new(ALL_RESTAURANTS_KEY, payload.clone());
                self.store.put(RESTAURANTS, record.into()).await
            }
            ResourceKey::Restaurant(id) => {
                let record = CachedRecord::new(id, payload.clone());
                self.store.put(RESTAURANTS, record.into()).await
            }
            ResourceKey::ReviewsFor(id) => {
                let records: Vec<Record> = payload
                    .as_array()
                    .map(|items| items.as_slice())
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|item| ReviewRecord::from_payload(item.clone(), id))
                    .map(Record::from)
                    .collect();
                self.store.put_many(REVIEWS, records).await
            }
        };

        if let Err(e) = written {
            warn!(resource = %key, error = %e, "Could not cache response");
        }
    }
}

fn unavailable(key: ResourceKey, err: Error) -> Error {
    match err {
        Error::NotFound(_) => err,
        other => Error::ResourceUnavailable(format!("{}: {}", key, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Method, MockTransport};
    use crate::config::Config;
    use crate::store::MemoryBackend;

    fn setup() -> (Arc<MemoryBackend>, Arc<MockTransport>, Store, CacheReader) {
        let backend = Arc::new(MemoryBackend::new());
        let store = Store::open(backend.clone()).unwrap();
        let transport = Arc::new(MockTransport::new());
        let ctx = Context::new(store.clone(), transport.clone(), Config::default());
        (backend, transport, store, CacheReader::new(&ctx))
    }

    fn restaurants() -> Value {
        json!([
            {"id": 1, "name": "Mission Chinese Food", "cuisine_type": "Asian"},
            {"id": 2, "name": "Emily", "cuisine_type": "Pizza"}
        ])
    }

    #[tokio::test]
    async fn test_second_read_is_served_from_cache() {
        let (_, transport, store, reader) = setup();
        transport.respond(Method::Get, "/restaurants", 200, restaurants());

        let first = reader.read(ResourceKey::AllRestaurants).await.unwrap();
        let second = reader.read(ResourceKey::AllRestaurants).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.request_count(), 1);

        let cached = store
            .get(RESTAURANTS, &Key::from(ALL_RESTAURANTS_KEY))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.value, restaurants());
    }

    #[tokio::test]
    async fn test_offline_miss_is_resource_unavailable() {
        let (_, transport, _, reader) = setup();
        transport.set_online(false);
        let err = reader.read(ResourceKey::Restaurant(3)).await.unwrap_err();
        assert!(matches!(err, Error::ResourceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_blank_cached_value_counts_as_miss() {
        let (_, transport, store, reader) = setup();
        store
            .put(RESTAURANTS, Record::new(ALL_RESTAURANTS_KEY, json!([])))
            .await
            .unwrap();
        transport.respond(Method::Get, "/restaurants", 200, restaurants());

        let value = reader.read(ResourceKey::AllRestaurants).await.unwrap();
        assert_eq!(value, restaurants());
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_reviews_stored_per_record_and_grouped() {
        let (_, transport, store, reader) = setup();
        transport.respond(
            Method::Get,
            "/reviews/?restaurant_id=1",
            200,
            json!([
                {"id": 10, "restaurant_id": 1, "name": "A", "rating": 5},
                {"id": 11, "restaurant_id": "1", "name": "B", "rating": 3},
                {"name": "no id"}
            ]),
        );

        reader.read(ResourceKey::ReviewsFor(1)).await.unwrap();
        assert_eq!(store.count(REVIEWS).await.unwrap(), 2);

        transport.set_online(false);
        let cached = reader.read(ResourceKey::ReviewsFor(1)).await.unwrap();
        let names: Vec<&str> = cached
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
        assert!(reader.read(ResourceKey::ReviewsFor(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_restaurant_is_not_found() {
        let (_, _, _, reader) = setup();
        let err = reader.read(ResourceKey::Restaurant(99)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(99)));
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_network() {
        let (backend, transport, store, reader) = setup();
        transport.respond(Method::Get, "/restaurants/1", 200, json!({"id": 1, "name": "x"}));
        backend.set_fail_writes(true);

        let value = reader.read(ResourceKey::Restaurant(1)).await.unwrap();
        assert_eq!(value["name"], json!("x"));
        assert!(store.get(RESTAURANTS, &Key::Int(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_falls_back_to_cache() {
        let (_, transport, _, reader) = setup();
        transport.respond(Method::Get, "/restaurants/1", 200, json!({"id": 1, "name": "old"}));
        reader.read(ResourceKey::Restaurant(1)).await.unwrap();

        transport.respond(Method::Get, "/restaurants/1", 200, json!({"id": 1, "name": "new"}));
        let value = reader.refresh(ResourceKey::Restaurant(1)).await.unwrap();
        assert_eq!(value["name"], json!("new"));

        transport.set_online(false);
        let value = reader.refresh(ResourceKey::Restaurant(1)).await.unwrap();
        assert_eq!(value["name"], json!("new"));
        assert_eq!(transport.request_count(), 3);
    }
}
