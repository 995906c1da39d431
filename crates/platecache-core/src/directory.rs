//! Caller-facing directory operations.
//!
//! Every operation a UI needs goes through [`Directory`]: reads are served
//! cache-aside, and mutations are applied to the local cache first, queued
//! for delivery, and then handed to the sync engine. A mutation succeeds once
//! it is durable in the queue, whether or not it has reached the server.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::api::Method;
use crate::cache::{CacheReader, CacheWriter, ResourceKey, ReviewRecord};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::models::{distinct, NewReview, Restaurant, RestaurantFilter, Review};
use crate::sync::{DrainReport, OperationId, PendingQueue, SyncEngine, SyncWorker};

/// Maximum concurrent requests while prefetching.
/// Limits parallel requests to avoid overwhelming the server.
const MAX_CONCURRENT_REQUESTS: usize = 10;

/// Result of an optimistic favorite toggle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct FavoriteUpdate {
    pub restaurant_id: i64,
    pub is_favorite: bool,
    /// Whether a cached copy of the restaurant was updated.
    pub cached: bool,
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub operation: OperationId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PrefetchReport {
    pub restaurants: usize,
    pub reviews: usize,
    /// Restaurants whose details or reviews could not be cached.
    pub failed: Vec<i64>,
}

pub struct Directory {
    reader: CacheReader,
    writer: CacheWriter,
    engine: Arc<SyncEngine>,
    worker: Option<SyncWorker>,
}

impl Directory {
    /// Directory that drains inline after every mutation.
    pub fn new(ctx: &Context) -> Self {
        Self {
            reader: CacheReader::new(ctx),
            writer: CacheWriter::new(ctx),
            engine: Arc::new(SyncEngine::new(ctx)),
            worker: None,
        }
    }

    /// Directory backed by a background sync worker. Must be called from
    /// within a tokio runtime.
    pub fn with_worker(ctx: &Context) -> Self {
        let mut directory = Self::new(ctx);
        directory.worker = Some(SyncWorker::spawn(directory.engine.clone()));
        directory
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn queue(&self) -> &PendingQueue {
        self.engine.queue()
    }

    pub fn worker(&self) -> Option<&SyncWorker> {
        self.worker.as_ref()
    }

    pub async fn restaurants(&self) -> Result<Vec<Restaurant>> {
        let payload = self.reader.read(ResourceKey::AllRestaurants).await?;
        Ok(parse_list(payload, "restaurant"))
    }

    /// Re-fetch the restaurant list, keeping the cached copy if offline.
    pub async fn refresh_restaurants(&self) -> Result<Vec<Restaurant>> {
        let payload = self.reader.refresh(ResourceKey::AllRestaurants).await?;
        Ok(parse_list(payload, "restaurant"))
    }

    /// One restaurant. When it is neither cached nor reachable on its own,
    /// the cached restaurant list is consulted.
    pub async fn restaurant(&self, id: i64) -> Result<Restaurant> {
        match self.reader.read(ResourceKey::Restaurant(id)).await {
            Ok(payload) => parse_item(payload, id),
            Err(Error::ResourceUnavailable(reason)) => {
                debug!(restaurant_id = id, "Looking up restaurant in cached list");
                let all = self
                    .restaurants()
                    .await
                    .map_err(|_| Error::ResourceUnavailable(reason))?;
                all.into_iter()
                    .find(|r| r.id == id)
                    .ok_or(Error::NotFound(id))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn restaurants_matching(&self, filter: &RestaurantFilter) -> Result<Vec<Restaurant>> {
        let all = self.restaurants().await?;
        Ok(all.into_iter().filter(|r| filter.matches(r)).collect())
    }

    pub async fn neighborhoods(&self) -> Result<Vec<String>> {
        let all = self.restaurants().await?;
        Ok(distinct(&all, |r| r.neighborhood.as_ref()))
    }

    pub async fn cuisines(&self) -> Result<Vec<String>> {
        let all = self.restaurants().await?;
        Ok(distinct(&all, |r| r.cuisine_type.as_ref()))
    }

    pub async fn reviews(&self, restaurant_id: i64) -> Result<Vec<Review>> {
        let payload = self.reader.read(ResourceKey::ReviewsFor(restaurant_id)).await?;
        Ok(parse_list(payload, "review"))
    }

    /// Store a review locally, then queue it for `POST /reviews`.
    ///
    /// The local copy uses the creation time in milliseconds as its id. If
    /// the review cannot be queued, the local copy is removed again.
    pub async fn submit_review(&self, review: NewReview) -> Result<Review> {
        let created_at = Utc::now().timestamp_millis();
        let body = review.to_body(created_at);

        let mut payload = body.clone();
        if let Value::Object(ref mut fields) = payload {
            fields.insert("id".to_string(), json!(created_at));
        }
        let local: Review = serde_json::from_value(payload.clone())
            .map_err(|e| Error::MalformedOperation {
                id: None,
                reason: format!("invalid review: {}", e),
            })?;

        self.writer
            .insert_review(ReviewRecord {
                id: created_at,
                restaurant_id: review.restaurant_id,
                payload,
            })
            .await?;
        let op = match self.queue().enqueue("/reviews", Method::Post, Some(body)).await {
            Ok(op) => op,
            Err(e) => {
                if let Err(undo) = self.writer.remove_review(created_at).await {
                    warn!(review_id = created_at, error = %undo, "Could not remove unqueued review");
                }
                return Err(e);
            }
        };
        info!(restaurant_id = review.restaurant_id, operation = %op, "Review submitted");

        self.after_mutation().await;
        Ok(local)
    }

    /// Set a restaurant's favorite flag locally, then queue the update.
    /// If the update cannot be queued, the cached flag is put back.
    pub async fn toggle_favorite(&self, id: i64, is_favorite: bool) -> Result<FavoriteUpdate> {
        let mut patch = Map::new();
        patch.insert("is_favorite".to_string(), json!(is_favorite));
        let prior = self.writer.patch_restaurant(id, &patch).await?;
        let cached = prior.is_some();

        let url = format!("/restaurants/{}/?is_favorite={}", id, is_favorite);
        let operation = match self.queue().enqueue(url, Method::Put, None).await {
            Ok(op) => op,
            Err(e) => {
                if let Some(prior) = prior {
                    if let Err(undo) = self.writer.restore_restaurant(id, &prior).await {
                        warn!(restaurant_id = id, error = %undo, "Could not restore favorite flag");
                    }
                }
                return Err(e);
            }
        };
        info!(restaurant_id = id, is_favorite, operation = %operation, "Favorite updated");

        self.after_mutation().await;
        Ok(FavoriteUpdate {
            restaurant_id: id,
            is_favorite,
            cached,
            operation,
        })
    }

    /// Re-fetch a restaurant's reviews, keeping the cached copy if offline.
    pub async fn refresh_reviews(&self, restaurant_id: i64) -> Result<Vec<Review>> {
        let payload = self
            .reader
            .refresh(ResourceKey::ReviewsFor(restaurant_id))
            .await?;
        Ok(parse_list(payload, "review"))
    }

    /// Explicit retry of everything pending, ignoring backoff.
    pub async fn sync(&self) -> Result<DrainReport> {
        self.engine.drain_now().await
    }

    /// Warm the cache: the restaurant list, then every restaurant's details
    /// and reviews.
    pub async fn prefetch(&self) -> Result<PrefetchReport> {
        let all = self.restaurants().await?;
        let mut report = PrefetchReport {
            restaurants: all.len(),
            ..PrefetchReport::default()
        };

        let results: Vec<(i64, bool, Option<usize>)> = stream::iter(all.iter().map(|r| r.id))
            .map(|id| {
                let reader = self.reader.clone();
                async move {
                    let item = reader.read(ResourceKey::Restaurant(id)).await;
                    let reviews = reader.read(ResourceKey::ReviewsFor(id)).await;
                    let count = reviews
                        .ok()
                        .map(|v| v.as_array().map_or(0, |items| items.len()));
                    (id, item.is_ok(), count)
                }
            })
            .buffer_unordered(MAX_CONCURRENT_REQUESTS)
            .collect()
            .await;

        for (id, item_ok, reviews) in results {
            match reviews {
                Some(count) if item_ok => report.reviews += count,
                _ => report.failed.push(id),
            }
        }
        report.failed.sort_unstable();

        info!(
            restaurants = report.restaurants,
            reviews = report.reviews,
            failed = report.failed.len(),
            "Prefetch complete"
        );
        Ok(report)
    }

    /// Stop the background worker, if any.
    pub async fn shutdown(self) {
        if let Some(worker) = self.worker {
            worker.shutdown().await;
        }
    }

    async fn after_mutation(&self) {
        if let Some(ref worker) = self.worker {
            worker.nudge();
            return;
        }
        match self.engine.trigger().await {
            Ok(report) if !report.is_complete() => {
                debug!(outcome = ?report.outcome, "Mutation left queued for a later attempt");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Drain after mutation failed"),
        }
    }
}

fn parse_item(payload: Value, id: i64) -> Result<Restaurant> {
    serde_json::from_value(payload).map_err(|e| {
        Error::ResourceUnavailable(format!("unreadable restaurant {}: {}", id, e))
    })
}

/// Parse an array payload, skipping elements that do not parse.
fn parse_list<T: DeserializeOwned>(payload: Value, kind: &str) -> Vec<T> {
    let Value::Array(items) = payload else {
        warn!(kind, "Expected a list payload");
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(kind, error = %e, "Skipping unreadable entry");
                None
            }
        })
        .collect()
}
