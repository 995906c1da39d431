use serde_json::{Map, Value};
use tracing::debug;

use crate::context::Context;
use crate::error::Result;
use crate::store::{Key, PartitionData, Record, Store, RESTAURANTS, REVIEWS};

use super::reader::ALL_RESTAURANTS_KEY;
use super::records::{lenient_int, ReviewRecord};

/// Applies local mutations to cached records ahead of delivery.
#[derive(Clone)]
pub struct CacheWriter {
    store: Store,
}

impl CacheWriter {
    pub fn new(ctx: &Context) -> Self {
        Self {
            store: ctx.store.clone(),
        }
    }

    /// Merge `patch` into the cached restaurant and its entry in the cached
    /// collection, in one transaction.
    ///
    /// If only the collection has the restaurant, an item record is created
    /// from the patched entry. Returns the values the patched fields had
    /// before (`null` where a field was absent), or `None` when neither was
    /// cached.
    pub async fn patch_restaurant(
        &self,
        id: i64,
        patch: &Map<String, Value>,
    ) -> Result<Option<Map<String, Value>>> {
        let prior = self
            .store
            .transact(RESTAURANTS, |data| Ok(apply(data, id, patch, true)))
            .await?;

        if prior.is_none() {
            debug!(restaurant_id = id, "Restaurant not cached, nothing to patch");
        }
        Ok(prior)
    }

    /// Put back fields saved by [`patch_restaurant`](Self::patch_restaurant).
    /// `null` values remove the field again.
    pub async fn restore_restaurant(&self, id: i64, prior: &Map<String, Value>) -> Result<()> {
        self.store
            .transact(RESTAURANTS, |data| {
                apply(data, id, prior, false);
                Ok(())
            })
            .await?;
        debug!(restaurant_id = id, "Restored cached restaurant");
        Ok(())
    }

    /// Store a review created locally, visible to later reads at once.
    pub async fn insert_review(&self, review: ReviewRecord) -> Result<()> {
        let id = review.id;
        self.store.put(REVIEWS, Record::from(review)).await?;
        debug!(review_id = id, "Stored local review");
        Ok(())
    }

    /// Drop a locally created review.
    pub async fn remove_review(&self, id: i64) -> Result<()> {
        self.store.delete(REVIEWS, &Key::Int(id)).await?;
        debug!(review_id = id, "Removed local review");
        Ok(())
    }
}

/// Write `fields` into the restaurant's item and collection entry, returning
/// their previous values. With `keep_null` false, `null` removes a field.
fn apply(
    data: &mut PartitionData,
    id: i64,
    fields: &Map<String, Value>,
    keep_null: bool,
) -> Option<Map<String, Value>> {
    let mut from_collection = None;
    let mut prior = None;
    let all_key = Key::from(ALL_RESTAURANTS_KEY);
    if let Some(Value::Array(items)) = data.get(&all_key) {
        let mut items = items.clone();
        if let Some(entry) = items.iter_mut().find(|item| has_id(item, id)) {
            prior = Some(previous(entry, fields));
            merge(entry, fields, keep_null);
            from_collection = Some(entry.clone());
            data.insert(all_key, Value::Array(items));
        }
    }

    let item_key = Key::Int(id);
    let item = match data.get(&item_key) {
        Some(existing) if existing.is_object() => {
            let mut existing = existing.clone();
            prior = Some(previous(&existing, fields));
            merge(&mut existing, fields, keep_null);
            Some(existing)
        }
        _ => from_collection,
    };
    if let Some(item) = item {
        data.insert(item_key, item);
    }
    prior
}

fn previous(target: &Value, fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .keys()
        .map(|name| (name.clone(), target.get(name).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn has_id(item: &Value, id: i64) -> bool {
    item.get("id").and_then(lenient_int) == Some(id)
}

fn merge(target: &mut Value, patch: &Map<String, Value>, keep_null: bool) {
    if let Value::Object(fields) = target {
        for (name, value) in patch {
            if value.is_null() && !keep_null {
                fields.remove(name);
            } else {
                fields.insert(name.clone(), value.clone());
            }
        }
    }
}
