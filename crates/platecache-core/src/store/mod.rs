//! Durable key-value store with named partitions.
//!
//! This module provides the `Store` shared by every other component. It holds
//! three partitions (see [`schema`]):
//! - `restaurants`: cached restaurant payloads, keyed by id or `"restaurants"`
//! - `reviews`: review records, indexed by restaurant id
//! - `pending`: the pending write queue, keyed by auto-increment id
//!
//! Every operation is a transaction scoped to a single partition: it works on
//! a copy, persists the copy, and only then makes it visible. A failed commit
//! changes nothing.
//!
//! A `Store` is a cheap handle; clone it to share one store between tasks.
//! Stores opened separately on the same location (another process, or a
//! second `open_dir`) stay consistent: each write transaction holds the
//! backend's lock on its partition and starts from the persisted contents.

pub mod backend;
pub mod key;
pub mod schema;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub use backend::{FileBackend, MemoryBackend, PartitionData, PartitionLock, StorageBackend};
pub use key::Key;
pub use schema::{
    IndexSchema, PartitionSchema, Schema, PENDING, RESTAURANTS, RESTAURANT_ID_INDEX, REVIEWS,
    SCHEMA_VERSION,
};

/// Lock name guarding schema upgrades.
const SCHEMA_LOCK: &str = "schema";

/// Give up on a contended partition lock after this long.
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: Key,
    pub value: Value,
}

impl Record {
    pub fn new(key: impl Into<Key>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

struct StoreInner {
    backend: Arc<dyn StorageBackend>,
    schema: Schema,
    partitions: HashMap<String, Mutex<PartitionData>>,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open a store on the given backend, upgrading its schema if needed.
    ///
    /// Opening is idempotent: re-opening an up-to-date store writes nothing.
    pub fn open(backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let schema = {
            let _guard = lock_blocking(backend.as_ref(), SCHEMA_LOCK)?;
            let persisted = backend.load_schema().map_err(Error::store)?;
            let upgraded = persisted.clone().unwrap_or_default().upgraded();
            if persisted.as_ref() != Some(&upgraded) {
                info!(
                    from = persisted.as_ref().map(|s| s.version).unwrap_or(0),
                    to = upgraded.version,
                    "Upgrading store schema"
                );
                backend.save_schema(&upgraded).map_err(Error::store)?;
            }
            upgraded
        };

        let mut partitions = HashMap::new();
        for partition in &schema.partitions {
            let data = backend
                .load_partition(&partition.name)
                .map_err(Error::store)?
                .unwrap_or_default();
            debug!(partition = %partition.name, records = data.len(), "Loaded partition");
            partitions.insert(partition.name.clone(), Mutex::new(data));
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                backend,
                schema,
                partitions,
            }),
        })
    }

    /// Open a file-backed store in `dir`.
    pub fn open_dir(dir: PathBuf) -> Result<Self> {
        let backend = FileBackend::new(dir).map_err(Error::store)?;
        Self::open(Arc::new(backend))
    }

    /// Open a store that lives only in memory.
    pub fn in_memory() -> Result<Self> {
        Self::open(Arc::new(MemoryBackend::new()))
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    fn slot(&self, partition: &str) -> Result<&Mutex<PartitionData>> {
        self.inner
            .partitions
            .get(partition)
            .ok_or_else(|| Error::StoreUnavailable(format!("Unknown partition: {}", partition)))
    }

    fn partition_schema(&self, partition: &str) -> Result<&PartitionSchema> {
        self.inner
            .schema
            .partition(partition)
            .ok_or_else(|| Error::StoreUnavailable(format!("Unknown partition: {}", partition)))
    }

    /// Take the backend lock on `partition`, waiting while another store holds it.
    async fn lock_partition(&self, partition: &str) -> Result<PartitionLock> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            if let Some(lock) = self
                .inner
                .backend
                .try_lock(partition)
                .map_err(Error::store)?
            {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(Error::StoreUnavailable(format!(
                    "Timed out waiting for lock on {}",
                    partition
                )));
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
    }

    /// Replace the in-memory copy with what is persisted, if anything is.
    fn reload(&self, partition: &str, current: &mut PartitionData) -> Result<()> {
        if let Some(fresh) = self
            .inner
            .backend
            .load_partition(partition)
            .map_err(Error::store)?
        {
            *current = fresh;
        }
        Ok(())
    }

    /// Run `f` against one partition as a single read-write transaction.
    ///
    /// Changes made by `f` are committed only if `f` returns `Ok` and the
    /// backend persists them; otherwise the partition is left as it was.
    /// The partition is locked at the backend for the whole transaction, so
    /// commits from other stores on the same location are never lost.
    pub async fn transact<R>(
        &self,
        partition: &str,
        f: impl FnOnce(&mut PartitionData) -> Result<R>,
    ) -> Result<R> {
        let slot = self.slot(partition)?;
        let mut current = slot.lock().await;
        let _lock = self.lock_partition(partition).await?;
        self.reload(partition, &mut current)?;
        let mut working = current.clone();
        let out = f(&mut working)?;
        self.inner
            .backend
            .save_partition(partition, &working)
            .map_err(Error::store)?;
        *current = working;
        Ok(out)
    }

    /// Run `f` against one partition as a read-only transaction.
    pub async fn read<R>(&self, partition: &str, f: impl FnOnce(&PartitionData) -> R) -> Result<R> {
        let slot = self.slot(partition)?;
        let mut current = slot.lock().await;
        // Renames are atomic, so an unlocked load never sees a partial commit
        self.reload(partition, &mut current)?;
        Ok(f(&current))
    }

    pub async fn get(&self, partition: &str, key: &Key) -> Result<Option<Record>> {
        self.read(partition, |data| {
            data.get(key).map(|value| Record::new(key.clone(), value.clone()))
        })
        .await
    }

    /// Auto-increment partitions only hold store-assigned integer keys.
    fn check_key(&self, partition: &str, key: &Key) -> Result<()> {
        if self.partition_schema(partition)?.auto_increment && key.as_int().is_none() {
            return Err(Error::StoreUnavailable(format!(
                "Partition {} only accepts integer keys, got {}",
                partition, key
            )));
        }
        Ok(())
    }

    pub async fn put(&self, partition: &str, record: Record) -> Result<()> {
        self.check_key(partition, &record.key)?;
        self.transact(partition, |data| {
            data.insert(record.key, record.value);
            Ok(())
        })
        .await
    }

    /// Put several records in one transaction.
    pub async fn put_many(&self, partition: &str, records: Vec<Record>) -> Result<()> {
        for record in &records {
            self.check_key(partition, &record.key)?;
        }
        self.transact(partition, |data| {
            for record in records {
                data.insert(record.key, record.value);
            }
            Ok(())
        })
        .await
    }

    /// Insert under a store-assigned key. Only valid for auto-increment partitions.
    pub async fn add(&self, partition: &str, value: Value) -> Result<Key> {
        if !self.partition_schema(partition)?.auto_increment {
            return Err(Error::StoreUnavailable(format!(
                "Partition {} does not assign keys",
                partition
            )));
        }
        self.transact(partition, |data| Ok(data.push(value))).await
    }

    /// Delete a record. Deleting a missing key is not an error.
    pub async fn delete(&self, partition: &str, key: &Key) -> Result<()> {
        self.transact(partition, |data| {
            data.remove(key);
            Ok(())
        })
        .await
    }

    /// First record in key order.
    pub async fn first(&self, partition: &str) -> Result<Option<Record>> {
        self.read(partition, |data| {
            data.first()
                .map(|(key, value)| Record::new(key.clone(), value.clone()))
        })
        .await
    }

    pub async fn count(&self, partition: &str) -> Result<usize> {
        self.read(partition, PartitionData::len).await
    }

    /// Scan a partition, optionally through an index.
    ///
    /// Without an index, records come back in key order. With an index, only
    /// records that have the indexed field are returned, ordered by that field
    /// and then by key; `matching` restricts them to one index value.
    pub async fn scan(
        &self,
        partition: &str,
        index: Option<&str>,
        matching: Option<&Value>,
    ) -> Result<Vec<Record>> {
        let field = match index {
            Some(name) => Some(
                self.partition_schema(partition)?
                    .index(name)
                    .map(|i| i.field.clone())
                    .ok_or_else(|| {
                        Error::StoreUnavailable(format!(
                            "Unknown index {} on partition {}",
                            name, partition
                        ))
                    })?,
            ),
            None => None,
        };

        self.read(partition, |data| {
            let mut records: Vec<Record> = data
                .iter()
                .filter(|(_, value)| match &field {
                    Some(field) => match value.get(field) {
                        Some(indexed) => matching.map_or(true, |m| indexed == m),
                        None => false,
                    },
                    None => true,
                })
                .map(|(key, value)| Record::new(key.clone(), value.clone()))
                .collect();

            if let (Some(field), None) = (&field, matching) {
                records.sort_by(|a, b| {
                    index_order(&a.value[field.as_str()], &b.value[field.as_str()])
                        .then_with(|| a.key.cmp(&b.key))
                });
            }
            records
        })
        .await
    }
}

/// Take the backend lock on `name` from synchronous code.
fn lock_blocking(backend: &dyn StorageBackend, name: &str) -> Result<PartitionLock> {
    let deadline = Instant::now() + LOCK_TIMEOUT;
    loop {
        if let Some(lock) = backend.try_lock(name).map_err(Error::store)? {
            return Ok(lock);
        }
        if Instant::now() >= deadline {
            return Err(Error::StoreUnavailable(format!(
                "Timed out waiting for lock on {}",
                name
            )));
        }
        std::thread::sleep(LOCK_RETRY);
    }
}

/// Order index values: numbers first (numerically), then strings, then anything else.
fn index_order(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Number(_), _) => Ordering::Less,
        (_, Value::Number(_)) => Ordering::Greater,
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::String(_), _) => Ordering::Less,
        (_, Value::String(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
