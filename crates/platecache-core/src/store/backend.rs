//! Persistence backends for the durable store.
//!
//! The store keeps each partition in memory and hands a complete copy of a
//! partition to the backend on every commit. A backend must either persist the
//! whole copy or fail without touching what was previously persisted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::schema::Schema;
use super::{Key, Record};

/// Schema file name in the data directory
const SCHEMA_FILE: &str = "schema.json";

/// Contents of one partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionData {
    last_id: i64,
    records: BTreeMap<Key, Value>,
}

impl PartitionData {
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.records.get(key)
    }

    pub fn insert(&mut self, key: Key, value: Value) {
        if let Key::Int(n) = key {
            self.last_id = self.last_id.max(n);
        }
        self.records.insert(key, value);
    }

    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        self.records.remove(key)
    }

    /// Insert under the next auto-increment key.
    pub fn push(&mut self, value: Value) -> Key {
        let key = Key::Int(self.last_id + 1);
        self.insert(key.clone(), value);
        key
    }

    pub fn first(&self) -> Option<(&Key, &Value)> {
        self.records.iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// On-disk shape of a partition.
#[derive(Debug, Serialize, Deserialize)]
struct PartitionFile {
    #[serde(default)]
    last_id: i64,
    #[serde(default)]
    records: Vec<Record>,
    saved_at: DateTime<Utc>,
}

impl From<&PartitionData> for PartitionFile {
    fn from(data: &PartitionData) -> Self {
        Self {
            last_id: data.last_id,
            records: data
                .records
                .iter()
                .map(|(key, value)| Record::new(key.clone(), value.clone()))
                .collect(),
            saved_at: Utc::now(),
        }
    }
}

impl From<PartitionFile> for PartitionData {
    fn from(file: PartitionFile) -> Self {
        let mut data = PartitionData {
            last_id: file.last_id,
            records: BTreeMap::new(),
        };
        for record in file.records {
            data.insert(record.key, record.value);
        }
        data
    }
}

/// Exclusive hold on one partition, released on drop.
///
/// Held for the duration of a write transaction so that stores opened by
/// other processes (or other `Store` handles) on the same location cannot
/// interleave their commits.
pub struct PartitionLock {
    _held: Box<dyn Send>,
}

impl PartitionLock {
    pub fn new(held: impl Send + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

pub trait StorageBackend: Send + Sync {
    /// Try to take the exclusive lock on `name`. `Ok(None)` means another
    /// holder has it; the caller retries.
    fn try_lock(&self, name: &str) -> Result<Option<PartitionLock>>;

    fn load_schema(&self) -> Result<Option<Schema>>;

    fn save_schema(&self, schema: &Schema) -> Result<()>;

    fn load_partition(&self, name: &str) -> Result<Option<PartitionData>>;

    fn save_partition(&self, name: &str, data: &PartitionData) -> Result<()>;
}

/// Stores each partition as a JSON document in a directory.
///
/// Files are replaced atomically: contents are written to a temporary file
/// next to the target and renamed over it.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn partition_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read store file: {}", path.display()))?;

        let parsed = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse store file: {}", path.display()))?;

        Ok(Some(parsed))
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let contents = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write store file: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace store file: {}", path.display()))?;
        debug!(path = %path.display(), "Store file committed");
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn try_lock(&self, name: &str) -> Result<Option<PartitionLock>> {
        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        match file.try_lock_exclusive() {
            // Closing the file releases the lock
            Ok(()) => Ok(Some(PartitionLock::new(file))),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to lock: {}", path.display())),
        }
    }

    fn load_schema(&self) -> Result<Option<Schema>> {
        self.read_json(&self.dir.join(SCHEMA_FILE))
    }

    fn save_schema(&self, schema: &Schema) -> Result<()> {
        self.write_json(&self.dir.join(SCHEMA_FILE), schema)
    }

    fn load_partition(&self, name: &str) -> Result<Option<PartitionData>> {
        let file: Option<PartitionFile> = self.read_json(&self.partition_path(name))?;
        Ok(file.map(PartitionData::from))
    }

    fn save_partition(&self, name: &str, data: &PartitionData) -> Result<()> {
        self.write_json(&self.partition_path(name), &PartitionFile::from(data))
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Lock on a `MemoryBackend` partition; removes the name from the held set on drop.
struct MemoryHold {
    held: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for MemoryHold {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

/// In-memory backend for tests and ephemeral sessions.
///
/// Writes can be made to fail on demand to exercise store failure handling.
#[derive(Default)]
pub struct MemoryBackend {
    schema: Mutex<Option<Schema>>,
    partitions: Mutex<HashMap<String, PartitionData>>,
    held: Arc<Mutex<HashSet<String>>>,
    fail_writes: AtomicBool,
    failing_partitions: Mutex<HashSet<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make saves of one partition fail (or succeed again), leaving the others writable.
    pub fn set_fail_partition(&self, name: &str, fail: bool) {
        let mut failing = self
            .failing_partitions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if fail {
            failing.insert(name.to_string());
        } else {
            failing.remove(name);
        }
    }

    /// Number of records persisted for a partition.
    pub fn persisted_len(&self, name: &str) -> usize {
        self.partitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(PartitionData::len)
            .unwrap_or(0)
    }

    fn check_writable(&self, name: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("Injected write failure");
        }
        if self
            .failing_partitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
        {
            anyhow::bail!("Injected write failure on {}", name);
        }
        Ok(())
    }
}

impl StorageBackend for MemoryBackend {
    fn try_lock(&self, name: &str) -> Result<Option<PartitionLock>> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(name.to_string()) {
            return Ok(None);
        }
        Ok(Some(PartitionLock::new(MemoryHold {
            held: self.held.clone(),
            name: name.to_string(),
        })))
    }

    fn load_schema(&self) -> Result<Option<Schema>> {
        Ok(self.schema.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save_schema(&self, schema: &Schema) -> Result<()> {
        self.check_writable(SCHEMA_FILE)?;
        *self.schema.lock().unwrap_or_else(|e| e.into_inner()) = Some(schema.clone());
        Ok(())
    }

    fn load_partition(&self, name: &str) -> Result<Option<PartitionData>> {
        Ok(self
            .partitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned())
    }

    fn save_partition(&self, name: &str, data: &PartitionData) -> Result<()> {
        self.check_writable(name)?;
        self.partitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), data.clone());
        Ok(())
    }
}
