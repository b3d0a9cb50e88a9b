//! Durable checkpoints of the dictionary.
//!
//! A snapshot holds every element record (add timestamp, add value and
//! remove timestamp), not only the visible projection, so that last-write-wins
//! resolution keeps working for writes that arrive after a restart.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::crdt::types::system_millis;
use crate::crdt::{Element, LwwDictionary, Timestamp};
use crate::error::StoreError;

/// Current on-disk format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// How far ahead of the system clock a stored timestamp may be before the
/// snapshot is treated as corrupt.
pub const MAX_CLOCK_SKEW_MILLIS: u64 = 24 * 60 * 60 * 1000;

/// Serialized state of the dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub elements: BTreeMap<String, Element<Value>>,
}

impl Snapshot {
    pub fn new(elements: BTreeMap<String, Element<Value>>) -> Self {
        Snapshot {
            version: SNAPSHOT_VERSION,
            elements,
        }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    pub fn of(dictionary: &LwwDictionary<String, Value>) -> Self {
        Self::new(dictionary.elements())
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Visible key/value pairs only.
    pub fn projection(&self) -> BTreeMap<String, Value> {
        self.elements
            .iter()
            .filter_map(|(key, element)| element.value().map(|v| (key.clone(), v.clone())))
            .collect()
    }

    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.elements.values().filter_map(Element::max_timestamp).max()
    }

    pub fn into_dictionary(self) -> LwwDictionary<String, Value> {
        LwwDictionary::from_elements(self.elements)
    }
}

/// Abstract durable blob store for snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Replaces any previously saved snapshot. Errors are always returned.
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Reads the last saved snapshot, or an empty one if none exists.
    async fn load(&self) -> Result<Snapshot, StoreError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Snapshot stored as a single JSON file, replaced atomically.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Moves an unreadable snapshot aside so a fresh one can be written.
    ///
    /// Returns where the old file now lives.
    pub async fn quarantine(&self) -> Result<PathBuf, StoreError> {
        let target = self.sibling(".corrupt");
        fs::rename(&self.path, &target)
            .await
            .map_err(|e| self.io_error(&self.path, e))?;
        Ok(target)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let data = serde_json::to_vec(snapshot)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(parent, e))?;
        }

        // Write to a temporary file first, then rename over the old snapshot
        let temp_path = self.sibling(".tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| self.io_error(&temp_path, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| self.io_error(&temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| self.io_error(&temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| self.io_error(&self.path, e))?;

        debug!(
            "Saved snapshot with {} elements to {}",
            snapshot.elements.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn load(&self) -> Result<Snapshot, StoreError> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::empty()),
            Err(e) => return Err(self.io_error(&self.path, e)),
        };

        let corrupt = |reason: String| StoreError::CorruptSnapshot {
            path: self.path.clone(),
            reason,
        };
        let snapshot: Snapshot =
            serde_json::from_slice(&data).map_err(|e| corrupt(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(corrupt(format!(
                "unsupported version {}",
                snapshot.version
            )));
        }
        // The clock resumes after the newest stored timestamp, so one from the
        // far future would pin every later write behind it.
        if let Some(latest) = snapshot.max_timestamp() {
            let horizon = system_millis().saturating_add(MAX_CLOCK_SKEW_MILLIS);
            if latest.wall_millis() > horizon {
                return Err(corrupt(format!(
                    "timestamp {} is more than {} ms ahead of the system clock",
                    latest, MAX_CLOCK_SKEW_MILLIS
                )));
            }
        }
        Ok(snapshot)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-process snapshot store for tests and ephemeral servers.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshot: Mutex<Option<Snapshot>>,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::default();
        *store.snapshot.lock() = Some(snapshot);
        store
    }

    /// Makes every subsequent `save` fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The last successfully saved snapshot.
    pub fn saved(&self) -> Option<Snapshot> {
        self.snapshot.lock().clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected("memory store is failing writes".into()));
        }
        *self.snapshot.lock() = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self) -> Result<Snapshot, StoreError> {
        Ok(self.snapshot.lock().clone().unwrap_or_else(Snapshot::empty))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
