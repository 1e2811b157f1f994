//! Key-value storage backing the tracker.
//!
//! Two flavours are used side by side: a *durable* store that survives host
//! restarts (session record, global properties, carried-over events) and a
//! *volatile* store whose contents die with the process (session liveness
//! markers, stopwatch entries).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use beacon_core::error::{TrackerError, TrackerResult};

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> TrackerResult<()>;
    fn remove(&self, key: &str) -> TrackerResult<()>;
    fn keys(&self) -> Vec<String>;
}

/// Lock-free in-process store. Used as volatile storage, and as durable
/// storage in tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: &str) -> TrackerResult<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> TrackerResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

/// Durable store persisted as a single JSON object on disk.
///
/// Every mutation rewrites the file through a temporary sibling and a rename,
/// so a crash mid-write leaves the previous contents intact.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`. An unreadable or corrupt
    /// file is treated as empty.
    pub fn open(path: impl AsRef<Path>) -> TrackerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt store file, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(TrackerError::Io(e)),
        };
        debug!(path = %path.display(), keys = entries.len(), "file store opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_through(&self, entries: &BTreeMap<String, String>) -> TrackerResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string(entries)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            TrackerError::Storage(format!("failed to replace {}: {e}", self.path.display()))
        })
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> TrackerResult<()> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());
        self.write_through(&entries)
    }

    fn remove(&self, key: &str) -> TrackerResult<()> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.write_through(&entries)?;
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get("k").is_none());
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").as_deref(), Some("v"));
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").as_deref(), Some("v2"));
        store.remove("k").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("beacon.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.set("a", "1").unwrap();
            store.set("b", "2").unwrap();
            store.remove("a").unwrap();
        }

        let reopened = FileStore::open(&path).unwrap();
        assert!(reopened.get("a").is_none());
        assert_eq!(reopened.get("b").as_deref(), Some("2"));
        assert_eq!(reopened.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn test_file_store_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FileStore::open(&path).unwrap();
        assert!(store.keys().is_empty());
        store.set("k", "v").unwrap();
        assert_eq!(FileStore::open(&path).unwrap().get("k").as_deref(), Some("v"));
    }
}
