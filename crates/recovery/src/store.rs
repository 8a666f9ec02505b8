//! Persistence of action counters.
//!
//! The whole counter map is rewritten to `<cache_dir>/recovery.json` after
//! every gated decision. Writes are serialized by a file lock so concurrent
//! dumps never interleave.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::counter::ActionCounter;
use crate::error::{RecoveryError, RecoveryResult};

/// File name of the counter store inside the cache directory.
pub const FILENAME: &str = "recovery.json";

/// Action name -> counter.
pub type ActionMap = BTreeMap<String, ActionCounter>;

/// On-disk store for [`ActionMap`].
#[derive(Debug)]
pub struct ActionStore {
    path: PathBuf,
    file_lock: Mutex<()>,
}

impl ActionStore {
    /// Create a store rooted at `cache_dir`, creating the directory if needed.
    ///
    /// Failure to create the directory is logged and otherwise ignored; later
    /// dumps will fail and be logged in turn.
    pub fn new(cache_dir: &Path) -> Self {
        if !cache_dir.exists() {
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                error!(
                    "[RecoveryManager] Could not create the cache directory {}: {}",
                    cache_dir.display(),
                    e
                );
            }
        }

        Self {
            path: cache_dir.join(FILENAME),
            file_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the store with `actions`.
    pub fn dump(&self, actions: &ActionMap) -> RecoveryResult<()> {
        let _guard = self.file_lock.lock();
        let content = serde_json::to_string_pretty(actions)?;
        std::fs::write(&self.path, content).map_err(|e| RecoveryError::io(&self.path, e))?;
        debug!(path = %self.path.display(), actions = actions.len(), "Dumped recovery actions");
        Ok(())
    }

    /// Read the store. A missing file is an empty map.
    pub fn load(&self) -> RecoveryResult<ActionMap> {
        let _guard = self.file_lock.lock();
        if !self.path.is_file() {
            return Ok(ActionMap::new());
        }
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| RecoveryError::io(&self.path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Read the store, treating any failure as an empty map.
    #[must_use]
    pub fn load_or_empty(&self) -> ActionMap {
        match self.load() {
            Ok(actions) => actions,
            Err(e) => {
                warn!(
                    "Unable to load recovery actions from {}: {}",
                    self.path.display(),
                    e
                );
                ActionMap::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(lifetime_count: i64) -> ActionCounter {
        ActionCounter {
            last_attempt: 1000,
            count: 1,
            last_reset: 1000,
            lifetime_count,
            ..ActionCounter::default()
        }
    }

    #[test]
    fn test_creates_cache_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let cache_dir = tmp.path().join("nested").join("cache");
        let store = ActionStore::new(&cache_dir);
        assert!(cache_dir.is_dir());
        assert_eq!(store.path(), cache_dir.join(FILENAME));
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ActionStore::new(tmp.path());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_dump_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ActionStore::new(tmp.path());
        let mut actions = ActionMap::new();
        actions.insert("DATANODE".to_string(), counter(3));
        store.dump(&actions).unwrap();

        assert_eq!(store.load().unwrap(), actions);

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\n  \"DATANODE\": {"));
        assert!(raw.contains("\"lifetimeCount\": 3"));
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ActionStore::new(tmp.path());
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(
            store.load(),
            Err(RecoveryError::Serialization(_))
        ));
        assert!(store.load_or_empty().is_empty());
    }

    #[test]
    fn test_dump_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let not_a_dir = tmp.path().join("file");
        std::fs::write(&not_a_dir, "x").unwrap();
        let store = ActionStore::new(&not_a_dir);
        assert!(matches!(
            store.dump(&ActionMap::new()),
            Err(RecoveryError::Io { .. })
        ));
    }
}
