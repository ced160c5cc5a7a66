//! Durable local cache on top of LMDB.
//!
//! Every public operation here is best-effort: a store that failed to open,
//! a full map or a corrupt record is logged and then behaves like an empty
//! cache. Nothing in this module talks to the network.

use std::path::Path;
use std::sync::Arc;

use lmdb::{Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::app_error::{SyncError, SyncResult};
use crate::cache_entry::{CacheEntry, ClearSignal, QueueItem, StoredEntry};
use crate::clock::Clock;
use crate::config::SyncConfig;

const ENTRIES_DB: &str = "cache_entries";
const QUEUE_DB: &str = "sync_queue";
const META_DB: &str = "meta";
const QUEUE_RECORD: &str = "pending";
const CLEAR_SIGNAL_RECORD: &str = "last_clear_signal";

struct LmdbStore {
    env: Environment,
    entries: Database,
    queue: Database,
    meta: Database,
}

impl LmdbStore {
    fn open(path: &Path, map_size: usize) -> SyncResult<Self> {
        std::fs::create_dir_all(path)?;

        let env = Environment::new()
            .set_max_dbs(3)
            .set_map_size(map_size)
            .open(path)?;

        let entries = env.create_db(Some(ENTRIES_DB), DatabaseFlags::empty())?;
        let queue = env.create_db(Some(QUEUE_DB), DatabaseFlags::empty())?;
        let meta = env.create_db(Some(META_DB), DatabaseFlags::empty())?;

        Ok(Self {
            env,
            entries,
            queue,
            meta,
        })
    }

    fn put(&self, db: Database, key: &str, bytes: &[u8]) -> SyncResult<()> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(db, &key, &bytes, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    fn get(&self, db: Database, key: &str) -> SyncResult<Option<Vec<u8>>> {
        let txn = self.env.begin_ro_txn()?;
        let found = match txn.get(db, &key) {
            Ok(bytes) => Some(bytes.to_vec()),
            Err(lmdb::Error::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        txn.abort();
        Ok(found)
    }

    /// Returns whether something was removed.
    fn delete(&self, db: Database, key: &str) -> SyncResult<bool> {
        let mut txn = self.env.begin_rw_txn()?;
        let removed = match txn.del(db, &key, None) {
            Ok(()) => true,
            Err(lmdb::Error::NotFound) => false,
            Err(e) => return Err(e.into()),
        };
        txn.commit()?;
        Ok(removed)
    }
}

/// Per-key, versioned, timestamped local mirror of application state.
pub struct LocalCache {
    store: RwLock<Option<LmdbStore>>,
    key_prefix: String,
    version: u32,
    max_age_millis: i64,
    clock: Arc<dyn Clock>,
}

impl LocalCache {
    /// Opens the LMDB environment at `config.storage_path`.
    ///
    /// Never fails: when the store cannot be opened a warning is logged and
    /// the cache runs in unavailable mode, where writes are no-ops and reads
    /// are absent.
    pub fn open(config: &SyncConfig, clock: Arc<dyn Clock>) -> Self {
        let path = config.storage_path.as_path();
        let store = match LmdbStore::open(path, config.map_size_bytes()) {
            Ok(store) => {
                info!("Local cache opened at {}", path.display());
                Some(store)
            }
            Err(e) => {
                warn!("Local cache unavailable at {}: {e}", path.display());
                None
            }
        };

        Self {
            store: RwLock::new(store),
            key_prefix: config.key_prefix.clone(),
            version: config.cache_version,
            max_age_millis: config.max_age_millis(),
            clock,
        }
    }

    /// A cache with no durable backing at all.
    pub fn unavailable(config: &SyncConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: RwLock::new(None),
            key_prefix: config.key_prefix.clone(),
            version: config.cache_version,
            max_age_millis: config.max_age_millis(),
            clock,
        }
    }

    pub fn is_available(&self) -> bool {
        self.store.read().is_some()
    }

    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Stores `{value, savedAt: now, version}` for `key`.
    pub fn write<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(e) = self.try_write(key, value) {
            warn!("Local cache write for '{key}' dropped: {e}");
        }
    }

    fn try_write<T: Serialize>(&self, key: &str, value: &T) -> SyncResult<()> {
        let entry = StoredEntry {
            value: serde_json::to_value(value)?,
            saved_at: self.clock.now_millis(),
            version: self.version,
        };
        let bytes = serde_json::to_vec(&entry)?;

        let guard = self.store.read();
        let store = guard.as_ref().ok_or_else(Self::unavailable_error)?;
        store.put(store.entries, &self.storage_key(key), &bytes)
    }

    /// Returns the value of `key` if a fresh entry exists.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.read_entry(key).map(|entry| entry.value)
    }

    pub fn read_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        match self.try_read(key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Local cache read for '{key}' treated as absent: {e}");
                None
            }
        }
    }

    fn try_read<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<CacheEntry<T>>> {
        let guard = self.store.read();
        let Some(store) = guard.as_ref() else {
            return Ok(None);
        };
        let Some(bytes) = store.get(store.entries, &self.storage_key(key))? else {
            return Ok(None);
        };
        drop(guard);

        let stored: StoredEntry = serde_json::from_slice(&bytes)?;
        if !stored.is_fresh(self.clock.now_millis(), self.max_age_millis, self.version) {
            debug!(
                "Local cache entry '{key}' is stale (version {}, saved at {})",
                stored.version, stored.saved_at
            );
            return Ok(None);
        }

        Ok(Some(CacheEntry {
            key: key.to_string(),
            value: serde_json::from_value(stored.value)?,
            version: stored.version,
            saved_at: stored.saved_at,
        }))
    }

    /// Removes the entry for `key`. Clearing an absent key is a no-op.
    pub fn clear(&self, key: &str) {
        let guard = self.store.read();
        let Some(store) = guard.as_ref() else {
            return;
        };
        match store.delete(store.entries, &self.storage_key(key)) {
            Ok(true) => debug!("Local cache entry '{key}' cleared"),
            Ok(false) => {}
            Err(e) => warn!("Local cache clear for '{key}' failed: {e}"),
        }
    }

    pub fn write_clear_signal(&self, signal: &ClearSignal) {
        let result = serde_json::to_vec(signal)
            .map_err(SyncError::from)
            .and_then(|bytes| {
                let guard = self.store.read();
                let store = guard.as_ref().ok_or_else(Self::unavailable_error)?;
                store.put(store.meta, CLEAR_SIGNAL_RECORD, &bytes)
            });
        if let Err(e) = result {
            warn!("Clear signal not persisted: {e}");
        }
    }

    pub fn last_clear_signal(&self) -> Option<ClearSignal> {
        let guard = self.store.read();
        let store = guard.as_ref()?;
        match store.get(store.meta, CLEAR_SIGNAL_RECORD) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes)
                .map_err(|e| warn!("Unreadable clear signal: {e}"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("Clear signal read failed: {e}");
                None
            }
        }
    }

    /// Replaces the persisted snapshot of the sync queue.
    pub(crate) fn save_queue(&self, items: &[QueueItem]) {
        let result = serde_json::to_vec(items)
            .map_err(SyncError::from)
            .and_then(|bytes| {
                let guard = self.store.read();
                let Some(store) = guard.as_ref() else {
                    return Ok(());
                };
                store.put(store.queue, QUEUE_RECORD, &bytes)
            });
        if let Err(e) = result {
            warn!("Sync queue snapshot not persisted: {e}");
        }
    }

    pub(crate) fn load_queue(&self) -> Vec<QueueItem> {
        let guard = self.store.read();
        let Some(store) = guard.as_ref() else {
            return Vec::new();
        };
        match store.get(store.queue, QUEUE_RECORD) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Discarding unreadable sync queue snapshot: {e}");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Sync queue snapshot read failed: {e}");
                Vec::new()
            }
        }
    }

    /// Drops the LMDB environment. The cache stays usable in unavailable mode.
    pub fn close(&self) {
        if self.store.write().take().is_some() {
            info!("Local cache closed");
        }
    }

    fn unavailable_error() -> SyncError {
        SyncError::DatabaseError("local store is unavailable".to_string())
    }
}
