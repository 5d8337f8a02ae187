//! Page snapshots in session storage, for back/forward navigation.
//!
//! Each snapshot lives under `raxm:{unix_millis}`. When the storage is full,
//! the oldest `raxm:` entry is evicted and the write retried until it fits.

use raxm_core::environment::Clock;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Key prefix of snapshot entries
pub const SNAPSHOT_PREFIX: &str = "raxm:";

/// Storage failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The write does not fit and nothing is left to evict
    #[error("Session storage quota exceeded ({needed} bytes needed, {quota} bytes quota)")]
    QuotaExceeded {
        /// Bytes the write needed
        needed: usize,
        /// Storage quota
        quota: usize,
    },

    /// The backing store is unusable
    #[error("Session storage unavailable: {0}")]
    Unavailable(String),
}

/// Key/value session storage, as a browser tab sees it.
pub trait SessionStorage: Send + Sync {
    /// Read an entry
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`] when the store cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write an entry
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::QuotaExceeded`] when the write does not fit.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete an entry; deleting a missing key is not an error
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`] when the store cannot be written.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// All keys, in any order
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`] when the store cannot be read.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// In-memory [`SessionStorage`] with a byte quota over keys and values.
#[derive(Debug, Clone)]
pub struct InMemorySessionStorage {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
    quota: usize,
}

impl InMemorySessionStorage {
    /// Storage holding at most `quota` bytes
    #[must_use]
    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            quota,
        }
    }

    /// Bytes currently used
    #[must_use]
    pub fn used(&self) -> usize {
        self.entries
            .lock()
            .map(|e| e.iter().map(|(k, v)| k.len() + v.len()).sum())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
        self.entries
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }
}

impl Default for InMemorySessionStorage {
    /// Browsers typically allow about 5 MB per origin
    fn default() -> Self {
        Self::with_quota(5 * 1024 * 1024)
    }
}

impl SessionStorage for InMemorySessionStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.lock()?;
        let others: usize = entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum();
        let needed = key.len() + value.len();
        if others + needed > self.quota {
            return Err(StorageError::QuotaExceeded {
                needed,
                quota: self.quota,
            });
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

/// Writes and reads page snapshots.
#[derive(Clone)]
pub struct SnapshotStore {
    storage: Arc<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore").finish_non_exhaustive()
    }
}

fn snapshot_timestamp(key: &str) -> Option<i64> {
    key.strip_prefix(SNAPSHOT_PREFIX)?.parse().ok()
}

impl SnapshotStore {
    /// Snapshots in `storage`, keyed by `clock`
    #[must_use]
    pub fn new(storage: Arc<dyn SessionStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Save a snapshot, evicting the oldest ones until it fits.
    ///
    /// Returns the key written.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::QuotaExceeded`] when the snapshot does not fit
    /// even with every older snapshot evicted.
    pub fn save(&self, html: &str) -> Result<String, StorageError> {
        let key = format!("{SNAPSHOT_PREFIX}{}", self.clock.now().timestamp_millis());
        loop {
            match self.storage.set(&key, html) {
                Ok(()) => {
                    tracing::debug!(%key, bytes = html.len(), "Snapshot saved");
                    return Ok(key);
                },
                Err(StorageError::QuotaExceeded { needed, quota }) => {
                    let Some(oldest) = self.oldest_except(&key)? else {
                        tracing::warn!(needed, quota, "Snapshot does not fit in session storage");
                        return Err(StorageError::QuotaExceeded { needed, quota });
                    };
                    tracing::debug!(key = %oldest, "Evicting oldest snapshot");
                    self.storage.remove(&oldest)?;
                },
                Err(other) => return Err(other),
            }
        }
    }

    /// Read a snapshot back
    ///
    /// # Errors
    ///
    /// Propagates storage read failures.
    pub fn restore(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.storage.get(key)
    }

    /// Snapshot keys, oldest first
    ///
    /// # Errors
    ///
    /// Propagates storage read failures.
    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<(i64, String)> = self
            .storage
            .keys()?
            .into_iter()
            .filter_map(|k| snapshot_timestamp(&k).map(|t| (t, k)))
            .collect();
        keys.sort();
        Ok(keys.into_iter().map(|(_, k)| k).collect())
    }

    fn oldest_except(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.keys()?.into_iter().find(|k| k != key))
    }
}
