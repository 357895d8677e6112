use super::catalog::ApiCatalog;
use crate::{
    constants::DISCOVERY_CACHE_FILE,
    error::{DiscoveryCacheIo, DiscoveryCacheSerde, Result},
    file::write_atomically,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

/// A cached API catalog and the time it was fetched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub fetched_at: DateTime<Utc>,
    pub catalog: ApiCatalog,
}

/// Persistence for discovery cache entries, keyed by the cache directory of a cluster.
pub trait CacheStore: Send + Sync {
    /// Read the entry under 'key', None if there is none.
    fn load(&self, key: &Path) -> Result<Option<CacheEntry>>;

    /// Replace the entry under 'key'.
    fn save(&self, key: &Path, entry: &CacheEntry) -> Result<()>;
}

/// Stores each entry as JSON in a file inside the key's directory. Entries are replaced with an
/// atomic rename, so processes sharing the directory never read a partial entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsCacheStore;

impl FsCacheStore {
    fn file(key: &Path) -> PathBuf {
        key.join(DISCOVERY_CACHE_FILE)
    }
}

impl CacheStore for FsCacheStore {
    fn load(&self, key: &Path) -> Result<Option<CacheEntry>> {
        let path = Self::file(key);
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error).context(DiscoveryCacheIo { path }),
        };
        let entry = serde_json::from_slice(&buf).context(DiscoveryCacheSerde { path })?;
        Ok(Some(entry))
    }

    fn save(&self, key: &Path, entry: &CacheEntry) -> Result<()> {
        let path = Self::file(key);
        let buf = serde_json::to_vec(entry).context(DiscoveryCacheSerde { path: &path })?;
        write_atomically(path, &buf)
    }
}

/// Keeps entries in process memory.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl CacheStore for MemoryCacheStore {
    fn load(&self, key: &Path) -> Result<Option<CacheEntry>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &Path, entry: &CacheEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_path_buf(), entry.clone());
        Ok(())
    }
}

/// Source of the current time, for cache expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system's wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
