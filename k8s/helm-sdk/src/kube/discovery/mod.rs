use crate::{error::Result, kube::client::ConnectionDescriptor, settings::Settings};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, warn};

mod catalog;
mod store;

pub use catalog::{
    ApiCatalog, CatalogFetcher, GroupVersionResources, KubeCatalogFetcher, ResourceInfo,
};
pub use store::{CacheEntry, CacheStore, Clock, FsCacheStore, MemoryCacheStore, SystemClock};

/// The cache directory of the cluster at 'host' under 'parent'. The scheme is dropped so that
/// http and https addresses of one server share a cache, and anything but ASCII alphanumerics,
/// '_', '.' and '/' becomes '_'. Path segments made up of dots only are neutralized, the result
/// never escapes 'parent'.
pub fn discovery_cache_dir<P: AsRef<Path>>(parent: P, host: &str) -> PathBuf {
    let schemeless = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);

    let safe: String = schemeless
        .chars()
        .map(|c| match c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/') {
            true => c,
            false => '_',
        })
        .collect();

    let mut dir = parent.as_ref().to_path_buf();
    for segment in safe.split('/').filter(|segment| !segment.is_empty()) {
        match segment.chars().all(|c| c == '.') {
            true => dir.push(segment.replace('.', "_")),
            false => dir.push(segment),
        }
    }
    dir
}

/// A discovery client which serves the API catalog from a shared cache while the cached copy is
/// younger than the TTL, and refetches it from the cluster otherwise.
pub struct CachedDiscoveryClient {
    fetcher: Arc<dyn CatalogFetcher>,
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    cache_dir: PathBuf,
    ttl: Duration,
    fresh: AtomicBool,
    invalidated: AtomicBool,
}

impl CachedDiscoveryClient {
    /// Create a client for the cluster the 'fetcher' talks to, caching under 'parent'.
    pub fn new(
        fetcher: Arc<dyn CatalogFetcher>,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        parent: &Path,
        ttl: Duration,
    ) -> Self {
        let cache_dir = discovery_cache_dir(parent, fetcher.host());
        Self {
            fetcher,
            store,
            clock,
            cache_dir,
            ttl,
            fresh: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
        }
    }

    /// Create a client for the cluster of 'descriptor' which caches on the filesystem, as
    /// configured by 'settings'.
    pub fn for_descriptor(descriptor: &ConnectionDescriptor, settings: &Settings) -> Result<Self> {
        let descriptor = descriptor.for_discovery();
        let fetcher = KubeCatalogFetcher::new(descriptor.client()?, descriptor.host());
        Ok(Self::new(
            Arc::new(fetcher),
            Arc::new(FsCacheStore),
            Arc::new(SystemClock),
            settings.discovery_cache.as_path(),
            settings.discovery_ttl,
        ))
    }

    /// The directory this client caches in.
    pub fn cache_dir(&self) -> &Path {
        self.cache_dir.as_path()
    }

    /// The API catalog of the cluster.
    pub async fn server_resources(&self) -> Result<ApiCatalog> {
        if !self.invalidated.load(Ordering::SeqCst) {
            if let Some(entry) = self.cached() {
                debug!(
                    cache = %self.cache_dir.display(),
                    fetched_at = %entry.fetched_at,
                    "Serving API catalog from the discovery cache"
                );
                return Ok(entry.catalog);
            }
        }

        let catalog = self.fetcher.fetch().await?;
        let entry = CacheEntry {
            fetched_at: self.clock.now(),
            catalog,
        };
        if let Err(error) = self.store.save(&self.cache_dir, &entry) {
            warn!(
                %error,
                cache = %self.cache_dir.display(),
                "Failed to write the discovery cache"
            );
        }

        self.fresh.store(true, Ordering::SeqCst);
        self.invalidated.store(false, Ordering::SeqCst);
        Ok(entry.catalog)
    }

    /// Whether this client has fetched the catalog live since it was created or last invalidated.
    pub fn fresh(&self) -> bool {
        self.fresh.load(Ordering::SeqCst)
    }

    /// Make the next read bypass the cache.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        self.fresh.store(false, Ordering::SeqCst);
    }

    fn cached(&self) -> Option<CacheEntry> {
        let entry = match self.store.load(&self.cache_dir) {
            Ok(entry) => entry?,
            Err(error) => {
                warn!(%error, "Ignoring unreadable discovery cache entry");
                return None;
            }
        };
        match (self.clock.now() - entry.fetched_at).to_std() {
            Ok(age) if age < self.ttl => Some(entry),
            _ => None,
        }
    }
}
