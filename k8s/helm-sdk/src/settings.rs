use crate::constants::{
    DISCOVERY_CACHE_DIR, DISCOVERY_CACHE_TTL, REPOSITORY_CACHE, REPOSITORY_CONFIG,
};
use std::{path::PathBuf, time::Duration};

/// Filesystem locations and cache lifetimes shared by the clients of this crate.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Registry file of chart repositories.
    pub repository_config: PathBuf,
    /// Directory of downloaded repository indexes and charts.
    pub repository_cache: PathBuf,
    /// Parent directory of the per-cluster discovery caches.
    pub discovery_cache: PathBuf,
    /// Age after which a cached API catalog is refetched.
    pub discovery_ttl: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repository_config: PathBuf::from(REPOSITORY_CONFIG),
            repository_cache: PathBuf::from(REPOSITORY_CACHE),
            discovery_cache: PathBuf::from(DISCOVERY_CACHE_DIR),
            discovery_ttl: DISCOVERY_CACHE_TTL,
        }
    }
}

impl Settings {
    /// Settings with every path rooted under 'root'. Keeps independent clients, tests included,
    /// from sharing state.
    pub fn rooted_at<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        Self {
            repository_config: root.join(".helmrepo"),
            repository_cache: root.join(".helmcache"),
            discovery_cache: root.join(".helmcache").join("discovery"),
            discovery_ttl: DISCOVERY_CACHE_TTL,
        }
    }
}
