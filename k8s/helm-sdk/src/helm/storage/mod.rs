use crate::{constants::RELEASE_SECRET_PREFIX, error::Result, helm::release::Release};
use async_trait::async_trait;

mod memory;
mod secrets;

pub use memory::MemoryDriver;
pub use secrets::SecretsDriver;

/// Persistence of release revisions. A store is scoped to one namespace.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Every stored revision of the release 'name', in no particular order.
    async fn history(&self, name: &str) -> Result<Vec<Release>>;

    /// Every stored revision of every release, in no particular order.
    async fn list(&self) -> Result<Vec<Release>>;

    /// Store a new revision. Fails if the revision already exists.
    async fn create(&self, release: &Release) -> Result<()>;

    /// Replace a stored revision.
    async fn update(&self, release: &Release) -> Result<()>;

    /// Remove a stored revision.
    async fn delete(&self, name: &str, version: u32) -> Result<()>;
}

/// The name of the record holding revision 'version' of release 'name'.
pub(crate) fn record_name(name: &str, version: u32) -> String {
    format!("{RELEASE_SECRET_PREFIX}.{name}.v{version}")
}

/// The revision of each release with the highest revision number.
pub(crate) fn latest_revisions(releases: Vec<Release>) -> Vec<Release> {
    let mut latest: std::collections::BTreeMap<String, Release> = Default::default();
    for release in releases {
        match latest.get(&release.name) {
            Some(existing) if existing.version >= release.version => {}
            _ => {
                latest.insert(release.name.clone(), release);
            }
        }
    }
    latest.into_values().collect()
}
