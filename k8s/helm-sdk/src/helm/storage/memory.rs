use super::ReleaseStore;
use crate::{
    error::{ReleaseExists, ReleaseRevisionNotFound, Result},
    helm::release::Release,
};
use async_trait::async_trait;
use snafu::ensure;
use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
};

/// Keeps releases in process memory.
#[derive(Debug)]
pub struct MemoryDriver {
    namespace: String,
    records: Mutex<BTreeMap<(String, u32), Release>>,
}

impl MemoryDriver {
    pub fn new<T: ToString>(namespace: T) -> Self {
        Self {
            namespace: namespace.to_string(),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, u32), Release>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ReleaseStore for MemoryDriver {
    async fn history(&self, name: &str) -> Result<Vec<Release>> {
        Ok(self
            .records()
            .values()
            .filter(|release| release.name == name)
            .cloned()
            .collect())
    }

    async fn list(&self) -> Result<Vec<Release>> {
        Ok(self.records().values().cloned().collect())
    }

    async fn create(&self, release: &Release) -> Result<()> {
        let mut records = self.records();
        let key = (release.name.clone(), release.version);
        ensure!(
            !records.contains_key(&key),
            ReleaseExists {
                name: &release.name,
                namespace: &self.namespace,
                version: release.version,
            }
        );
        records.insert(key, release.clone());
        Ok(())
    }

    async fn update(&self, release: &Release) -> Result<()> {
        let mut records = self.records();
        let key = (release.name.clone(), release.version);
        ensure!(
            records.contains_key(&key),
            ReleaseRevisionNotFound {
                name: &release.name,
                namespace: &self.namespace,
                version: release.version,
            }
        );
        records.insert(key, release.clone());
        Ok(())
    }

    async fn delete(&self, name: &str, version: u32) -> Result<()> {
        let removed = self.records().remove(&(name.to_string(), version));
        ensure!(
            removed.is_some(),
            ReleaseRevisionNotFound {
                name,
                namespace: &self.namespace,
                version,
            }
        );
        Ok(())
    }
}
