use crate::error::{DiscoveryFetch, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::Client;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::debug;

/// The resource types a cluster serves, grouped by API group and version.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiCatalog {
    pub groups: Vec<GroupVersionResources>,
}

impl ApiCatalog {
    /// Every served resource along with the group/version serving it, in discovery order.
    pub fn resources(&self) -> impl Iterator<Item = (&GroupVersionResources, &ResourceInfo)> {
        self.groups
            .iter()
            .flat_map(|group| group.resources.iter().map(move |resource| (group, resource)))
    }
}

/// The resources of one API group version.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionResources {
    /// API group, empty for the core group.
    pub group: String,
    pub version: String,
    /// Whether this is the preferred version of the group.
    pub preferred: bool,
    pub resources: Vec<ResourceInfo>,
}

impl GroupVersionResources {
    /// The 'apiVersion' string of objects in this group version.
    pub fn api_version(&self) -> String {
        match self.group.is_empty() {
            true => self.version.clone(),
            false => format!("{}/{}", self.group, self.version),
        }
    }

    fn from_list(group: &str, version: &str, preferred: bool, list: APIResourceList) -> Self {
        let resources = list
            .resources
            .into_iter()
            // Subresources such as 'pods/log' can't be mapped to kinds.
            .filter(|resource| !resource.name.contains('/'))
            .map(|resource| ResourceInfo {
                name: resource.name,
                singular_name: resource.singular_name,
                kind: resource.kind,
                namespaced: resource.namespaced,
                verbs: resource.verbs,
                short_names: resource.short_names.unwrap_or_default(),
            })
            .collect();

        Self {
            group: group.to_string(),
            version: version.to_string(),
            preferred,
            resources,
        }
    }
}

/// A single served resource type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// Plural resource name, e.g. 'deployments'.
    pub name: String,
    #[serde(default)]
    pub singular_name: String,
    pub kind: String,
    pub namespaced: bool,
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default)]
    pub short_names: Vec<String>,
}

/// Reads the full API catalog of a cluster.
#[async_trait]
pub trait CatalogFetcher: Send + Sync {
    /// Address of the API server, used to key the cache.
    fn host(&self) -> &str;

    /// Fetch the catalog from the API server.
    async fn fetch(&self) -> Result<ApiCatalog>;
}

/// Fetches the API catalog from the discovery endpoints of a live cluster.
pub struct KubeCatalogFetcher {
    client: Client,
    host: String,
}

impl KubeCatalogFetcher {
    /// Create a fetcher which talks to 'host' through 'client'.
    pub fn new<T: ToString>(client: Client, host: T) -> Self {
        Self {
            client,
            host: host.to_string(),
        }
    }
}

#[async_trait]
impl CatalogFetcher for KubeCatalogFetcher {
    fn host(&self) -> &str {
        self.host.as_str()
    }

    async fn fetch(&self) -> Result<ApiCatalog> {
        let mut groups = Vec::new();

        let core = self
            .client
            .list_core_api_versions()
            .await
            .context(DiscoveryFetch { host: &self.host })?;
        for (position, version) in core.versions.iter().enumerate() {
            let list = self
                .client
                .list_core_api_resources(version)
                .await
                .context(DiscoveryFetch { host: &self.host })?;
            groups.push(GroupVersionResources::from_list(
                "",
                version,
                position == 0,
                list,
            ));
        }

        let api_groups = self
            .client
            .list_api_groups()
            .await
            .context(DiscoveryFetch { host: &self.host })?;
        for group in api_groups.groups {
            let preferred = group
                .preferred_version
                .as_ref()
                .map(|preferred| preferred.version.clone());
            for (position, version) in group.versions.iter().enumerate() {
                let list = self
                    .client
                    .list_api_group_resources(&version.group_version)
                    .await
                    .context(DiscoveryFetch { host: &self.host })?;
                let is_preferred = match preferred.as_deref() {
                    Some(preferred) => preferred == version.version,
                    None => position == 0,
                };
                groups.push(GroupVersionResources::from_list(
                    &group.name,
                    &version.version,
                    is_preferred,
                    list,
                ));
            }
        }

        debug!(
            host = %self.host,
            group_versions = groups.len(),
            "Fetched API catalog"
        );
        Ok(ApiCatalog { groups })
    }
}
