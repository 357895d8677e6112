use crate::{
    error::{Error, NoKindMatch, NoResourceMatch, Result},
    kube::discovery::{ApiCatalog, CachedDiscoveryClient},
};
use async_trait::async_trait;
use kube::core::{ApiResource, GroupVersionKind};
use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};
use tokio::sync::OnceCell;
use tracing::debug;

/// Abbreviations resolved when the cluster's catalog doesn't advertise them itself.
const BUILTIN_SHORTCUTS: &[(&str, &str)] = &[
    ("cj", "cronjobs"),
    ("cm", "configmaps"),
    ("crd", "customresourcedefinitions"),
    ("crds", "customresourcedefinitions"),
    ("csr", "certificatesigningrequests"),
    ("deploy", "deployments"),
    ("ds", "daemonsets"),
    ("ep", "endpoints"),
    ("ev", "events"),
    ("hpa", "horizontalpodautoscalers"),
    ("ing", "ingresses"),
    ("limits", "limitranges"),
    ("netpol", "networkpolicies"),
    ("no", "nodes"),
    ("ns", "namespaces"),
    ("pdb", "poddisruptionbudgets"),
    ("po", "pods"),
    ("pv", "persistentvolumes"),
    ("pvc", "persistentvolumeclaims"),
    ("quota", "resourcequotas"),
    ("rc", "replicationcontrollers"),
    ("rs", "replicasets"),
    ("sa", "serviceaccounts"),
    ("sc", "storageclasses"),
    ("sts", "statefulsets"),
    ("svc", "services"),
];

/// How to address the objects of a kind.
#[derive(Clone, Debug)]
pub struct RestMapping {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// Resolves resource names to kinds, and kinds to the REST resources serving them.
#[async_trait]
pub trait RestMapper: Send + Sync {
    /// The kind served under 'resource', given as `name`, `name.group` or `name.version.group`.
    /// Kind names are accepted in place of resource names.
    async fn kind_for(&self, resource: &str) -> Result<GroupVersionKind>;

    /// The REST resource serving 'gvk'. An empty version selects the group's preferred one.
    async fn resource_for(&self, gvk: &GroupVersionKind) -> Result<RestMapping>;

    /// Drop what is known about the cluster, so that newly registered kinds are picked up.
    fn reset(&self);
}

/// A resource argument split into its parts.
#[derive(Clone, Debug, PartialEq)]
struct ResourceQuery {
    name: String,
    version: Option<String>,
    group: Option<String>,
}

impl ResourceQuery {
    fn parse(resource: &str) -> Self {
        let resource = resource.trim().to_ascii_lowercase();
        let (name, rest) = match resource.split_once('.') {
            Some((name, rest)) => (name.to_string(), Some(rest)),
            None => (resource.clone(), None),
        };

        let (version, group) = match rest {
            None => (None, None),
            Some(rest) => match rest.split_once('.') {
                Some((version, group)) if is_version(version) => {
                    (Some(version.to_string()), Some(group.to_string()))
                }
                _ => (None, Some(rest.to_string())),
            },
        };

        Self {
            name,
            version,
            group,
        }
    }

    fn matches(&self, group: &str, version: &str) -> bool {
        self.group.as_deref().map_or(true, |g| g == group)
            && self.version.as_deref().map_or(true, |v| v == version)
    }
}

impl fmt::Display for ResourceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(version) = &self.version {
            write!(f, ".{version}")?;
        }
        if let Some(group) = &self.group {
            write!(f, ".{group}")?;
        }
        Ok(())
    }
}

/// Versions look like 'v1', 'v1beta1', 'v2alpha3'.
fn is_version(segment: &str) -> bool {
    let mut chars = segment.chars();
    chars.next() == Some('v') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

fn find_kind(catalog: &ApiCatalog, resource: &str) -> Result<GroupVersionKind> {
    let query = ResourceQuery::parse(resource);
    catalog
        .resources()
        .filter(|(group, _)| query.matches(&group.group, &group.version))
        .filter(|(_, info)| {
            info.name == query.name
                || info.singular_name == query.name
                || info.kind.to_ascii_lowercase() == query.name
        })
        // Preferred versions first, then the core group over named ones.
        .min_by_key(|(group, _)| (!group.preferred, !group.group.is_empty()))
        .map(|(group, info)| GroupVersionKind::gvk(&group.group, &group.version, &info.kind))
        .ok_or_else(|| {
            NoResourceMatch {
                resource: resource.to_string(),
            }
            .build()
        })
}

fn find_mapping(catalog: &ApiCatalog, gvk: &GroupVersionKind) -> Result<RestMapping> {
    catalog
        .resources()
        .find(|(group, info)| {
            group.group == gvk.group
                && info.kind == gvk.kind
                && match gvk.version.is_empty() {
                    true => group.preferred,
                    false => group.version == gvk.version,
                }
        })
        .map(|(group, info)| RestMapping {
            resource: ApiResource {
                group: group.group.clone(),
                version: group.version.clone(),
                api_version: group.api_version(),
                kind: info.kind.clone(),
                plural: info.name.clone(),
            },
            namespaced: info.namespaced,
        })
        .ok_or_else(|| {
            NoKindMatch {
                kind: gvk.kind.clone(),
                api_version: match gvk.group.is_empty() {
                    true => gvk.version.clone(),
                    false => format!("{}/{}", gvk.group, gvk.version),
                },
            }
            .build()
        })
}

/// A RestMapper which loads the API catalog on first use rather than on construction. When a
/// lookup misses and the catalog came from the cache, the cache is dropped and the lookup is
/// retried once against a live catalog.
pub struct DeferredMapper {
    discovery: Arc<CachedDiscoveryClient>,
    catalog: RwLock<Arc<OnceCell<Arc<ApiCatalog>>>>,
}

impl DeferredMapper {
    /// Create a mapper on top of 'discovery'. No request is made.
    pub fn new(discovery: Arc<CachedDiscoveryClient>) -> Self {
        Self {
            discovery,
            catalog: RwLock::new(Arc::new(OnceCell::new())),
        }
    }

    async fn catalog(&self) -> Result<Arc<ApiCatalog>> {
        let cell = self
            .catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let catalog = cell
            .get_or_try_init(|| async {
                self.discovery.server_resources().await.map(Arc::new)
            })
            .await?;
        Ok(catalog.clone())
    }

    async fn lookup<T, F>(&self, find: F) -> Result<T>
    where
        F: Fn(&ApiCatalog) -> Result<T> + Send + Sync,
        T: Send,
    {
        let catalog = self.catalog().await?;
        match find(catalog.as_ref()) {
            Err(error @ (Error::NoResourceMatch { .. } | Error::NoKindMatch { .. }))
                if !self.discovery.fresh() =>
            {
                debug!(%error, "Lookup missed on a cached API catalog, refetching");
                self.reset();
                let catalog = self.catalog().await?;
                find(catalog.as_ref())
            }
            result => result,
        }
    }
}

#[async_trait]
impl RestMapper for DeferredMapper {
    async fn kind_for(&self, resource: &str) -> Result<GroupVersionKind> {
        self.lookup(|catalog| find_kind(catalog, resource)).await
    }

    async fn resource_for(&self, gvk: &GroupVersionKind) -> Result<RestMapping> {
        self.lookup(|catalog| find_mapping(catalog, gvk)).await
    }

    fn reset(&self) {
        self.discovery.invalidate();
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(OnceCell::new());
    }
}

/// A RestMapper which expands abbreviations such as 'deploy' or 'svc' before delegating. The
/// short names the cluster advertises take precedence over the builtin ones.
pub struct ShortcutExpander {
    delegate: DeferredMapper,
}

impl ShortcutExpander {
    /// Create an expander in front of a DeferredMapper over 'discovery'.
    pub fn new(discovery: Arc<CachedDiscoveryClient>) -> Self {
        Self {
            delegate: DeferredMapper::new(discovery),
        }
    }

    /// The fully spelled out form of 'resource', against the catalog the mapper holds. Unknown
    /// names are returned unchanged.
    pub async fn expand(&self, resource: &str) -> Result<String> {
        let mut query = ResourceQuery::parse(resource);
        let catalog = self.delegate.catalog().await?;

        let advertised = catalog.resources().find(|(group, info)| {
            query.matches(&group.group, &group.version)
                && info.short_names.iter().any(|short| *short == query.name)
        });
        if let Some((group, info)) = advertised {
            query.name = info.name.clone();
            if query.group.is_none() && !group.group.is_empty() {
                query.group = Some(group.group.clone());
            }
            return Ok(query.to_string());
        }

        if let Some((_, full)) = BUILTIN_SHORTCUTS
            .iter()
            .find(|(short, _)| *short == query.name)
        {
            query.name = full.to_string();
        }
        Ok(query.to_string())
    }
}

#[async_trait]
impl RestMapper for ShortcutExpander {
    async fn kind_for(&self, resource: &str) -> Result<GroupVersionKind> {
        let expanded = self.expand(resource).await?;
        self.delegate.kind_for(&expanded).await
    }

    async fn resource_for(&self, gvk: &GroupVersionKind) -> Result<RestMapping> {
        self.delegate.resource_for(gvk).await
    }

    fn reset(&self) {
        self.delegate.reset()
    }
}
