use crate::{
    constants::{DEFAULT_APPLY_TIMEOUT, DEFAULT_MAX_HISTORY},
    error::Result,
    helm::{
        apply::KubeApplier,
        chart::ChartProvider,
        client::HelmClient,
        release::{ChartSpec, Release},
        repo::RepoEntry,
        storage::SecretsDriver,
    },
    kube::{
        client::{build_client, ClusterIdentity},
        discovery::CachedDiscoveryClient,
        mapper::ShortcutExpander,
    },
    settings::Settings,
    values::{parse_params, Values},
};
use std::{collections::HashMap, sync::Arc};
use tracing::info;

/// The cluster an operation targets and the Namespace of its releases.
#[derive(Clone, Debug, Default)]
pub struct ClusterTarget {
    /// API server address, overrides the kubeconfig's. Empty keeps the kubeconfig's.
    pub api_server: String,
    /// TLS server name, overrides the kubeconfig's. Empty keeps the kubeconfig's.
    pub api_server_name: String,
    /// Encoded kubeconfig document. Empty selects the default kubeconfig file.
    pub kubeconfig: Vec<u8>,
    pub namespace: String,
}

impl ClusterTarget {
    fn identity(&self) -> Result<ClusterIdentity> {
        ClusterIdentity::builder()
            .with_server_address(&self.api_server)
            .with_tls_server_name(&self.api_server_name)
            .with_raw_kubeconfig(self.kubeconfig.clone())
            .with_namespace(&self.namespace)
            .build()
    }
}

/// Build a HelmClient for the releases in the target Namespace. Releases are stored in Secrets.
/// Without a chart provider only the read-only operations work.
pub async fn helm_client(
    target: &ClusterTarget,
    charts: Option<Arc<dyn ChartProvider>>,
) -> Result<HelmClient> {
    let identity = target.identity()?;
    let (client, descriptor) = build_client(&identity).await?;

    let settings = Settings::default();
    let discovery = Arc::new(CachedDiscoveryClient::for_descriptor(
        &descriptor,
        &settings,
    )?);
    let mapper = Arc::new(ShortcutExpander::new(discovery));

    let mut builder = HelmClient::builder()
        .with_namespace(identity.namespace())
        .with_store(Arc::new(SecretsDriver::new(
            client.clone(),
            identity.namespace(),
        )))
        .with_applier(Arc::new(KubeApplier::new(client, mapper)))
        .with_settings(settings);
    if let Some(charts) = charts {
        builder = builder.with_chart_provider(charts);
    }
    builder.build()
}

/// The ChartSpec used by the functions of this module: CRDs are applied on upgrade too, the
/// previous values are reused, and the call waits for the release to become ready.
fn release_spec<N, C>(release_name: N, chart_name: C, namespace: &str, values: Values) -> ChartSpec
where
    N: ToString,
    C: ToString,
{
    ChartSpec {
        release_name: release_name.to_string(),
        chart_name: chart_name.to_string(),
        namespace: namespace.to_string(),
        values,
        upgrade_crds: true,
        reuse_values: true,
        wait: true,
        timeout: DEFAULT_APPLY_TIMEOUT,
        max_history: DEFAULT_MAX_HISTORY,
        ..Default::default()
    }
}

/// Register 'repository' and install or upgrade 'release_name' from its chart 'chart_name'. The
/// values overlay is the override expression under the 'set' key of 'params', which is compiled
/// before the cluster is contacted.
pub async fn install_or_upgrade_chart(
    target: &ClusterTarget,
    charts: Arc<dyn ChartProvider>,
    repository: RepoEntry,
    release_name: &str,
    chart_name: &str,
    chart_version: &str,
    params: &HashMap<String, String>,
) -> Result<Release> {
    let values = parse_params(params)?;
    let client = helm_client(target, Some(charts)).await?;

    let mut spec = release_spec(
        release_name,
        format!("{}/{}", repository.name, chart_name),
        client.namespace(),
        values,
    );
    spec.version = chart_version.to_string();
    install_with(&client, repository, &spec).await
}

async fn install_with(
    client: &HelmClient,
    repository: RepoEntry,
    spec: &ChartSpec,
) -> Result<Release> {
    client.add_or_update_chart_repo(repository).await?;
    let release = client.install_or_upgrade(spec).await?;
    info!(
        release = %release.name,
        namespace = %release.namespace,
        revision = release.version,
        "Release is deployed"
    );
    Ok(release)
}

/// Roll 'release_name' back to its previous revision.
pub async fn rollback_release(target: &ClusterTarget, release_name: &str) -> Result<()> {
    let client = helm_client(target, None).await?;
    let spec = release_spec(release_name, "", client.namespace(), Values::new());
    client.rollback(&spec).await
}

/// The deployed releases of the target Namespace.
pub async fn get_release_list(target: &ClusterTarget) -> Result<Vec<Release>> {
    helm_client(target, None).await?.list_deployed().await
}

/// The latest revision of 'release_name'.
pub async fn get_release(target: &ClusterTarget, release_name: &str) -> Result<Release> {
    helm_client(target, None)
        .await?
        .get_release(release_name)
        .await
}

/// The values of 'release_name', either those the operator supplied or with 'all' the effective
/// ones.
pub async fn get_release_values(
    target: &ClusterTarget,
    release_name: &str,
    all: bool,
) -> Result<Values> {
    helm_client(target, None)
        .await?
        .get_release_values(release_name, all)
        .await
}

#[cfg(test)]
mod tests {
    use super::{helm_client, install_or_upgrade_chart, install_with, release_spec, ClusterTarget};
    use crate::{
        constants::{DEFAULT_APPLY_TIMEOUT, DEFAULT_MAX_HISTORY},
        error::{Error, ErrorKind},
        helm::{
            chart::ChartProvider,
            client::HelmClient,
            repo::RepoEntry,
            storage::MemoryDriver,
            testing::{FakeApplier, FakeCharts},
        },
        settings::Settings,
        values::parse,
    };
    use serde_json::json;
    use std::{
        collections::HashMap,
        sync::{atomic::Ordering, Arc},
    };

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: kind
clusters:
- name: kind
  cluster:
    server: https://10.0.0.1:6443
    insecure-skip-tls-verify: true
contexts:
- name: kind
  context:
    cluster: kind
    user: admin
users:
- name: admin
  user:
    token: abc123
"#;

    fn target(kubeconfig: &str) -> ClusterTarget {
        ClusterTarget {
            api_server: "https://127.0.0.1:6443".to_string(),
            kubeconfig: kubeconfig.as_bytes().to_vec(),
            namespace: "apps".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_override_expression_checked_first() {
        let charts: Arc<dyn ChartProvider> = Arc::new(FakeCharts::default());
        // The kubeconfig is unusable: an expression error means the expression was compiled
        // before the cluster client was built.
        let broken = target("{not yaml");
        let repository = RepoEntry::new("stable", "https://charts.example.com");

        let error = install_or_upgrade_chart(
            &broken,
            charts.clone(),
            repository.clone(),
            "demo",
            "web",
            "",
            &HashMap::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(error, Error::MissingOverrideExpression { .. }), "{error}");
        assert_eq!(error.kind(), ErrorKind::Config);

        let params = HashMap::from([("set".to_string(), "image.tag=v2,{".to_string())]);
        let error = install_or_upgrade_chart(
            &broken, charts, repository, "demo", "web", "", &params,
        )
        .await
        .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Parse);
    }

    #[tokio::test]
    async fn test_helm_client_is_offline() {
        let client = helm_client(&target(KUBECONFIG), None).await.unwrap();
        assert_eq!(client.namespace(), "apps");
        assert_eq!(client.settings(), &Settings::default());

        let mut other = target(KUBECONFIG);
        other.namespace = String::new();
        let error = helm_client(&other, None).await.err().unwrap();
        assert_eq!(error.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_release_spec() {
        let spec = release_spec("demo", "stable/web", "apps", parse("a=1").unwrap());
        assert!(spec.upgrade_crds && spec.reuse_values && spec.wait);
        assert_eq!(spec.timeout, DEFAULT_APPLY_TIMEOUT);
        assert_eq!(spec.max_history, DEFAULT_MAX_HISTORY);
        assert_eq!(spec.namespace, "apps");
    }

    #[tokio::test]
    async fn test_install_with_reused_values() {
        let root = tempfile::tempdir().unwrap();
        let charts = Arc::new(FakeCharts::default());
        let applier = Arc::new(FakeApplier::default());
        let client = HelmClient::builder()
            .with_namespace("apps")
            .with_store(Arc::new(MemoryDriver::new("apps")))
            .with_applier(applier.clone())
            .with_chart_provider(charts.clone())
            .with_settings(Settings::rooted_at(root.path()))
            .build()
            .unwrap();
        let repository = RepoEntry::new("stable", "https://charts.example.com");

        let spec = release_spec("demo", "stable/web", "apps", parse("image.tag=v2").unwrap());
        let release = install_with(&client, repository.clone(), &spec)
            .await
            .unwrap();
        assert_eq!(release.version, 1);

        let spec = release_spec("demo", "stable/web", "apps", parse("replicas=3").unwrap());
        let release = install_with(&client, repository, &spec).await.unwrap();
        assert_eq!(release.version, 2);
        assert_eq!(
            serde_json::Value::Object(release.config),
            json!({"image": {"tag": "v2"}, "replicas": 3})
        );
        // CRDs go along with the upgrade too.
        assert_eq!(applier.crds.load(Ordering::SeqCst), 2);
        assert_eq!(charts.indexed.lock().unwrap().len(), 2);
    }
}
