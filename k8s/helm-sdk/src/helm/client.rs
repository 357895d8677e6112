use crate::{
    error::{
        ChartLoad, ChartProviderAbsent, ChartRender, HelmClientBuilder as BuilderError,
        InvalidChartSpec, InvalidRepoEntry, NoPriorRevision, ReleaseNotFound, RepoIndexUpdate,
        RepoNotRegistered, Result, WaitTimeout,
    },
    helm::{
        apply::{AppliedObject, ResourceApplier},
        chart::{Chart, ChartProvider, ChartRef, Manifest, RenderContext},
        release::{ChartSpec, Info, Release, Status},
        repo::{RepoEntry, RepoFile},
        storage::{latest_revisions, ReleaseStore},
    },
    settings::Settings,
    values::{coalesce, merge, Values},
};
use chrono::Utc;
use snafu::{ensure, OptionExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The kind of change a new release revision makes.
#[derive(Clone, Copy, Debug)]
enum Operation {
    Install,
    Upgrade,
    Rollback(u32),
}

impl Operation {
    fn completed(&self) -> String {
        match self {
            Operation::Install => "Install complete".to_string(),
            Operation::Upgrade => "Upgrade complete".to_string(),
            Operation::Rollback(target) => format!("Rollback to {target}"),
        }
    }

    fn failed<E: std::fmt::Display>(&self, error: E) -> String {
        match self {
            Operation::Install => format!("Install failed: {error}"),
            Operation::Upgrade => format!("Upgrade failed: {error}"),
            Operation::Rollback(target) => format!("Rollback to {target} failed: {error}"),
        }
    }
}

/// This is a builder for HelmClient.
#[derive(Default)]
pub struct HelmClientBuilder {
    namespace: Option<String>,
    store: Option<Arc<dyn ReleaseStore>>,
    applier: Option<Arc<dyn ResourceApplier>>,
    charts: Option<Arc<dyn ChartProvider>>,
    settings: Option<Settings>,
}

impl HelmClientBuilder {
    /// This is a builder option to add the Namespace of the releases. This is mandatory.
    #[must_use]
    pub fn with_namespace<T>(mut self, namespace: T) -> Self
    where
        T: ToString,
    {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// This is a builder option to add the release storage backend. This is mandatory.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ReleaseStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// This is a builder option to add what writes manifests to the cluster. This is mandatory.
    #[must_use]
    pub fn with_applier(mut self, applier: Arc<dyn ResourceApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    /// This is a builder option to add the chart loader and renderer. Without one, only the
    /// read-only operations work.
    #[must_use]
    pub fn with_chart_provider(mut self, charts: Arc<dyn ChartProvider>) -> Self {
        self.charts = Some(charts);
        self
    }

    /// This is a builder option to override the default file locations.
    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Build the HelmClient.
    pub fn build(self) -> Result<HelmClient> {
        let namespace = self
            .namespace
            .filter(|namespace| !namespace.is_empty())
            .context(BuilderError {
                component: "namespace",
            })?;
        let store = self.store.context(BuilderError {
            component: "release store",
        })?;
        let applier = self.applier.context(BuilderError {
            component: "resource applier",
        })?;

        Ok(HelmClient {
            namespace,
            store,
            applier,
            charts: self.charts,
            settings: self.settings.unwrap_or_default(),
        })
    }
}

/// This type installs, upgrades, rolls back and inspects the releases of one namespace.
#[derive(Clone)]
pub struct HelmClient {
    namespace: String,
    store: Arc<dyn ReleaseStore>,
    applier: Arc<dyn ResourceApplier>,
    charts: Option<Arc<dyn ChartProvider>>,
    settings: Settings,
}

impl HelmClient {
    /// This creates an empty builder.
    pub fn builder() -> HelmClientBuilder {
        HelmClientBuilder::default()
    }

    /// This is a getter for the namespace of the releases.
    pub fn namespace(&self) -> &str {
        self.namespace.as_str()
    }

    /// This is a getter for the file locations.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn charts(&self) -> Result<&Arc<dyn ChartProvider>> {
        self.charts.as_ref().context(ChartProviderAbsent)
    }

    /// Add a chart repository to the registry, or replace the one with the same name. The
    /// repository's index is fetched first, an unreachable repository is not recorded.
    pub async fn add_or_update_chart_repo(&self, entry: RepoEntry) -> Result<()> {
        ensure!(
            !entry.name.is_empty() && !entry.url.is_empty(),
            InvalidRepoEntry {
                reason: "name and url are required"
            }
        );

        self.charts()?
            .update_index(&entry)
            .await
            .map_err(|source| {
                RepoIndexUpdate {
                    source,
                    name: &entry.name,
                    url: &entry.url,
                }
                .build()
            })?;

        let path = self.settings.repository_config.as_path();
        let mut registry = RepoFile::load(path)?;
        let name = entry.name.clone();
        let replaced = registry.update(entry);
        registry.generated = Utc::now();
        registry.write(path)?;

        info!(repository = %name, replaced, "Registered chart repository");
        Ok(())
    }

    /// Install the release of 'spec' if it doesn't exist yet, or upgrade it.
    pub async fn install_or_upgrade(&self, spec: &ChartSpec) -> Result<Release> {
        self.validate(spec)?;
        let chart = self.load_chart(spec).await?;

        let mut history = self.store.history(&spec.release_name).await?;
        history.sort_by_key(|release| release.version);

        match history.last() {
            None => self.install(spec, chart).await,
            Some(_) => self.upgrade(spec, chart, &history).await,
        }
    }

    async fn install(&self, spec: &ChartSpec, chart: Chart) -> Result<Release> {
        let config = spec.values.clone();
        let manifests = self.render(&chart, &spec.release_name, 1, true, &config).await?;

        let now = Utc::now();
        let mut release = Release {
            name: spec.release_name.clone(),
            namespace: self.namespace.clone(),
            version: 1,
            info: Info {
                first_deployed: now,
                last_deployed: now,
                status: Status::PendingInstall,
                description: "Initial install underway".to_string(),
            },
            chart,
            config,
            manifests,
        };
        self.store.create(&release).await?;
        self.prune(&release.name, spec.max_history).await?;
        info!(
            release = %release.name,
            namespace = %self.namespace,
            chart = %release.chart.name(),
            version = %release.chart.version(),
            "Installing release"
        );

        // A fresh install always brings its CRDs.
        let outcome = self.execute(&release, None, spec, true).await;
        self.conclude(&mut release, outcome, &[], spec, Operation::Install)
            .await?;
        Ok(release)
    }

    async fn upgrade(&self, spec: &ChartSpec, chart: Chart, history: &[Release]) -> Result<Release> {
        let Some(current) = history.last() else {
            return ReleaseNotFound {
                name: &spec.release_name,
                namespace: &self.namespace,
            }
            .fail();
        };
        let last_deployed = history
            .iter()
            .rev()
            .find(|release| release.status() == Status::Deployed);

        let config = match (spec.reuse_values, last_deployed) {
            (true, Some(base)) => merge(&base.config, &spec.values),
            (true, None) => merge(&current.config, &spec.values),
            (false, _) => spec.values.clone(),
        };

        if let Some(deployed) = last_deployed {
            if deployed.version == current.version && deployed.same_deployment(&chart, &config) {
                info!(
                    release = %deployed.name,
                    namespace = %self.namespace,
                    revision = deployed.version,
                    "Release is up to date, nothing to upgrade"
                );
                return Ok(deployed.clone());
            }
        }

        let version = current.version + 1;
        let manifests = self
            .render(&chart, &spec.release_name, version, false, &config)
            .await?;

        let mut release = Release {
            name: spec.release_name.clone(),
            namespace: self.namespace.clone(),
            version,
            info: Info {
                first_deployed: current.info.first_deployed,
                last_deployed: Utc::now(),
                status: Status::PendingUpgrade,
                description: "Preparing upgrade".to_string(),
            },
            chart,
            config,
            manifests,
        };
        self.store.create(&release).await?;
        self.prune(&release.name, spec.max_history).await?;
        info!(
            release = %release.name,
            namespace = %self.namespace,
            revision = version,
            "Upgrading release"
        );

        let previous = last_deployed.unwrap_or(current);
        let outcome = self
            .execute(&release, Some(previous), spec, spec.upgrade_crds)
            .await;
        self.conclude(&mut release, outcome, history, spec, Operation::Upgrade)
            .await?;
        Ok(release)
    }

    /// Roll the release of 'spec' back to the revision preceding its latest one. The rollback is
    /// recorded as a new revision.
    pub async fn rollback(&self, spec: &ChartSpec) -> Result<()> {
        self.validate(spec)?;

        let mut history = self.store.history(&spec.release_name).await?;
        history.sort_by_key(|release| release.version);
        let current = history.last().context(ReleaseNotFound {
            name: &spec.release_name,
            namespace: &self.namespace,
        })?;

        let target_version = current.version.saturating_sub(1);
        let target = history
            .iter()
            .find(|release| target_version > 0 && release.version == target_version)
            .context(NoPriorRevision {
                name: &spec.release_name,
                namespace: &self.namespace,
                revision: target_version,
            })?;

        let operation = Operation::Rollback(target_version);
        let mut release = Release {
            name: spec.release_name.clone(),
            namespace: self.namespace.clone(),
            version: current.version + 1,
            info: Info {
                first_deployed: current.info.first_deployed,
                last_deployed: Utc::now(),
                status: Status::PendingRollback,
                description: operation.completed(),
            },
            chart: target.chart.clone(),
            config: target.config.clone(),
            manifests: target.manifests.clone(),
        };
        self.store.create(&release).await?;
        self.prune(&release.name, spec.max_history).await?;
        info!(
            release = %release.name,
            namespace = %self.namespace,
            from = current.version,
            to = target_version,
            "Rolling back release"
        );

        let previous = history
            .iter()
            .rev()
            .find(|release| release.status() == Status::Deployed)
            .unwrap_or(current);
        let outcome = self
            .execute(&release, Some(previous), spec, spec.upgrade_crds)
            .await;
        self.conclude(&mut release, outcome, &history, spec, operation)
            .await
    }

    /// The latest revision of every release whose latest revision is deployed, in no particular
    /// order.
    pub async fn list_deployed(&self) -> Result<Vec<Release>> {
        let releases = self.store.list().await?;
        Ok(latest_revisions(releases)
            .into_iter()
            .filter(|release| release.status() == Status::Deployed)
            .collect())
    }

    /// The latest revision of the release 'name'.
    pub async fn get_release(&self, name: &str) -> Result<Release> {
        self.store
            .history(name)
            .await?
            .into_iter()
            .max_by_key(|release| release.version)
            .context(ReleaseNotFound {
                name,
                namespace: &self.namespace,
            })
    }

    /// The values of the latest revision of the release 'name': the values the operator supplied,
    /// or with 'all' the effective values, the operator's values coalesced over the chart
    /// defaults.
    pub async fn get_release_values(&self, name: &str, all: bool) -> Result<Values> {
        let release = self.get_release(name).await?;
        Ok(match all {
            true => coalesce(&release.chart.values, &release.config),
            false => release.config,
        })
    }

    fn validate(&self, spec: &ChartSpec) -> Result<()> {
        ensure!(
            !spec.release_name.is_empty(),
            InvalidChartSpec {
                reason: "release name is required"
            }
        );
        ensure!(
            spec.namespace.is_empty() || spec.namespace == self.namespace,
            InvalidChartSpec {
                reason: format!(
                    "namespace '{}' differs from the client's namespace '{}'",
                    spec.namespace, self.namespace
                )
            }
        );
        Ok(())
    }

    async fn load_chart(&self, spec: &ChartSpec) -> Result<Chart> {
        let charts = self.charts()?;
        let reference = ChartRef::parse(&spec.chart_name)?;
        let registry = RepoFile::load(self.settings.repository_config.as_path())?;
        let repository = registry
            .get(&reference.repository)
            .context(RepoNotRegistered {
                name: &reference.repository,
            })?;

        let chart = charts
            .load(repository, &reference.chart, &spec.version)
            .await
            .map_err(|source| {
                ChartLoad {
                    source,
                    chart: &spec.chart_name,
                    version: &spec.version,
                }
                .build()
            })?;
        debug!(chart = %chart.name(), version = %chart.version(), "Loaded chart");
        Ok(chart)
    }

    async fn render(
        &self,
        chart: &Chart,
        release_name: &str,
        revision: u32,
        is_install: bool,
        config: &Values,
    ) -> Result<Vec<Manifest>> {
        let context = RenderContext {
            release_name: release_name.to_string(),
            namespace: self.namespace.clone(),
            revision,
            is_install,
            values: coalesce(&chart.values, config),
        };
        self.charts()?
            .render(chart, &context)
            .await
            .map_err(|source| {
                ChartRender {
                    source,
                    chart: chart.name(),
                    release: release_name,
                }
                .build()
            })
    }

    /// Write the objects of 'release' to the cluster, delete those of 'previous' it no longer
    /// renders and, if asked to, wait for them.
    async fn execute(
        &self,
        release: &Release,
        previous: Option<&Release>,
        spec: &ChartSpec,
        with_crds: bool,
    ) -> Result<()> {
        if with_crds && !release.chart.crds.is_empty() {
            self.applier.install_crds(&release.chart.crds).await?;
        }

        let applied = self
            .applier
            .apply(&self.namespace, &release.manifests)
            .await?;
        if let Some(previous) = previous {
            self.remove_stale(previous, &applied).await?;
        }

        if spec.wait {
            tokio::time::timeout(spec.timeout, self.applier.wait_ready(&applied))
                .await
                .map_err(|_| {
                    WaitTimeout {
                        name: &release.name,
                        namespace: &self.namespace,
                        timeout: spec.timeout,
                    }
                    .build()
                })??;
        }
        Ok(())
    }

    /// Delete the objects of 'previous' which aren't among 'applied'.
    async fn remove_stale(&self, previous: &Release, applied: &[AppliedObject]) -> Result<()> {
        let stale: Vec<AppliedObject> = self
            .applier
            .identify(&self.namespace, &previous.manifests)
            .await?
            .into_iter()
            .filter(|object| !applied.iter().any(|kept| kept.is_same_object(object)))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        info!(
            release = %previous.name,
            namespace = %self.namespace,
            revision = previous.version,
            count = stale.len(),
            "Deleting objects the release no longer renders"
        );
        self.applier.delete(&stale).await
    }

    /// Record the outcome of an apply. A failed revision is marked failed and the error returned,
    /// the revisions before it are left alone. A successful one supersedes the deployed revisions
    /// in 'history', and the history is pruned.
    async fn conclude(
        &self,
        release: &mut Release,
        outcome: Result<()>,
        history: &[Release],
        spec: &ChartSpec,
        operation: Operation,
    ) -> Result<()> {
        if let Err(error) = outcome {
            release.set_status(Status::Failed, operation.failed(&error));
            if let Err(store_error) = self.store.update(release).await {
                warn!(
                    error = %store_error,
                    release = %release.name,
                    revision = release.version,
                    "Failed to record failed release"
                );
            }
            return Err(error);
        }

        release.info.last_deployed = Utc::now();
        release.set_status(Status::Deployed, operation.completed());
        self.store.update(release).await?;

        for previous in history
            .iter()
            .filter(|previous| previous.status() == Status::Deployed)
        {
            let mut superseded = previous.clone();
            superseded.set_status(Status::Superseded, "Superseded");
            self.store.update(&superseded).await?;
        }

        info!(
            release = %release.name,
            namespace = %self.namespace,
            revision = release.version,
            "Release deployed"
        );
        self.prune(&release.name, spec.max_history).await
    }

    /// Delete the oldest revisions of 'name' beyond 'max_history', whatever their status. The
    /// newest revision and the latest deployed one are always kept.
    async fn prune(&self, name: &str, max_history: usize) -> Result<()> {
        let mut history = self.store.history(name).await?;
        if max_history == 0 || history.len() <= max_history {
            return Ok(());
        }
        history.sort_by_key(|release| release.version);

        let newest = history.last().map(|release| release.version);
        let last_deployed = history
            .iter()
            .rev()
            .find(|release| release.status() == Status::Deployed)
            .map(|release| release.version);
        let excess = history.len() - max_history;

        let doomed: Vec<u32> = history
            .iter()
            .map(|release| release.version)
            .filter(|version| Some(*version) != newest && Some(*version) != last_deployed)
            .take(excess)
            .collect();
        for version in doomed {
            self.store.delete(name, version).await?;
            debug!(release = %name, revision = version, "Pruned release revision");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::HelmClient;
    use crate::{
        error::ErrorKind,
        helm::{
            release::{ChartSpec, Status},
            repo::{RepoEntry, RepoFile},
            storage::{MemoryDriver, ReleaseStore},
            testing::{FakeApplier, FakeCharts},
        },
        settings::Settings,
        values::Values,
    };
    use serde_json::{json, Value};
    use std::{
        sync::{atomic::Ordering, Arc},
        time::Duration,
    };
    use tempfile::TempDir;

    struct Fixture {
        client: HelmClient,
        charts: Arc<FakeCharts>,
        applier: Arc<FakeApplier>,
        store: Arc<MemoryDriver>,
        _root: TempDir,
    }

    async fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let charts = Arc::new(FakeCharts::default());
        let applier = Arc::new(FakeApplier::default());
        let store = Arc::new(MemoryDriver::new("apps"));
        let client = HelmClient::builder()
            .with_namespace("apps")
            .with_store(store.clone())
            .with_applier(applier.clone())
            .with_chart_provider(charts.clone())
            .with_settings(Settings::rooted_at(root.path()))
            .build()
            .unwrap();
        client
            .add_or_update_chart_repo(RepoEntry::new("stable", "https://charts.example.com"))
            .await
            .unwrap();

        Fixture {
            client,
            charts,
            applier,
            store,
            _root: root,
        }
    }

    fn values(value: Value) -> Values {
        value.as_object().cloned().unwrap()
    }

    fn spec(release: &str, overlay: Value) -> ChartSpec {
        ChartSpec {
            release_name: release.to_string(),
            chart_name: "stable/web".to_string(),
            version: "2.0.0".to_string(),
            values: values(overlay),
            ..Default::default()
        }
    }

    async fn statuses(store: &MemoryDriver, name: &str) -> Vec<(u32, Status)> {
        let mut history: Vec<(u32, Status)> = store
            .history(name)
            .await
            .unwrap()
            .iter()
            .map(|release| (release.version, release.status()))
            .collect();
        history.sort_by_key(|(version, _)| *version);
        history
    }

    #[tokio::test]
    async fn test_install_then_upgrade() {
        let fixture = fixture().await;

        let release = fixture
            .client
            .install_or_upgrade(&spec("demo", json!({})))
            .await
            .unwrap();
        assert_eq!(release.version, 1);
        assert_eq!(release.status(), Status::Deployed);
        assert_eq!(release.namespace, "apps");
        assert_eq!(fixture.applier.crds.load(Ordering::SeqCst), 1);

        let release = fixture
            .client
            .install_or_upgrade(&spec("demo", json!({"image": {"tag": "v2"}})))
            .await
            .unwrap();
        assert_eq!(release.version, 2);
        // CRDs are only applied on install unless asked for.
        assert_eq!(fixture.applier.crds.load(Ordering::SeqCst), 1);
        assert_eq!(
            statuses(&fixture.store, "demo").await,
            vec![(1, Status::Superseded), (2, Status::Deployed)]
        );

        // Same chart, same values: nothing to do.
        let release = fixture
            .client
            .install_or_upgrade(&spec("demo", json!({"image": {"tag": "v2"}})))
            .await
            .unwrap();
        assert_eq!(release.version, 2);
        assert_eq!(fixture.charts.renders.load(Ordering::SeqCst), 2);
        assert_eq!(statuses(&fixture.store, "demo").await.len(), 2);

        let mut with_crds = spec("demo", json!({"replicas": 3}));
        with_crds.upgrade_crds = true;
        fixture.client.install_or_upgrade(&with_crds).await.unwrap();
        assert_eq!(fixture.applier.crds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reuse_values() {
        let fixture = fixture().await;
        fixture
            .client
            .install_or_upgrade(&spec("demo", json!({"image": {"tag": "v2"}})))
            .await
            .unwrap();

        let mut reuse = spec("demo", json!({"replicas": 2}));
        reuse.reuse_values = true;
        let release = fixture.client.install_or_upgrade(&reuse).await.unwrap();
        assert_eq!(
            release.config,
            values(json!({"image": {"tag": "v2"}, "replicas": 2}))
        );

        let release = fixture
            .client
            .install_or_upgrade(&spec("demo", json!({"replicas": 2})))
            .await
            .unwrap();
        assert_eq!(release.config, values(json!({"replicas": 2})));
    }

    #[tokio::test]
    async fn test_release_values() {
        let fixture = fixture().await;
        fixture
            .client
            .install_or_upgrade(&spec("demo", json!({"image": {"tag": "v2"}})))
            .await
            .unwrap();

        let user = fixture
            .client
            .get_release_values("demo", false)
            .await
            .unwrap();
        assert_eq!(user, values(json!({"image": {"tag": "v2"}})));

        let all = fixture.client.get_release_values("demo", true).await.unwrap();
        assert_eq!(
            all,
            values(json!({
                "image": {"repository": "nginx", "tag": "v2"},
                "replicas": 1,
                "service": {"port": 80}
            }))
        );

        let error = fixture
            .client
            .get_release_values("absent", true)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_rollback() {
        let fixture = fixture().await;
        fixture
            .client
            .install_or_upgrade(&spec("demo", json!({})))
            .await
            .unwrap();

        // A single revision has nothing to roll back to.
        let error = fixture
            .client
            .rollback(&spec("demo", json!({})))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);

        let before = fixture.client.get_release_values("demo", true).await.unwrap();
        fixture
            .client
            .install_or_upgrade(&spec("demo", json!({"image": {"tag": "v2"}})))
            .await
            .unwrap();
        assert_ne!(
            fixture.client.get_release_values("demo", true).await.unwrap(),
            before
        );
        fixture
            .client
            .rollback(&spec("demo", json!({})))
            .await
            .unwrap();

        let release = fixture.client.get_release("demo").await.unwrap();
        assert_eq!(release.version, 3);
        assert_eq!(release.status(), Status::Deployed);
        assert_eq!(release.info.description, "Rollback to 1");
        assert!(release.config.is_empty());
        assert_eq!(
            fixture.client.get_release_values("demo", true).await.unwrap(),
            before
        );
        assert_eq!(
            statuses(&fixture.store, "demo").await,
            vec![
                (1, Status::Superseded),
                (2, Status::Superseded),
                (3, Status::Deployed)
            ]
        );

        // Rolling back again restores revision 2.
        fixture
            .client
            .rollback(&spec("demo", json!({})))
            .await
            .unwrap();
        let user = fixture
            .client
            .get_release_values("demo", false)
            .await
            .unwrap();
        assert_eq!(user, values(json!({"image": {"tag": "v2"}})));

        let error = fixture
            .client
            .rollback(&spec("absent", json!({})))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_history_is_pruned() {
        let fixture = fixture().await;
        for replicas in 1..5 {
            let mut spec = spec("demo", json!({"replicas": replicas}));
            spec.max_history = 2;
            fixture.client.install_or_upgrade(&spec).await.unwrap();
        }
        assert_eq!(
            statuses(&fixture.store, "demo").await,
            vec![(3, Status::Superseded), (4, Status::Deployed)]
        );
    }

    #[tokio::test]
    async fn test_failed_revisions_are_pruned() {
        let fixture = fixture().await;
        let mut install = spec("demo", json!({}));
        install.max_history = 3;
        fixture.client.install_or_upgrade(&install).await.unwrap();

        fixture.applier.reject.store(true, Ordering::SeqCst);
        for replicas in 2..11 {
            let mut upgrade = spec("demo", json!({"replicas": replicas}));
            upgrade.max_history = 3;
            fixture
                .client
                .install_or_upgrade(&upgrade)
                .await
                .unwrap_err();
        }
        // The deployed revision survives however many upgrades fail after it.
        assert_eq!(
            statuses(&fixture.store, "demo").await,
            vec![(1, Status::Deployed), (9, Status::Failed), (10, Status::Failed)]
        );
    }

    #[tokio::test]
    async fn test_stale_objects_are_deleted() {
        let fixture = fixture().await;
        let worker = "web/templates/worker.yaml".to_string();
        let deleted = || fixture.applier.deleted.lock().unwrap().clone();

        fixture
            .client
            .install_or_upgrade(&spec("demo", json!({})))
            .await
            .unwrap();
        fixture
            .client
            .install_or_upgrade(&spec("demo", json!({"worker": true})))
            .await
            .unwrap();
        assert!(deleted().is_empty());

        // Revision 1 has no worker, rolling back to it removes the worker.
        fixture
            .client
            .rollback(&spec("demo", json!({})))
            .await
            .unwrap();
        assert_eq!(deleted(), vec![worker.clone()]);

        fixture
            .client
            .install_or_upgrade(&spec("demo", json!({"worker": true})))
            .await
            .unwrap();
        assert_eq!(deleted().len(), 1);
        fixture
            .client
            .install_or_upgrade(&spec("demo", json!({"worker": false})))
            .await
            .unwrap();
        assert_eq!(deleted(), vec![worker.clone(), worker]);
    }

    #[tokio::test]
    async fn test_failed_apply() {
        let fixture = fixture().await;
        fixture.applier.ready.store(false, Ordering::SeqCst);

        let mut waiting = spec("demo", json!({}));
        waiting.wait = true;
        waiting.timeout = Duration::from_millis(50);
        let error = fixture
            .client
            .install_or_upgrade(&waiting)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Apply);

        let release = fixture.client.get_release("demo").await.unwrap();
        assert_eq!(release.status(), Status::Failed);
        assert!(release.info.description.starts_with("Install failed"));

        // A retry upgrades over the failed revision, which stays failed.
        fixture.applier.ready.store(true, Ordering::SeqCst);
        let release = fixture.client.install_or_upgrade(&waiting).await.unwrap();
        assert_eq!(release.version, 2);
        assert_eq!(
            statuses(&fixture.store, "demo").await,
            vec![(1, Status::Failed), (2, Status::Deployed)]
        );

        fixture.applier.reject.store(true, Ordering::SeqCst);
        let error = fixture
            .client
            .install_or_upgrade(&spec("demo", json!({"replicas": 2})))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Apply);
        assert_eq!(
            statuses(&fixture.store, "demo").await,
            vec![(1, Status::Failed), (2, Status::Deployed), (3, Status::Failed)]
        );
    }

    #[tokio::test]
    async fn test_list_deployed() {
        let fixture = fixture().await;
        fixture
            .client
            .install_or_upgrade(&spec("demo", json!({})))
            .await
            .unwrap();
        fixture
            .client
            .install_or_upgrade(&spec("demo", json!({"replicas": 2})))
            .await
            .unwrap();

        fixture.applier.reject.store(true, Ordering::SeqCst);
        fixture
            .client
            .install_or_upgrade(&spec("broken", json!({})))
            .await
            .unwrap_err();

        let deployed = fixture.client.list_deployed().await.unwrap();
        assert_eq!(deployed.len(), 1);
        assert_eq!(deployed[0].name, "demo");
        assert_eq!(deployed[0].version, 2);
    }

    #[tokio::test]
    async fn test_chart_resolution_errors() {
        let fixture = fixture().await;

        let mut unregistered = spec("demo", json!({}));
        unregistered.chart_name = "missing/web".to_string();
        let error = fixture
            .client
            .install_or_upgrade(&unregistered)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);

        let mut unknown_chart = spec("demo", json!({}));
        unknown_chart.chart_name = "stable/nope".to_string();
        let error = fixture
            .client
            .install_or_upgrade(&unknown_chart)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Apply);

        let mut elsewhere = spec("demo", json!({}));
        elsewhere.namespace = "other".to_string();
        let error = fixture
            .client
            .install_or_upgrade(&elsewhere)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Config);

        assert!(statuses(&fixture.store, "demo").await.is_empty());
    }

    #[tokio::test]
    async fn test_repository_registry() {
        let fixture = fixture().await;
        let path = fixture.client.settings().repository_config.clone();

        fixture
            .client
            .add_or_update_chart_repo(RepoEntry::new("stable", "https://mirror.example.com"))
            .await
            .unwrap();
        let registry = RepoFile::load(&path).unwrap();
        assert_eq!(registry.repositories.len(), 1);
        assert_eq!(
            registry.get("stable").unwrap().url,
            "https://mirror.example.com"
        );

        fixture.charts.unreachable.store(true, Ordering::SeqCst);
        let error = fixture
            .client
            .add_or_update_chart_repo(RepoEntry::new("broken", "https://down.example.com"))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Repository);
        assert!(RepoFile::load(&path).unwrap().get("broken").is_none());

        let error = fixture
            .client
            .add_or_update_chart_repo(RepoEntry::new("", "https://charts.example.com"))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Repository);
        assert_eq!(
            *fixture.charts.indexed.lock().unwrap(),
            vec!["stable".to_string(), "stable".to_string()]
        );
    }

    #[tokio::test]
    async fn test_builder() {
        let store = Arc::new(MemoryDriver::new("apps"));
        let applier = Arc::new(FakeApplier::default());

        let error = HelmClient::builder()
            .with_store(store.clone())
            .with_applier(applier.clone())
            .build()
            .err()
            .unwrap();
        assert_eq!(error.kind(), ErrorKind::Config);

        let error = HelmClient::builder()
            .with_namespace("apps")
            .with_applier(applier.clone())
            .build()
            .err()
            .unwrap();
        assert_eq!(error.kind(), ErrorKind::Config);

        // Without a chart provider only the read-only operations work.
        let client = HelmClient::builder()
            .with_namespace("apps")
            .with_store(store)
            .with_applier(applier)
            .build()
            .unwrap();
        assert!(client.list_deployed().await.unwrap().is_empty());
        let error = client
            .install_or_upgrade(&spec("demo", json!({})))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Config);
    }
}
