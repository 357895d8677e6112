use crate::{
    error::{BackendError, InvalidChartRef, Result},
    helm::repo::RepoEntry,
    values::Values,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::ensure;

/// This struct is used to deserialize a chart's Chart.yaml.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    /// This is the name of the chart.
    pub name: String,
    /// This is the version of the chart.
    pub version: String,
    /// This is the version of the application the chart deploys.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A named YAML document: a template, a CRD or a rendered manifest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub content: String,
}

impl Manifest {
    pub fn new<N: ToString, C: ToString>(name: N, content: C) -> Self {
        Self {
            name: name.to_string(),
            content: content.to_string(),
        }
    }
}

/// A loaded chart. The template language is opaque to this crate, the ChartProvider renders it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub metadata: ChartMetadata,
    /// The chart's default values.
    #[serde(default)]
    pub values: Values,
    #[serde(default)]
    pub templates: Vec<Manifest>,
    /// CustomResourceDefinitions shipped with the chart, applied ahead of the templates.
    #[serde(default)]
    pub crds: Vec<Manifest>,
}

impl Chart {
    /// This is a getter for the chart name.
    pub fn name(&self) -> &str {
        self.metadata.name.as_str()
    }

    /// This is a getter for the chart version.
    pub fn version(&self) -> &str {
        self.metadata.version.as_str()
    }
}

/// A repository-qualified chart reference, e.g. 'bitnami/nginx'.
#[derive(Clone, Debug, PartialEq)]
pub struct ChartRef {
    pub repository: String,
    pub chart: String,
}

impl ChartRef {
    /// Split a chart reference into repository and chart names.
    pub fn parse(reference: &str) -> Result<Self> {
        let (repository, chart) = reference.split_once('/').unwrap_or_default();
        ensure!(
            !repository.is_empty() && !chart.is_empty() && !chart.contains('/'),
            InvalidChartRef { chart: reference }
        );
        Ok(Self {
            repository: repository.to_string(),
            chart: chart.to_string(),
        })
    }
}

/// What a chart is rendered against.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderContext {
    pub release_name: String,
    pub namespace: String,
    pub revision: u32,
    pub is_install: bool,
    /// The effective values: the release's config coalesced over the chart defaults.
    pub values: Values,
}

/// The chart format and template engine. Implementations fetch repository indexes and charts into
/// the repository cache and render templates.
#[async_trait]
pub trait ChartProvider: Send + Sync {
    /// Download the index of 'repository'. Fails if the repository can't be reached.
    async fn update_index(&self, repository: &RepoEntry) -> Result<(), BackendError>;

    /// Load 'chart' from 'repository'. An empty 'version' selects the latest one.
    async fn load(
        &self,
        repository: &RepoEntry,
        chart: &str,
        version: &str,
    ) -> Result<Chart, BackendError>;

    /// Render the chart's templates into Kubernetes manifests.
    async fn render(
        &self,
        chart: &Chart,
        context: &RenderContext,
    ) -> Result<Vec<Manifest>, BackendError>;
}
