use snafu::Snafu;
use std::{path::PathBuf, time::Duration};

/// Errors returned by the black-box collaborators (chart provider and the like).
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// The broad classes of failure a caller may want to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing cluster identity input, builder misuse or missing parameters.
    Config,
    /// Malformed value override expression.
    Parse,
    /// Failure while installing, upgrading or rolling back a release.
    Apply,
    /// A release, revision, chart source or resource does not exist.
    NotFound,
    /// The API catalog could not be fetched or does not serve a resource.
    Discovery,
    /// The release storage backend failed outside of an apply.
    Storage,
    /// A chart source could not be registered or refreshed.
    Repository,
}

/// For use with multiple fallible operations which may fail for different reasons, but are
/// defined withing the same scope and must return to the outer scope (calling scope) using
/// the try operator -- '?'.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[snafu(context(suffix(false)))]
pub enum Error {
    /// Error for when the value override expression cannot be compiled.
    #[snafu(display("Failed to parse value override near '{}': {}", fragment, reason))]
    ValuesExpression { fragment: String, reason: String },

    /// Error for when a compiled values mapping cannot be rendered as YAML.
    #[snafu(display("Failed to serialize values as YAML: {}", source))]
    ValuesSerialize { source: serde_yaml::Error },

    /// Error for when the caller's parameters lack the override expression.
    #[snafu(display("Missing required override expression '{}'", key))]
    MissingOverrideExpression { key: String },

    /// Error for when the API server address override is not a valid URI.
    #[snafu(display("Failed to parse API server address {}: {}", address, source))]
    InvalidServerAddress {
        source: http::uri::InvalidUri,
        address: String,
    },

    /// Error for when a ClusterIdentity is built without a namespace.
    #[snafu(display("Cluster identity requires a namespace"))]
    ClusterIdentityNs,

    /// Error for when raw kubeconfig bytes are not UTF-8.
    #[snafu(display("Failed to read kubeconfig document as UTF-8: {}", source))]
    KubeconfigEncoding { source: std::str::Utf8Error },

    /// Error for when a kubeconfig document cannot be decoded.
    #[snafu(display("Failed to decode kubeconfig document: {}", source))]
    KubeconfigDecode {
        source: kube::config::KubeconfigError,
    },

    /// Error for when the home directory of the current user is unknown.
    #[snafu(display("Failed to locate the home directory for the default kubeconfig"))]
    HomeDirectoryNotFound,

    /// Error for when no explicit kubeconfig is given and the default one does not exist.
    #[snafu(display("Default kubeconfig {} does not exist", path.display()))]
    AmbientKubeconfigMissing { path: PathBuf },

    /// Error for when the default kubeconfig cannot be read.
    #[snafu(display("Failed to read kubeconfig {}: {}", path.display(), source))]
    KubeconfigRead {
        source: kube::config::KubeconfigError,
        path: PathBuf,
    },

    /// Error for when a kubeconfig cannot be resolved into a client configuration.
    #[snafu(display("Failed to resolve kubeconfig into a client configuration: {}", source))]
    KubeconfigResolve {
        source: kube::config::KubeconfigError,
    },

    /// Error for when neither the kubeconfig nor the overrides name a cluster.
    #[snafu(display("Kubeconfig has no context and no API server address was given"))]
    NoClusterConfigured,

    /// Error for when Kubernetes API client generation fails.
    #[snafu(display("Failed to generate kubernetes client: {}", source))]
    ClientConstruction { source: kube::Error },

    /// Error for when the discovery endpoints of the API server cannot be read.
    #[snafu(display("Failed to fetch the API catalog from {}: {}", host, source))]
    DiscoveryFetch { source: kube::Error, host: String },

    /// Error for I/O on the discovery cache.
    #[snafu(display("Failed to access discovery cache {}: {}", path.display(), source))]
    DiscoveryCacheIo {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Error for when a discovery cache entry cannot be (de)serialized.
    #[snafu(display("Failed to (de)serialize discovery cache {}: {}", path.display(), source))]
    DiscoveryCacheSerde {
        source: serde_json::Error,
        path: PathBuf,
    },

    /// Error for when a temporary file cannot be created.
    #[snafu(display("Failed to create temporary file in {}: {}", path.display(), source))]
    TempFileCreation {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Error for when a temporary file cannot be written to.
    #[snafu(display("Failed to write to temporary file {}: {}", path.display(), source))]
    WriteToTempFile {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Error for when a temporary file cannot be moved onto its destination.
    #[snafu(display("Failed to replace {}: {}", path.display(), source))]
    PersistTempFile {
        source: tempfile::PersistError,
        path: PathBuf,
    },

    /// Error for when no served resource matches a resource name.
    #[snafu(display("The server doesn't have a resource type '{}'", resource))]
    NoResourceMatch { resource: String },

    /// Error for when no served resource matches a group/version/kind.
    #[snafu(display("No matches for kind '{}' in version '{}'", kind, api_version))]
    NoKindMatch { kind: String, api_version: String },

    /// Error for when the chart repository file cannot be read.
    #[snafu(display("Failed to read repository file {}: {}", path.display(), source))]
    RepoFileRead {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Error for when the chart repository file cannot be parsed.
    #[snafu(display("Failed to parse repository file {}: {}", path.display(), source))]
    RepoFileParse {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    /// Error for when the chart repository file cannot be serialized.
    #[snafu(display("Failed to serialize repository file {}: {}", path.display(), source))]
    RepoFileSerialize {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    /// Error for when a chart repository entry lacks a name or a URL.
    #[snafu(display("Invalid chart repository entry: {}", reason))]
    InvalidRepoEntry { reason: String },

    /// Error for when the index of a chart repository cannot be refreshed.
    #[snafu(display("Failed to update index of chart repository {} ({}): {}", name, url, source))]
    RepoIndexUpdate {
        #[snafu(source(false))]
        source: BackendError,
        name: String,
        url: String,
    },

    /// Error for when a chart references a repository which was never registered.
    #[snafu(display("Chart repository '{}' is not registered", name))]
    RepoNotRegistered { name: String },

    /// Error for when a chart reference is malformed.
    #[snafu(display("Invalid chart reference '{}'", chart))]
    InvalidChartRef { chart: String },

    /// Error for when the chart provider fails to load a chart.
    #[snafu(display("Failed to load chart {} version '{}': {}", chart, version, source))]
    ChartLoad {
        #[snafu(source(false))]
        source: BackendError,
        chart: String,
        version: String,
    },

    /// Error for when the chart provider fails to render a chart.
    #[snafu(display("Failed to render chart {} for release {}: {}", chart, release, source))]
    ChartRender {
        #[snafu(source(false))]
        source: BackendError,
        chart: String,
        release: String,
    },

    /// Error for when an operation needs charts but the client has no chart provider.
    #[snafu(display("Helm client has no chart provider configured"))]
    ChartProviderAbsent,

    /// Error for when a HelmClient is built without a mandatory component.
    #[snafu(display("Helm client requires a {}", component))]
    HelmClientBuilder { component: String },

    /// Error for when a ChartSpec is unusable.
    #[snafu(display("Invalid chart spec: {}", reason))]
    InvalidChartSpec { reason: String },

    /// Error for when a release does not exist in a namespace.
    #[snafu(display("Release {} not found in Namespace {}", name, namespace))]
    ReleaseNotFound { name: String, namespace: String },

    /// Error for when a release has no revision preceding the current one.
    #[snafu(display(
        "Release {} in Namespace {} has no revision {} to roll back to",
        name,
        namespace,
        revision
    ))]
    NoPriorRevision {
        name: String,
        namespace: String,
        revision: u32,
    },

    /// Error for when a specific release revision does not exist in storage.
    #[snafu(display("Revision {} of release {} not found in Namespace {}", version, name, namespace))]
    ReleaseRevisionNotFound {
        name: String,
        namespace: String,
        version: u32,
    },

    /// Error for when a release revision already exists in storage.
    #[snafu(display("Revision {} of release {} already exists in Namespace {}", version, name, namespace))]
    ReleaseExists {
        name: String,
        namespace: String,
        version: u32,
    },

    /// Error for when the objects of a release do not become ready in time.
    #[snafu(display(
        "Timed out after {:?} waiting for release {} in Namespace {} to become ready",
        timeout,
        name,
        namespace
    ))]
    WaitTimeout {
        name: String,
        namespace: String,
        timeout: Duration,
    },

    /// Error for when applied CustomResourceDefinitions are not established in time.
    #[snafu(display("Timed out after {:?} waiting for CustomResourceDefinitions to be established", timeout))]
    CrdEstablishTimeout { timeout: Duration },

    /// Error for when a release cannot be serialized for storage.
    #[snafu(display("Failed to encode release {}: {}", name, source))]
    ReleaseEncode {
        source: serde_json::Error,
        name: String,
    },

    /// Error for when a stored release cannot be compressed or decompressed.
    #[snafu(display("Failed to (de)compress release record {}: {}", record, source))]
    ReleaseCompression {
        source: std::io::Error,
        record: String,
    },

    /// Error for when a stored release is not valid base64.
    #[snafu(display("Failed to decode base64 of release record {}: {}", record, source))]
    ReleaseBase64 {
        source: base64::DecodeError,
        record: String,
    },

    /// Error for when a stored release cannot be deserialized.
    #[snafu(display("Failed to decode release record {}: {}", record, source))]
    ReleaseDecode {
        source: serde_json::Error,
        record: String,
    },

    /// Error for when a release Secret carries no release data.
    #[snafu(display("Release record {} has no '{}' data", record, key))]
    ReleaseRecordEmpty { record: String, key: String },

    /// Error for a Kubernetes API request for listing release Secrets fails.
    #[snafu(display(
        "Failed to list release Secrets with label {} in namespace {}: {}",
        label_selector,
        namespace,
        source
    ))]
    ListReleaseSecrets {
        source: kube::Error,
        namespace: String,
        label_selector: String,
    },

    /// Error for when a release Secret cannot be created, replaced or deleted.
    #[snafu(display("Failed to {} release Secret {} in namespace {}: {}", verb, record, namespace, source))]
    WriteReleaseSecret {
        source: kube::Error,
        verb: String,
        record: String,
        namespace: String,
    },

    /// Error for when a rendered manifest is not valid YAML.
    #[snafu(display("Failed to parse manifest {}: {}", manifest, source))]
    ManifestParse {
        source: serde_yaml::Error,
        manifest: String,
    },

    /// Error for when a document in a rendered manifest is not a Kubernetes object.
    #[snafu(display("Failed to read a Kubernetes object from manifest {}: {}", manifest, source))]
    ManifestObject {
        source: serde_json::Error,
        manifest: String,
    },

    /// Error for when an object in a rendered manifest is incomplete.
    #[snafu(display("Object in manifest {} is missing {}", manifest, field))]
    ManifestField { manifest: String, field: String },

    /// Error for when an object cannot be applied to the cluster.
    #[snafu(display("Failed to apply {} {} in namespace '{}': {}", kind, name, namespace, source))]
    ApplyObject {
        source: kube::Error,
        kind: String,
        name: String,
        namespace: String,
    },

    /// Error for when the REST resource of an object cannot be resolved while applying it.
    #[snafu(display("Failed to resolve the resource of {} {}: {}", kind, name, source))]
    ObjectMapping {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
        kind: String,
        name: String,
    },

    /// Error for when an object a release no longer renders cannot be deleted.
    #[snafu(display("Failed to delete {} {} in namespace '{}': {}", kind, name, namespace, source))]
    DeleteObject {
        source: kube::Error,
        kind: String,
        name: String,
        namespace: String,
    },

    /// Error for when the state of an applied object cannot be read.
    #[snafu(display("Failed to check readiness of {} {}: {}", kind, name, source))]
    ReadinessCheck {
        source: kube::Error,
        kind: String,
        name: String,
    },
}

impl Error {
    /// The class of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ValuesExpression { .. } | Error::ValuesSerialize { .. } => ErrorKind::Parse,
            Error::MissingOverrideExpression { .. }
            | Error::InvalidServerAddress { .. }
            | Error::ClusterIdentityNs
            | Error::KubeconfigEncoding { .. }
            | Error::KubeconfigDecode { .. }
            | Error::HomeDirectoryNotFound
            | Error::AmbientKubeconfigMissing { .. }
            | Error::KubeconfigRead { .. }
            | Error::KubeconfigResolve { .. }
            | Error::NoClusterConfigured
            | Error::ClientConstruction { .. }
            | Error::InvalidChartRef { .. }
            | Error::ChartProviderAbsent
            | Error::HelmClientBuilder { .. }
            | Error::InvalidChartSpec { .. } => ErrorKind::Config,
            Error::DiscoveryFetch { .. }
            | Error::DiscoveryCacheIo { .. }
            | Error::DiscoveryCacheSerde { .. }
            | Error::NoResourceMatch { .. }
            | Error::NoKindMatch { .. } => ErrorKind::Discovery,
            Error::TempFileCreation { .. }
            | Error::WriteToTempFile { .. }
            | Error::PersistTempFile { .. }
            | Error::RepoFileRead { .. }
            | Error::RepoFileParse { .. }
            | Error::RepoFileSerialize { .. }
            | Error::InvalidRepoEntry { .. }
            | Error::RepoIndexUpdate { .. } => ErrorKind::Repository,
            Error::RepoNotRegistered { .. }
            | Error::ReleaseNotFound { .. }
            | Error::NoPriorRevision { .. }
            | Error::ReleaseRevisionNotFound { .. } => ErrorKind::NotFound,
            Error::ReleaseExists { .. }
            | Error::ReleaseEncode { .. }
            | Error::ReleaseCompression { .. }
            | Error::ReleaseBase64 { .. }
            | Error::ReleaseDecode { .. }
            | Error::ReleaseRecordEmpty { .. }
            | Error::ListReleaseSecrets { .. }
            | Error::WriteReleaseSecret { .. } => ErrorKind::Storage,
            Error::ChartLoad { .. }
            | Error::ChartRender { .. }
            | Error::WaitTimeout { .. }
            | Error::CrdEstablishTimeout { .. }
            | Error::ManifestParse { .. }
            | Error::ManifestObject { .. }
            | Error::ManifestField { .. }
            | Error::ApplyObject { .. }
            | Error::ObjectMapping { .. }
            | Error::DeleteObject { .. }
            | Error::ReadinessCheck { .. } => ErrorKind::Apply,
        }
    }
}

/// A wrapper type to remove repeated Result<T, Error> returns.
pub type Result<T, E = Error> = std::result::Result<T, E>;
