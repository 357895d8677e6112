use crate::{
    constants::{DEFAULT_BURST, DEFAULT_QPS, DISCOVERY_BURST},
    error::{
        AmbientKubeconfigMissing, ClientConstruction, ClusterIdentityNs, HomeDirectoryNotFound,
        InvalidServerAddress, KubeconfigDecode, KubeconfigEncoding, KubeconfigRead,
        KubeconfigResolve, NoClusterConfigured, Result,
    },
};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use snafu::{ensure, OptionExt, ResultExt};
use std::{
    path::{Path, PathBuf},
    str,
};
use tracing::debug;

/// A kubeconfig handed over by the caller.
#[derive(Clone, Debug)]
pub enum KubeconfigSource {
    /// YAML or JSON encoded kubeconfig.
    Raw(Vec<u8>),
    /// An already decoded kubeconfig.
    Document(Kubeconfig),
}

/// Where the cluster credentials come from.
#[derive(Clone, Debug, Default)]
pub enum CredentialSource {
    /// An explicit kubeconfig document.
    Explicit(KubeconfigSource),
    /// The kubeconfig file at `$HOME/.kube/config`.
    #[default]
    AmbientDefault,
}

/// Builder for a ClusterIdentity.
#[derive(Default)]
pub struct ClusterIdentityBuilder {
    server_address: Option<String>,
    tls_server_name: Option<String>,
    credentials: CredentialSource,
    namespace: Option<String>,
}

impl ClusterIdentityBuilder {
    /// This is a builder option to override the API server address of the kubeconfig.
    #[must_use]
    pub fn with_server_address<T>(mut self, address: T) -> Self
    where
        T: ToString,
    {
        self.server_address = Some(address.to_string()).filter(|address| !address.is_empty());
        self
    }

    /// This is a builder option to override the name used to verify the API server's certificate.
    #[must_use]
    pub fn with_tls_server_name<T>(mut self, name: T) -> Self
    where
        T: ToString,
    {
        self.tls_server_name = Some(name.to_string()).filter(|name| !name.is_empty());
        self
    }

    /// This is a builder option to use an explicit kubeconfig.
    #[must_use]
    pub fn with_kubeconfig(mut self, source: KubeconfigSource) -> Self {
        self.credentials = CredentialSource::Explicit(source);
        self
    }

    /// This is a builder option to use an encoded kubeconfig. Empty input selects the default
    /// kubeconfig file.
    #[must_use]
    pub fn with_raw_kubeconfig<T>(mut self, raw: T) -> Self
    where
        T: Into<Vec<u8>>,
    {
        let raw = raw.into();
        self.credentials = match raw.is_empty() {
            true => CredentialSource::AmbientDefault,
            false => CredentialSource::Explicit(KubeconfigSource::Raw(raw)),
        };
        self
    }

    /// This is a builder option to add the Namespace the releases live in. This is mandatory.
    #[must_use]
    pub fn with_namespace<T>(mut self, namespace: T) -> Self
    where
        T: ToString,
    {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Build the ClusterIdentity.
    pub fn build(self) -> Result<ClusterIdentity> {
        let namespace = self
            .namespace
            .filter(|namespace| !namespace.is_empty())
            .context(ClusterIdentityNs)?;

        let server_address = self
            .server_address
            .map(|address| {
                address
                    .parse::<http::Uri>()
                    .context(InvalidServerAddress { address })
            })
            .transpose()?;

        Ok(ClusterIdentity {
            server_address,
            tls_server_name: self.tls_server_name,
            credentials: self.credentials,
            namespace,
        })
    }
}

/// The cluster a client talks to and the credentials it uses.
#[derive(Clone, Debug)]
pub struct ClusterIdentity {
    server_address: Option<http::Uri>,
    tls_server_name: Option<String>,
    credentials: CredentialSource,
    namespace: String,
}

impl ClusterIdentity {
    /// This creates an empty builder.
    pub fn builder() -> ClusterIdentityBuilder {
        ClusterIdentityBuilder::default()
    }

    /// API server address which overrides the kubeconfig's.
    pub fn server_address(&self) -> Option<&http::Uri> {
        self.server_address.as_ref()
    }

    /// TLS server name which overrides the kubeconfig's.
    pub fn tls_server_name(&self) -> Option<&str> {
        self.tls_server_name.as_deref()
    }

    /// Source of the cluster credentials.
    pub fn credentials(&self) -> &CredentialSource {
        &self.credentials
    }

    /// Namespace of the releases.
    pub fn namespace(&self) -> &str {
        self.namespace.as_str()
    }
}

/// Client-side request throughput limits.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimits {
    pub qps: f32,
    pub burst: i32,
}

impl RateLimits {
    /// Limits high enough that the client never throttles legitimate bursts.
    pub fn ceiling() -> Self {
        Self {
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
        }
    }
}

/// The low-level connection settings a client was built from.
#[derive(Clone, Debug)]
pub struct ConnectionDescriptor {
    host: String,
    tls_server_name: Option<String>,
    rate_limits: RateLimits,
    config: Config,
}

impl ConnectionDescriptor {
    fn new(config: Config) -> Self {
        Self {
            host: config.cluster_url.to_string(),
            tls_server_name: config.tls_server_name.clone(),
            rate_limits: RateLimits::ceiling(),
            config,
        }
    }

    /// API server address.
    pub fn host(&self) -> &str {
        self.host.as_str()
    }

    /// Name used to verify the API server's certificate.
    pub fn tls_server_name(&self) -> Option<&str> {
        self.tls_server_name.as_deref()
    }

    /// Client-side throughput limits.
    pub fn rate_limits(&self) -> RateLimits {
        self.rate_limits
    }

    /// The resolved client configuration, credentials included.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A copy of this descriptor tuned for discovery requests.
    pub fn for_discovery(&self) -> Self {
        let mut descriptor = self.clone();
        descriptor.rate_limits.burst = DISCOVERY_BURST;
        descriptor
    }

    /// Generate a new kube::Client from this descriptor. No request is made.
    pub fn client(&self) -> Result<Client> {
        Client::try_from(self.config.clone()).context(ClientConstruction)
    }
}

/// Resolve the identity into a client configuration and build a client from it.
pub async fn build_client(identity: &ClusterIdentity) -> Result<(Client, ConnectionDescriptor)> {
    let config = resolve_config(identity).await?;
    let descriptor = ConnectionDescriptor::new(config);
    let client = descriptor.client()?;
    debug!(
        host = descriptor.host(),
        tls_server_name = ?descriptor.tls_server_name(),
        namespace = identity.namespace(),
        "Built Kubernetes client"
    );
    Ok((client, descriptor))
}

/// Resolve the identity into a client configuration: an explicit kubeconfig if one was given,
/// else the default file. The identity's overrides always win over the kubeconfig.
pub async fn resolve_config(identity: &ClusterIdentity) -> Result<Config> {
    let mut config = match identity.credentials() {
        CredentialSource::Explicit(source) => {
            let kubeconfig = decode_kubeconfig(source)?;
            config_from_document(kubeconfig, identity.server_address()).await?
        }
        CredentialSource::AmbientDefault => config_from_file(&ambient_kubeconfig_path()?).await?,
    };
    apply_overrides(&mut config, identity);
    Ok(config)
}

async fn config_from_file(path: &Path) -> Result<Config> {
    ensure!(path.is_file(), AmbientKubeconfigMissing { path });
    let kubeconfig = Kubeconfig::read_from(path).context(KubeconfigRead { path })?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context(KubeconfigResolve)
}

/// Location of the default kubeconfig file.
pub fn ambient_kubeconfig_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context(HomeDirectoryNotFound)?;
    Ok(home.join(".kube").join("config"))
}

fn decode_kubeconfig(source: &KubeconfigSource) -> Result<Kubeconfig> {
    match source {
        KubeconfigSource::Raw(raw) => {
            let text = str::from_utf8(raw.as_slice()).context(KubeconfigEncoding)?;
            Kubeconfig::from_yaml(text).context(KubeconfigDecode)
        }
        KubeconfigSource::Document(document) => Ok(document.clone()),
    }
}

async fn config_from_document(
    mut kubeconfig: Kubeconfig,
    server_address: Option<&http::Uri>,
) -> Result<Config> {
    if kubeconfig.current_context.is_none() && kubeconfig.contexts.len() == 1 {
        kubeconfig.current_context = Some(kubeconfig.contexts[0].name.clone());
    }

    // A document without any context still works if the caller names the server.
    if kubeconfig.current_context.is_none() && kubeconfig.contexts.is_empty() {
        let server = server_address.context(NoClusterConfigured)?;
        return Ok(Config::new(server.clone()));
    }

    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context(KubeconfigResolve)
}

fn apply_overrides(config: &mut Config, identity: &ClusterIdentity) {
    if let Some(address) = identity.server_address() {
        config.cluster_url = address.clone();
    }
    if let Some(name) = identity.tls_server_name() {
        config.tls_server_name = Some(name.to_string());
    }
    config.default_namespace = identity.namespace().to_string();
}
