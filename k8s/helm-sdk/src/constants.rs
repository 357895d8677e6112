use std::time::Duration;

/// High enough QPS to fit all expected use cases.
pub const DEFAULT_QPS: f32 = 1e6;

/// High enough burst to fit all expected use cases.
pub const DEFAULT_BURST: i32 = 1_000_000;

/// Burst used by the discovery client. With ~25 API groups discovery makes ~50 requests.
pub const DISCOVERY_BURST: i32 = 100;

/// Time-to-live of a discovery cache entry, measured from the last successful fetch.
pub const DISCOVERY_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Upper bound on the wait-for-ready phase of an install, upgrade or rollback.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(600);

/// Number of release revisions retained per release.
pub const DEFAULT_MAX_HISTORY: usize = 20;

/// Directory for chart repository indices and other cached data.
pub const REPOSITORY_CACHE: &str = "/tmp/.helmcache";

/// File which records the registered chart repositories.
pub const REPOSITORY_CONFIG: &str = "/tmp/.helmrepo";

/// Directory under which the per-host discovery caches live.
pub const DISCOVERY_CACHE_DIR: &str = "/tmp/.helmcache/discovery";

/// Name of the file holding a serialized discovery catalog inside a host's cache directory.
pub const DISCOVERY_CACHE_FILE: &str = "servergroups.json";

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "helm-sdk";

/// Interval between two readiness polls while waiting on applied objects.
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound on the wait for applied CustomResourceDefinitions to be established.
pub const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(60);

/// Key of the value override expression in the caller-facing parameter mapping.
pub const SET_PARAM_KEY: &str = "set";

/// Storage driver constants, shared with the Helm release Secret layout.
pub const RELEASE_SECRET_TYPE: &str = "helm.sh/release.v1";
pub const RELEASE_SECRET_PREFIX: &str = "sh.helm.release.v1";
pub const RELEASE_SECRET_DATA_KEY: &str = "release";
pub const RELEASE_OWNER: &str = "helm";

/// Largest list index accepted in a value override path.
pub const MAX_VALUES_INDEX: usize = 65536;
