use crate::{
    constants::{DEFAULT_APPLY_TIMEOUT, DEFAULT_MAX_HISTORY},
    helm::chart::{Chart, Manifest},
    values::Values,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// The state of a release revision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    #[default]
    Unknown,
    Deployed,
    Failed,
    Superseded,
    Uninstalled,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Deployed => "deployed",
            Status::Failed => "failed",
            Status::Superseded => "superseded",
            Status::Uninstalled => "uninstalled",
            Status::PendingInstall => "pending-install",
            Status::PendingUpgrade => "pending-upgrade",
            Status::PendingRollback => "pending-rollback",
        }
    }

    /// Whether an install, upgrade or rollback of this revision is underway.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Status::PendingInstall | Status::PendingUpgrade | Status::PendingRollback
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping of a release revision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    pub first_deployed: DateTime<Utc>,
    pub last_deployed: DateTime<Utc>,
    pub status: Status,
    #[serde(default)]
    pub description: String,
}

/// One revision of a named, namespaced instantiation of a chart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    /// The revision number, starting at 1.
    pub version: u32,
    pub info: Info,
    pub chart: Chart,
    /// The values the operator supplied, without the chart defaults.
    #[serde(default)]
    pub config: Values,
    /// The rendered templates.
    #[serde(default)]
    pub manifests: Vec<Manifest>,
}

impl Release {
    /// This is a getter for the status of this revision.
    pub fn status(&self) -> Status {
        self.info.status
    }

    /// Move this revision to 'status'.
    pub fn set_status<D: ToString>(&mut self, status: Status, description: D) {
        self.info.status = status;
        self.info.description = description.to_string();
    }

    /// Whether this revision deploys the same chart with the same values as 'other'.
    pub fn same_deployment(&self, chart: &Chart, config: &Values) -> bool {
        self.chart.name() == chart.name()
            && self.chart.version() == chart.version()
            && &self.config == config
    }
}

/// Input of an install, upgrade or rollback.
#[derive(Clone, Debug, PartialEq)]
pub struct ChartSpec {
    pub release_name: String,
    /// A repository-qualified chart reference, 'repository/chart'.
    pub chart_name: String,
    /// Chart version. Empty selects the latest one.
    pub version: String,
    /// Namespace of the release. Empty selects the client's namespace.
    pub namespace: String,
    /// Values overlay.
    pub values: Values,
    /// Apply the chart's CRDs on upgrade and rollback too, not just on install.
    pub upgrade_crds: bool,
    /// On upgrade, merge the values overlay over the values of the last release.
    pub reuse_values: bool,
    /// Block until the applied objects are ready, for at most 'timeout'.
    pub wait: bool,
    pub timeout: Duration,
    /// Revisions retained per release, 0 keeps all of them.
    pub max_history: usize,
}

impl Default for ChartSpec {
    fn default() -> Self {
        Self {
            release_name: String::new(),
            chart_name: String::new(),
            version: String::new(),
            namespace: String::new(),
            values: Values::new(),
            upgrade_crds: false,
            reuse_values: false,
            wait: false,
            timeout: DEFAULT_APPLY_TIMEOUT,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}
