//! Install, upgrade, roll back and inspect Helm releases on a Kubernetes cluster without shelling
//! out to the helm binary.

/// Module for compiled-in defaults.
pub mod constants;
/// Module for the error type of this crate.
pub mod error;
mod file;
/// Module for the release lifecycle.
pub mod helm;
/// Module for cluster client construction, API discovery and resource mapping.
pub mod kube;
/// Module for the operator-facing entrypoints.
pub mod sdk;
/// Module for filesystem locations.
pub mod settings;
/// Module for value override expressions and values documents.
pub mod values;

pub use error::{Error, ErrorKind, Result};
pub use sdk::{
    get_release, get_release_list, get_release_values, helm_client, install_or_upgrade_chart,
    rollback_release, ClusterTarget,
};
