/// Contains tools to turn a cluster identity into a Kubernetes API client.
pub mod client;

/// Contains the host-keyed, on-disk cache of the cluster's API catalog.
pub mod discovery;

/// Contains the lazy resource-kind resolver and its shortcut expansion.
pub mod mapper;
