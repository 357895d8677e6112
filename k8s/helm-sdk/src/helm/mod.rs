/// Contains the server-side apply of rendered manifests and readiness checks.
pub mod apply;

/// Contains the chart model and the chart provider interface.
pub mod chart;

/// Contains the release lifecycle client.
pub mod client;

/// Contains the release model and the install/upgrade/rollback input.
pub mod release;

/// Contains the chart repository registry.
pub mod repo;

/// Contains the release storage drivers.
pub mod storage;
