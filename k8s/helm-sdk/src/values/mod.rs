/// Compiler for the comma-separated `path=value` override grammar.
mod strvals;

/// Merging of values mappings and their flattening back into paths.
mod coalesce;

pub use coalesce::{coalesce, flatten, merge};
pub use strvals::{parse, parse_params, to_yaml};

/// A loosely-typed configuration value: string, number, bool, null, sequence or ordered mapping.
pub type Value = serde_json::Value;

/// An ordered mapping of configuration values, e.g. a chart's defaults or an operator's overlay.
pub type Values = serde_json::Map<String, Value>;
