use super::{Value, Values};

/// Deep-merge 'overlay' onto 'base'. Mappings present on both sides are merged key by key, any
/// other value from 'overlay' replaces the one in 'base'. Nulls are carried over so that a later
/// `coalesce` can still use them to drop keys.
pub fn merge(base: &Values, overlay: &Values) -> Values {
    let mut merged = base.clone();
    for (key, value) in overlay {
        match (merged.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                *existing = merge(existing, incoming);
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Compute the effective values of a release: 'overrides' deep-merged over the chart's
/// 'defaults'. A null override removes the key.
pub fn coalesce(defaults: &Values, overrides: &Values) -> Values {
    let mut coalesced = defaults.clone();
    for (key, value) in overrides {
        match (coalesced.get_mut(key), value) {
            (_, Value::Null) => {
                coalesced.remove(key);
            }
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                *existing = coalesce(existing, incoming);
            }
            (_, value) => {
                coalesced.insert(key.clone(), without_nulls(value));
            }
        }
    }
    coalesced
}

fn without_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), without_nulls(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render a nested values mapping back into `(path, value)` pairs in the override grammar: keys
/// joined by '.', list positions as `[i]`, and separator characters inside keys escaped. Empty
/// mappings and sequences are kept as leaves.
pub fn flatten(values: &Values) -> Vec<(String, Value)> {
    let mut pairs = Vec::new();
    for (key, value) in values {
        flatten_into(escape_key(key), value, &mut pairs);
    }
    pairs
}

fn flatten_into(path: String, value: &Value, pairs: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten_into(format!("{path}.{}", escape_key(key)), child, pairs);
            }
        }
        Value::Array(list) if !list.is_empty() => {
            for (index, child) in list.iter().enumerate() {
                flatten_into(format!("{path}[{index}]"), child, pairs);
            }
        }
        leaf => pairs.push((path, leaf.clone())),
    }
}

fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for c in key.chars() {
        if matches!(c, '.' | ',' | '=' | '[' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
