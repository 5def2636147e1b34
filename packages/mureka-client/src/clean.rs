//! Response cleaning.
//!
//! Provider responses embed verbose internals (per-section lyric
//! breakdowns) that would bloat every stored result. They are pruned
//! recursively before a response is persisted or returned to a client.

use serde_json::Value;

/// Keys stripped from provider responses by default.
pub const DEFAULT_STRIPPED_KEYS: &[&str] = &["lyrics_sections"];

/// Remove every occurrence of the given keys from a nested JSON value.
///
/// Sibling keys and array order are preserved. Applying the function
/// twice yields the same result as applying it once.
pub fn prune(value: &Value, keys: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !keys.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), prune(v, keys)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| prune(v, keys)).collect()),
        other => other.clone(),
    }
}

/// Prune the default verbose keys from a provider response.
pub fn clean_response(value: &Value) -> Value {
    prune(value, DEFAULT_STRIPPED_KEYS)
}
