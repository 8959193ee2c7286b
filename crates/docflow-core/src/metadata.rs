//! Additive merging of the document metadata bag.

use serde_json::{Map, Value};

/// Deep-merge `patch` into `base`.
///
/// Objects merge key by key, recursively; any other value in `patch`
/// replaces the one in `base`. `null` in `patch` is ignored at any depth,
/// so a writer can never erase a key it does not know about, and a null
/// never lands in the stored bag. The `jsonb_deep_merge` SQL function
/// applies the same rules.
pub fn merge_metadata(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => merge_maps(base_map, patch_map),
        (_, Value::Null) => {}
        (base, patch) => *base = strip_nulls(patch),
    }
}

/// Drop null object fields recursively, like `jsonb_strip_nulls`.
fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

fn merge_maps(base: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        if value.is_null() {
            continue;
        }
        match base.get_mut(&key) {
            Some(existing) if existing.is_object() && value.is_object() => {
                merge_metadata(existing, value)
            }
            _ => {
                base.insert(key, strip_nulls(value));
            }
        }
    }
}

/// Returns `base` deep-merged with `patch` without mutating the inputs.
pub fn merged(base: Option<&Value>, patch: Value) -> Value {
    let mut out = base
        .cloned()
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(Map::new()));
    merge_metadata(&mut out, patch);
    out
}
