//! Structured overlay of a pool patch onto a generated workload.
//!
//! Maps merge key by key, everything else (scalars, arrays) is replaced.
//! `null` removes a key. A map carrying `"$patch": "replace"` replaces the
//! target sub-tree wholesale; `"$patch": "delete"` removes it.

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

const DIRECTIVE_KEY: &str = "$patch";
const DIRECTIVE_REPLACE: &str = "replace";
const DIRECTIVE_DELETE: &str = "delete";

fn directive(patch: &Map<String, Value>) -> Option<&str> {
    patch.get(DIRECTIVE_KEY).and_then(Value::as_str)
}

/// Merge `patch` into `target` in place.
pub fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if directive(patch_map) == Some(DIRECTIVE_REPLACE) || !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target_map) = target else {
        return;
    };

    for (key, value) in patch_map {
        if key == DIRECTIVE_KEY {
            continue;
        }
        match value {
            Value::Null => {
                target_map.remove(key);
            }
            Value::Object(child) if directive(child) == Some(DIRECTIVE_DELETE) => {
                target_map.remove(key);
            }
            _ => merge(target_map.entry(key.clone()).or_insert(Value::Null), value),
        }
    }
}

/// Serialize `object`, merge `patch` over it and read the result back.
pub fn apply<T>(object: &T, patch: &Value) -> anyhow::Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut doc = serde_json::to_value(object).context("serializing object for patch")?;
    merge(&mut doc, patch);
    serde_json::from_value(doc).context("patched object does not decode")
}
