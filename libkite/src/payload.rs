//! Flattening of nested job payloads into environment-friendly key/value
//! pairs.
//!
//! `{"a": {"b": 1, "c": [2, 3]}}` becomes `a_b=1`, `a_c_0=2`, `a_c_1=3`.

use std::collections::BTreeMap;

use serde_json::Value;

/// Separator placed between a parent key and its children.
pub const SEPARATOR: &str = "_";

/// A job payload reduced to string keys and string values.
pub type FlattenedJob = BTreeMap<String, String>;

/// Flatten `value` with no key prefix. Every value in the result is text.
pub fn flatten(value: &Value) -> FlattenedJob {
    flatten_with_prefix(value, "")
}

/// Flatten `value`, prepending `prefix` to every key.
///
/// Objects contribute `prefix + key`, arrays `prefix + index`. Nested
/// containers recurse with their own key plus [`SEPARATOR`] as the new
/// prefix. A scalar at the top level is stored under `prefix` itself.
pub fn flatten_with_prefix(value: &Value, prefix: &str) -> FlattenedJob {
    let mut out = FlattenedJob::new();
    match value {
        Value::Object(_) | Value::Array(_) => flatten_into(&mut out, value, prefix),
        scalar => {
            out.insert(prefix.to_string(), scalar_to_string(scalar));
        }
    }
    out
}

fn flatten_into(out: &mut FlattenedJob, value: &Value, prefix: &str) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                insert_child(out, format!("{prefix}{key}"), child);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                insert_child(out, format!("{prefix}{index}"), child);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            out.insert(prefix.to_string(), scalar_to_string(value));
        }
    }
}

fn insert_child(out: &mut FlattenedJob, key: String, child: &Value) {
    match child {
        Value::Object(_) | Value::Array(_) => {
            flatten_into(out, child, &format!("{key}{SEPARATOR}"));
        }
        scalar => {
            out.insert(key, scalar_to_string(scalar));
        }
    }
}

/// Text form of a leaf value: strings as-is, numbers and booleans in their
/// JSON spelling, null as the empty string.
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
