//! The single rule deciding whether a payload plausibly holds vessel records.

use serde_json::Value;

/// Property names under which a record array may be wrapped.
pub const CONTAINER_KEYS: &[&str] = &["data", "vessels", "ships", "tankers", "results"];

/// Keys that mark a bare record as vessel-like.
const MARKER_KEYS: &[&str] = &["imo", "mmsi"];

/// A payload is vessel-shaped when it is
/// - a non-empty array whose first element carries an `imo`/`mmsi` key (any case), or
/// - an object with a non-empty array of objects under one of [`CONTAINER_KEYS`].
pub fn is_vessel_shaped(payload: &Value) -> bool {
    match payload {
        Value::Array(items) => items.first().is_some_and(has_marker_key),
        Value::Object(_) => record_array(payload).is_some(),
        _ => false,
    }
}

/// Stricter form for values found without any endpoint context: a container
/// array must also open with an `imo`/`mmsi`-bearing element.
pub fn is_vessel_shaped_strict(payload: &Value) -> bool {
    match payload {
        Value::Array(items) => items.first().is_some_and(has_marker_key),
        Value::Object(obj) => CONTAINER_KEYS.iter().any(|key| {
            obj.get(*key)
                .and_then(Value::as_array)
                .and_then(|items| items.first())
                .is_some_and(has_marker_key)
        }),
        _ => false,
    }
}

/// The wrapped record array of a container object, if it has one.
pub fn record_array(payload: &Value) -> Option<&Vec<Value>> {
    let obj = payload.as_object()?;
    CONTAINER_KEYS.iter().find_map(|key| {
        obj.get(*key)
            .and_then(Value::as_array)
            .filter(|items| items.first().is_some_and(Value::is_object))
    })
}

fn has_marker_key(item: &Value) -> bool {
    item.as_object().is_some_and(|obj| {
        obj.keys()
            .any(|k| MARKER_KEYS.iter().any(|m| k.eq_ignore_ascii_case(m)))
    })
}

/// Flattens a payload into its record objects: the bare array, or the first
/// non-empty container array. Non-object elements are skipped.
pub fn records(payload: &Value) -> Vec<&Value> {
    let items = match payload {
        Value::Array(items) => Some(items),
        Value::Object(obj) => CONTAINER_KEYS
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_array).filter(|a| !a.is_empty())),
        _ => None,
    };
    items
        .map(|items| items.iter().filter(|v| v.is_object()).collect())
        .unwrap_or_default()
}
