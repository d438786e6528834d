//! Canonical JSON bytes: recursively sorted object keys, LF-terminated.
//!
//! Decision reports are hashed and compared across runs, so their byte
//! form must not depend on struct field order or map iteration order.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::IoError;

/// Recursively sort object keys. Arrays keep their order; scalars pass
/// through.
fn canonicalize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize_value(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_value).collect()),
        _ => value.clone(),
    }
}

/// Serialize anything into canonical, LF-terminated UTF-8 bytes.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, IoError> {
    let raw = serde_json::to_value(value)?;
    let canonical = canonicalize_value(&raw);
    let mut text = serde_json::to_string(&canonical)?;
    if !text.ends_with('\n') {
        text.push('\n');
    }
    Ok(text.into_bytes())
}
