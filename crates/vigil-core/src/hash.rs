//! Canonical-JSON SHA-256 hashing (P1: equal payloads hash equal regardless
//! of key order). Used by the Persona Store (§4.1) and the Generator's
//! duplicate-detection pass (§4.4).

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Recursively sorts object keys so serialization is independent of input order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 of the canonical-JSON form of `value`, truncated to 16 hex chars.
pub fn canonical_hash(value: &Value) -> String {
    let canon = canonicalize(value);
    let bytes = serde_json::to_vec(&canon).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let hex = format!("{:x}", digest);
    hex[..16].to_string()
}

/// Convenience overload for any `Serialize` payload.
pub fn canonical_hash_of<T: serde::Serialize>(payload: &T) -> String {
    let value = serde_json::to_value(payload).unwrap_or(Value::Null);
    canonical_hash(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = json!({"b": 1, "a": 2, "nested": {"z": 1, "y": 2}});
        let b = json!({"a": 2, "nested": {"y": 2, "z": 1}, "b": 1});
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
        assert_eq!(canonical_hash(&a).len(), 16);
    }

    #[test]
    fn different_content_hashes_differently() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }
}
