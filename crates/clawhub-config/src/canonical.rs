use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize `value` to canonical JSON (object keys recursively sorted,
/// arrays in order) and return its SHA-256 as lowercase hex.
///
/// This is the drift-detection fingerprint: the hash of `{a:1,b:2}` equals
/// the hash of `{b:2,a:1}`, and the agent computes the same digest on its
/// side of the wire.
pub fn canonical_hash<T: Serialize>(value: &T) -> String {
    let v = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    let canonical = sort_json_keys(v);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{:x}", digest)
}

/// Recursively sort JSON object keys so map field ordering doesn't affect
/// the hash.
fn sort_json_keys(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_json_keys(v)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(sort_json_keys).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_order_independent() {
        let a = json!({ "a": 1, "b": { "x": true, "y": [1, 2] } });
        let b = json!({ "b": { "y": [1, 2], "x": true }, "a": 1 });
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn hash_discriminates_leaf_values() {
        let a = json!({ "a": 1, "b": 2 });
        let b = json!({ "a": 1, "b": 3 });
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn array_order_is_significant() {
        let a = json!({ "xs": [1, 2, 3] });
        let b = json!({ "xs": [3, 2, 1] });
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn hash_is_64_lowercase_hex() {
        let h = canonical_hash(&json!({ "k": "v" }));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn nested_permutations_agree() {
        // Deep nesting with maps inside arrays: array order stays, inner map
        // order is normalized.
        let a = json!({ "outer": [ { "p": 1, "q": 2 }, { "r": 3 } ] });
        let b = json!({ "outer": [ { "q": 2, "p": 1 }, { "r": 3 } ] });
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }
}
