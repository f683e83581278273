//! Canonical JSON serialization and content hashing.
//!
//! Projection and inspection outputs must be byte-stable: folding the same
//! prefix of events twice has to produce identical files. Canonical form
//! here means compact separators and lexicographically sorted object keys
//! at every level. `serde_json`'s default map is ordered, so round-tripping
//! any serializable value through [`serde_json::Value`] sorts every object.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize `value` to canonical JSON (compact, sorted keys).
///
/// # Errors
///
/// Returns the underlying serialization error when `value` cannot be
/// represented as JSON.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let normalized: Value = serde_json::to_value(value)?;
    serde_json::to_string(&normalized)
}

/// Hex SHA-256 of the canonical JSON form of `value`.
///
/// # Errors
///
/// Returns the underlying serialization error when `value` cannot be
/// represented as JSON.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = to_canonical_string(value)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn object_keys_are_sorted() {
        let canonical = to_canonical_string(&json!({"z": 1, "a": {"d": 2, "b": 3}})).unwrap();
        assert_eq!(canonical, r#"{"a":{"b":3,"d":2},"z":1}"#);
    }

    #[test]
    fn struct_fields_are_sorted_too() {
        #[derive(serde::Serialize)]
        struct Sample {
            zeta: u32,
            alpha: u32,
        }
        let canonical = to_canonical_string(&Sample { zeta: 1, alpha: 2 }).unwrap();
        assert_eq!(canonical, r#"{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let a = canonical_hash(&json!({"x": 1, "y": [1, 2, 3]})).unwrap();
        let b = canonical_hash(&json!({"y": [1, 2, 3], "x": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
