//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of resource configurations so
//! that a redeploy of an unchanged resource is recognized as a no-op.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::state::ResourceKey;

/// Hasher for computing configuration fingerprints.
#[derive(Debug, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Computes the fingerprint of one resource configuration.
    ///
    /// Object keys are hashed in sorted order, so two configurations that only
    /// differ in key order share a fingerprint.
    #[must_use]
    pub fn fingerprint(resource_type: &str, config: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(resource_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(config).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Combines a configuration fingerprint with the keys the resource depends on.
    ///
    /// A resource without dependencies keeps its configuration fingerprint.
    #[must_use]
    pub fn with_dependencies(fingerprint: &str, depends_on: &[ResourceKey]) -> String {
        if depends_on.is_empty() {
            return fingerprint.to_string();
        }

        let mut keys: Vec<String> = depends_on.iter().map(ToString::to_string).collect();
        keys.sort();
        keys.dedup();

        let mut hasher = Sha256::new();
        hasher.update(fingerprint.as_bytes());
        for key in keys {
            hasher.update([0u8]);
            hasher.update(key.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Renders a JSON value with object keys in sorted order.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = json!({"name": "nightly", "tasks": [{"key": "t1"}], "timeout": 60});
        let b = json!({"timeout": 60, "tasks": [{"key": "t1"}], "name": "nightly"});

        assert_eq!(
            ConfigHasher::fingerprint("job", &a),
            ConfigHasher::fingerprint("job", &b)
        );
        assert_eq!(ConfigHasher::fingerprint("job", &a).len(), 64);
    }

    #[test]
    fn test_fingerprint_detects_changes() {
        let a = json!({"timeout": 60});
        let b = json!({"timeout": 61});

        assert_ne!(
            ConfigHasher::fingerprint("job", &a),
            ConfigHasher::fingerprint("job", &b)
        );
        assert_ne!(
            ConfigHasher::fingerprint("job", &a),
            ConfigHasher::fingerprint("pipeline", &a)
        );
    }

    #[test]
    fn test_canonical_json() {
        let value = json!({"b": [1, {"d": null, "c": "x"}], "a": true});
        assert_eq!(canonical_json(&value), r#"{"a":true,"b":[1,{"c":"x","d":null}]}"#);
    }

    #[test]
    fn test_dependencies_change_fingerprint() {
        let base = ConfigHasher::fingerprint("pipeline", &json!({"a": 1}));
        let z = ResourceKey::new("job", "z");
        let y = ResourceKey::new("job", "y");

        assert_eq!(ConfigHasher::with_dependencies(&base, &[]), base);
        assert_ne!(ConfigHasher::with_dependencies(&base, &[z.clone()]), base);
        assert_eq!(
            ConfigHasher::with_dependencies(&base, &[z.clone(), y.clone()]),
            ConfigHasher::with_dependencies(&base, &[y.clone(), z.clone(), y])
        );
    }
}
