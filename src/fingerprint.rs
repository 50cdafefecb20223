//! Deterministic request fingerprints.
//!
//! A fingerprint identifies a canonical request across processes and
//! platforms: two byte-different requests that canonicalize to the same
//! JSON and target the same `(provider, endpoint, method, model)` hash
//! equally. Host and ephemeral headers never participate, so the same
//! request replayed against a different base URL of the same provider
//! still hits the cache.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Recursively sort object keys. Arrays keep their order (element order is
/// semantically significant, e.g. chat messages); numbers pass through
/// `serde_json::Number` unchanged so integers stay integral and floats keep
/// serde_json's shortest-roundtrip rendering.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Hash a request into its cache fingerprint, rendered as lowercase hex.
pub fn fingerprint(
    provider: &str,
    endpoint: &str,
    method: &str,
    model: &str,
    body: &Value,
) -> String {
    let canonical = canonicalize(body);

    let mut hasher = Sha256::new();
    for part in [provider, endpoint, method, model] {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(canonical.to_string().as_bytes());

    hex::encode(hasher.finalize())
}
