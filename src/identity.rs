//! Content addressing: canonical JSON and SHA-256 ids.
//!
//! Two structurally identical nodes must hash to the same id on every
//! machine and every run, so the JSON encoding is canonicalized before
//! hashing: object keys recursively sorted, compact separators, numbers in
//! serde_json's shortest round-trip form.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Policy for constants that carry no deterministic representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityPolicy {
    /// Assign a fresh UUID-based pseudo-id (disables memoization for the
    /// node, everything else proceeds).
    #[default]
    AllowPseudo,
    /// Refuse to reduce the program.
    Strict,
}

/// SHA-256 of a byte slice, lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Canonical textual form of a JSON value: keys sorted, no whitespace.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Content id of a JSON value: SHA-256 over its canonical form.
pub fn content_id(value: &serde_json::Value) -> String {
    hash_bytes(canonical_json(value).as_bytes())
}

/// A fresh pseudo-id for non-identifiable content. Hashed so ids keep a
/// uniform 64-hex shape regardless of origin.
pub fn pseudo_id() -> String {
    hash_bytes(Uuid::new_v4().to_string().as_bytes())
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        serde_json::Value::Number(n) => out.push_str(&n.to_string()),
        serde_json::Value::String(s) => {
            // serde_json's string serialization is already canonical.
            out.push_str(&serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into()));
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_else(|_| "\"\"".into()));
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}
