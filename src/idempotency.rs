//! Deterministic idempotency keys.
//!
//! A key identifies a logical operation: the same `(scope, payload)` always
//! maps to the same key, regardless of the order in which object fields were
//! inserted, so re-delivering an operation lets the remote recognize it.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Separates the scope from the canonical payload in the hash input so that
/// `("ab", "c")` and `("a", "bc")` cannot collide.
const SCOPE_SEPARATOR: u8 = 0x1f;

/// Derive a 64-character hex key for `payload` within `scope`.
pub fn derive(scope: &str, payload: &Value) -> String {
  let mut hasher = Sha256::new();
  hasher.update(scope.as_bytes());
  hasher.update([SCOPE_SEPARATOR]);
  hasher.update(canonicalize(payload).as_bytes());
  hex::encode(hasher.finalize())
}

/// Canonical text encoding: object keys sorted, array order kept.
pub fn canonicalize(value: &Value) -> String {
  let mut out = String::new();
  write_canonical(value, &mut out);
  out
}

fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<(&String, &Value)> = map.iter().collect();
      entries.sort_by(|a, b| a.0.cmp(b.0));

      out.push('{');
      for (i, (key, val)) in entries.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        // Serializing a str to JSON cannot fail
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(val, out);
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
    scalar => out.push_str(&scalar.to_string()),
  }
}
