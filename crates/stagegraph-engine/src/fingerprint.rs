//! Content fingerprints.

use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::Value;

/// A 256-bit blake3 digest summarising a value or a set of inputs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
  /// Fingerprint raw bytes.
  pub fn of_bytes(bytes: &[u8]) -> Self {
    Self(*blake3::hash(bytes).as_bytes())
  }

  /// Fingerprint a JSON value by its canonical serialization.
  ///
  /// The canonical form is compact JSON with object keys sorted at every
  /// level, independent of how the map stores its entries.
  pub fn of_value(value: &serde_json::Value) -> Self {
    let mut hasher = blake3::Hasher::new();
    write_canonical(&mut hasher, value);
    Self(*hasher.finalize().as_bytes())
  }

  /// Hash a tagged tuple of fields. Each field is length-prefixed so field
  /// boundaries cannot shift.
  pub fn of_fields(tag: &str, fields: &[&[u8]]) -> Self {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(tag.len() as u64).to_le_bytes());
    hasher.update(tag.as_bytes());
    for field in fields {
      hasher.update(&(field.len() as u64).to_le_bytes());
      hasher.update(field);
    }
    Self(*hasher.finalize().as_bytes())
  }

  /// Combine fingerprints independently of the order they are supplied in.
  pub fn combine_unordered(tag: &str, parts: impl IntoIterator<Item = Fingerprint>) -> Self {
    let mut parts: Vec<Fingerprint> = parts.into_iter().collect();
    parts.sort_unstable();
    let fields: Vec<&[u8]> = parts.iter().map(|part| part.as_bytes().as_slice()).collect();
    Self::of_fields(tag, &fields)
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    blake3::Hash::from(self.0).to_hex().to_string()
  }
}

fn write_canonical(hasher: &mut blake3::Hasher, value: &Value) {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<(&String, &Value)> = map.iter().collect();
      entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
      hasher.update(b"{");
      for (i, (key, item)) in entries.into_iter().enumerate() {
        if i > 0 {
          hasher.update(b",");
        }
        hasher.update(Value::from(key.as_str()).to_string().as_bytes());
        hasher.update(b":");
        write_canonical(hasher, item);
      }
      hasher.update(b"}");
    }
    Value::Array(items) => {
      hasher.update(b"[");
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          hasher.update(b",");
        }
        write_canonical(hasher, item);
      }
      hasher.update(b"]");
    }
    scalar => {
      hasher.update(scalar.to_string().as_bytes());
    }
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "blake3:{}", self.to_hex())
  }
}

impl fmt::Debug for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Fingerprint({})", &self.to_hex()[..12])
  }
}

impl Serialize for Fingerprint {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}
