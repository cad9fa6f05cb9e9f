//! Canonical JSON form and content hashing.
//!
//! Every content-addressed identity in the runtime (schema hashes, snapshot
//! hashes, requirement ids, default execution keys) is derived the same way:
//! serialize to the RFC 8785 canonical JSON form (object keys sorted by
//! Unicode code point, shortest number encoding) and take the SHA-256 of the
//! bytes. Two values with the same semantic content therefore always produce
//! the same hash, regardless of field insertion order.
//!
//! Negative zero is normalized to zero before encoding. Non-finite numbers
//! cannot occur: `serde_json::Value` has no representation for them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CanonicalError;

/// A lowercase hex SHA-256 digest of a canonical JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wrap an existing lowercase hex digest.
    ///
    /// No validation is applied; use [`hash_value`] to derive hashes from
    /// values.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The full hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex characters, for logs and display surfaces.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize a value to its canonical JSON byte form.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    let normalized = normalize(value);
    serde_jcs::to_vec(&normalized).map_err(|source| CanonicalError::Encode {
        message: source.to_string(),
    })
}

/// Canonical form as a UTF-8 string (the byte form is always valid UTF-8).
pub fn canonical_string(value: &Value) -> Result<String, CanonicalError> {
    let bytes = canonical_bytes(value)?;
    String::from_utf8(bytes).map_err(|source| CanonicalError::Encode {
        message: source.to_string(),
    })
}

/// SHA-256 over the canonical form of `value`.
pub fn hash_value(value: &Value) -> Result<ContentHash, CanonicalError> {
    let bytes = canonical_bytes(value)?;
    Ok(hash_bytes(&bytes))
}

/// SHA-256 over raw bytes, hex-encoded.
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    use fmt::Write;

    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // Writing to a String cannot fail.
        let _ = write!(hex, "{byte:02x}");
    }
    ContentHash(hex)
}

/// Byte-equality of canonical forms.
pub fn canonical_equal(a: &Value, b: &Value) -> Result<bool, CanonicalError> {
    Ok(canonical_bytes(a)? == canonical_bytes(b)?)
}

/// Normalize values the canonical encoder cannot: `-0.0` becomes `0`.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if f == 0.0 && f.is_sign_negative() {
                    return Value::from(0);
                }
            }
            value.clone()
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect(),
        ),
        _ => value.clone(),
    }
}
