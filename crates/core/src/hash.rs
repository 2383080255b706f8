//! Content-addressed hashing.
//!
//! Everything the engine stores is named by an [`ObjectHash`]: the
//! URL-safe base64 rendering (no padding) of a SHA-256 digest. The
//! encoding is filename-safe, so a hash is used verbatim as a store
//! directory name.
//!
//! Structured values are hashed through their canonical JSON encoding.
//! Determinism holds because every hashed type serializes ordered
//! collections (`Vec`, `BTreeSet`, `BTreeMap`) and plain strings; two
//! equal values always produce the same byte stream.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the rendered hash: 32 digest bytes in unpadded base64.
pub const HASH_LEN: usize = 43;

/// A content-addressed identity, rendered ready for use as a directory
/// name under `_pier/artifact/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(String);

impl ObjectHash {
  /// Hash raw bytes.
  pub fn of_bytes(bytes: &[u8]) -> ObjectHash {
    ObjectHash(URL_SAFE_NO_PAD.encode(Sha256::digest(bytes)))
  }

  /// Hash a serializable value under a domain-separation tag.
  ///
  /// The tag keeps different rules from colliding on structurally equal
  /// payloads.
  pub fn of_value<T: Serialize>(tag: &str, value: &T) -> Result<ObjectHash, serde_json::Error> {
    let encoded = serde_json::to_vec(&(tag, value))?;
    Ok(ObjectHash::of_bytes(&encoded))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hash_is_fixed_length_and_filename_safe() {
    let hash = ObjectHash::of_bytes(b"hello");
    assert_eq!(hash.as_str().len(), HASH_LEN);
    assert!(
      hash
        .as_str()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    );
  }

  #[test]
  fn hash_is_deterministic() {
    assert_eq!(ObjectHash::of_bytes(b"x"), ObjectHash::of_bytes(b"x"));
    assert_ne!(ObjectHash::of_bytes(b"x"), ObjectHash::of_bytes(b"y"));
  }

  #[test]
  fn tag_separates_domains() {
    let a = ObjectHash::of_value("ruleA", &"payload").unwrap();
    let b = ObjectHash::of_value("ruleB", &"payload").unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn serde_roundtrip() {
    let hash = ObjectHash::of_bytes(b"roundtrip");
    let json = serde_json::to_string(&hash).unwrap();
    let back: ObjectHash = serde_json::from_str(&json).unwrap();
    assert_eq!(hash, back);
  }
}
