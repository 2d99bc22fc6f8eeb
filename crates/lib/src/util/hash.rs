//! Hashing utilities for plan and state fingerprints.
//!
//! A fingerprint is a truncated SHA-256 over the JSON serialization of a
//! value. Plans record the fingerprint of the state they were computed
//! against so a saved plan can detect that the state moved underneath it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consts::OBJ_HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// A content-addressed hash identifying a serialized value.
///
/// The hash is a 20-character truncated SHA-256 of the JSON-serialized value,
/// as a lowercase hexadecimal string, e.g. `"a1b2c3d4e5f6789012ab"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    let serialized = serde_json::to_string(self)?;
    Ok(hash_str(&serialized))
  }
}

impl<T: Serialize> Hashable for [T] {}

impl<T: Serialize> Hashable for Vec<T> {}

/// Hash a string into a truncated [`ObjectHash`].
pub fn hash_str(data: &str) -> ObjectHash {
  let mut hasher = Sha256::new();
  hasher.update(data.as_bytes());
  let full = format!("{:x}", hasher.finalize());
  ObjectHash(full[..OBJ_HASH_PREFIX_LEN].to_string())
}
