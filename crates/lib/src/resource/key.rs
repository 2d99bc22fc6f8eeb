use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Stable identity of a resource: its type plus a name unique within that type.
///
/// Rendered and parsed as `type.name`, e.g. `db_instance.main`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
  pub resource_type: String,
  pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
  #[error("resource key '{0}' must have the form 'type.name'")]
  Malformed(String),

  #[error("invalid identifier '{0}': expected ASCII letters, digits, '_' or '-'")]
  InvalidIdentifier(String),
}

impl ResourceKey {
  pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      resource_type: resource_type.into(),
      name: name.into(),
    }
  }

  /// Build a key after checking that both parts are valid identifiers.
  pub fn parse_parts(resource_type: &str, name: &str) -> Result<Self, KeyError> {
    validate_identifier(resource_type)?;
    validate_identifier(name)?;
    Ok(Self::new(resource_type, name))
  }
}

/// Check that `s` is a non-empty run of ASCII alphanumerics, `_` or `-`.
pub fn validate_identifier(s: &str) -> Result<(), KeyError> {
  let valid = !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
  if valid {
    Ok(())
  } else {
    Err(KeyError::InvalidIdentifier(s.to_string()))
  }
}

impl fmt::Display for ResourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.resource_type, self.name)
  }
}

impl FromStr for ResourceKey {
  type Err = KeyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (resource_type, name) = s.split_once('.').ok_or_else(|| KeyError::Malformed(s.to_string()))?;
    if name.contains('.') {
      return Err(KeyError::Malformed(s.to_string()));
    }
    Self::parse_parts(resource_type, name)
  }
}

impl Serialize for ResourceKey {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for ResourceKey {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}
