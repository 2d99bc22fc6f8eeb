//! State record types and errors.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::{Attributes, KeyError, ResourceKey, Value};
use crate::util::unix_now;

use super::lock::LockError;

/// An old instance left behind by a create-before-destroy replacement.
///
/// It stays attached to the new record until its destroy step succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeposedObject {
  pub provider_id: String,

  pub attributes: Attributes,

  #[serde(default, skip_serializing_if = "Attributes::is_empty")]
  pub outputs: Attributes,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<ResourceKey>,
}

/// Last-applied state of one tracked resource.
///
/// Created on the first successful apply, replaced on every later one and
/// removed when the resource is destroyed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
  pub key: ResourceKey,

  /// Opaque id assigned by the provider on create.
  pub provider_id: String,

  /// Resolved input attributes as last applied.
  pub attributes: Attributes,

  /// Attributes reported back by the provider.
  #[serde(default, skip_serializing_if = "Attributes::is_empty")]
  pub outputs: Attributes,

  /// Keys this resource depended on when it was applied.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<ResourceKey>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub deposed: Vec<DeposedObject>,

  /// Unix timestamp (seconds) of the last successful apply.
  pub updated_at: u64,
}

impl StateRecord {
  pub fn new(key: ResourceKey, provider_id: impl Into<String>, attributes: Attributes, outputs: Attributes) -> Self {
    Self {
      key,
      provider_id: provider_id.into(),
      attributes,
      outputs,
      dependencies: Vec::new(),
      deposed: Vec::new(),
      updated_at: unix_now(),
    }
  }

  pub fn with_dependencies(mut self, dependencies: Vec<ResourceKey>) -> Self {
    self.dependencies = dependencies;
    self
  }

  /// Look up an attribute, preferring applied inputs over provider outputs.
  pub fn value(&self, attribute: &str) -> Option<&Value> {
    self.attributes.get(attribute).or_else(|| self.outputs.get(attribute))
  }

  /// Turn the current instance into a deposed object.
  pub fn to_deposed(&self) -> DeposedObject {
    DeposedObject {
      provider_id: self.provider_id.clone(),
      attributes: self.attributes.clone(),
      outputs: self.outputs.clone(),
      dependencies: self.dependencies.clone(),
    }
  }
}

#[derive(Debug, Error)]
pub enum StateError {
  #[error("failed to create state directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse state record {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize state record: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported state record version {version} in {path}")]
  UnsupportedVersion { path: PathBuf, version: u32 },

  #[error("state record {path} holds {found}, expected {expected}")]
  KeyMismatch {
    path: PathBuf,
    expected: ResourceKey,
    found: ResourceKey,
  },

  #[error("cannot store resource {key}: {source}")]
  InvalidKey {
    key: ResourceKey,
    #[source]
    source: KeyError,
  },

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("state store lock poisoned")]
  Poisoned,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record() -> StateRecord {
    let mut attributes = Attributes::new();
    attributes.insert("size".to_string(), Value::from("small"));
    let mut outputs = Attributes::new();
    outputs.insert("address".to_string(), Value::from("10.0.0.5"));
    outputs.insert("size".to_string(), Value::from("ignored"));
    StateRecord::new(ResourceKey::new("db", "main"), "db-1", attributes, outputs)
  }

  #[test]
  fn value_prefers_inputs() {
    let record = record();
    assert_eq!(record.value("size"), Some(&Value::from("small")));
    assert_eq!(record.value("address"), Some(&Value::from("10.0.0.5")));
    assert_eq!(record.value("missing"), None);
  }

  #[test]
  fn serialization_omits_empty_collections() {
    let mut record = record();
    record.updated_at = 42;
    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["key"], "db.main");
    assert!(json.get("dependencies").is_none());
    assert!(json.get("deposed").is_none());

    let back: StateRecord = serde_json::from_value(json).unwrap();
    assert_eq!(back, record);
  }

  #[test]
  fn deposed_copies_instance() {
    let record = record().with_dependencies(vec![ResourceKey::new("net", "core")]);
    let deposed = record.to_deposed();
    assert_eq!(deposed.provider_id, "db-1");
    assert_eq!(deposed.dependencies, record.dependencies);
    assert_eq!(deposed.outputs, record.outputs);
  }
}
