//! Manifest types.
//!
//! # Structure
//!
//! ```json
//! {
//!   "resources": [
//!     { "type": "db_instance", "name": "main", "attributes": { "size": "small" } },
//!     {
//!       "type": "web_server",
//!       "name": "front",
//!       "attributes": { "db_host": "${db_instance.main.address}" }
//!     }
//!   ]
//! }
//! ```
//!
//! # Ordering
//!
//! Declarations keep the order they were written in. That order is the
//! tie-break whenever the dependency graph leaves two operations unordered,
//! so plans are deterministic for a given manifest.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::{KeyError, ResourceDeclaration, ResourceKey};

/// The complete declared state for one run.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
  /// All declarations, in declaration order.
  #[serde(default)]
  pub resources: Vec<ResourceDeclaration>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to read manifest {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse manifest: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("invalid declaration '{resource_type}.{name}': {source}")]
  InvalidKey {
    resource_type: String,
    name: String,
    #[source]
    source: KeyError,
  },
}

impl Manifest {
  pub fn new(resources: Vec<ResourceDeclaration>) -> Self {
    Self { resources }
  }

  /// Parse a manifest from a JSON document and validate declaration keys.
  pub fn from_json_str(content: &str) -> Result<Self, ManifestError> {
    let manifest: Manifest = serde_json::from_str(content).map_err(ManifestError::Parse)?;
    manifest.validate()?;
    Ok(manifest)
  }

  /// Load a manifest from a JSON file.
  pub fn load(path: &Path) -> Result<Self, ManifestError> {
    let content = fs::read_to_string(path).map_err(|source| ManifestError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json_str(&content)
  }

  /// Check that every declaration has a well-formed key.
  ///
  /// Duplicate keys and dangling references are graph errors and are
  /// reported when the dependency graph is built.
  pub fn validate(&self) -> Result<(), ManifestError> {
    for decl in &self.resources {
      ResourceKey::parse_parts(&decl.resource_type, &decl.name).map_err(|source| ManifestError::InvalidKey {
        resource_type: decl.resource_type.clone(),
        name: decl.name.clone(),
        source,
      })?;
    }
    Ok(())
  }

  pub fn keys(&self) -> impl Iterator<Item = ResourceKey> + '_ {
    self.resources.iter().map(ResourceDeclaration::key)
  }

  pub fn get(&self, key: &ResourceKey) -> Option<&ResourceDeclaration> {
    self
      .resources
      .iter()
      .find(|d| d.resource_type == key.resource_type && d.name == key.name)
  }

  pub fn len(&self) -> usize {
    self.resources.len()
  }

  pub fn is_empty(&self) -> bool {
    self.resources.is_empty()
  }
}
