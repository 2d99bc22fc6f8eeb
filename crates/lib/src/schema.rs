//! Static per-type attribute policy table.
//!
//! Each resource type declares, per attribute name, whether a change to that
//! attribute can be applied in place or forces the resource to be replaced.
//! Policies are declared up front by the provider, never inferred from
//! observed behavior.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// How a change to one attribute is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrPolicy {
  /// The provider can change the attribute on the existing resource.
  #[default]
  UpdateInPlace,
  /// The resource must be destroyed and created again.
  RequiresReplace,
}

/// Order of the two halves of a replacement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
  #[default]
  DestroyBeforeCreate,
  CreateBeforeDestroy,
}

impl fmt::Display for ReplaceStrategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ReplaceStrategy::DestroyBeforeCreate => write!(f, "destroy_before_create"),
      ReplaceStrategy::CreateBeforeDestroy => write!(f, "create_before_destroy"),
    }
  }
}

/// Attribute policies for one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
  pub resource_type: String,

  /// Explicit per-attribute policies.
  #[serde(default)]
  pub attributes: BTreeMap<String, AttrPolicy>,

  /// Policy for attributes not listed in `attributes`.
  #[serde(default)]
  pub default_policy: AttrPolicy,

  /// Default replacement order for this type.
  #[serde(default)]
  pub replace_strategy: ReplaceStrategy,
}

impl ResourceSchema {
  pub fn new(resource_type: impl Into<String>) -> Self {
    Self {
      resource_type: resource_type.into(),
      attributes: BTreeMap::new(),
      default_policy: AttrPolicy::default(),
      replace_strategy: ReplaceStrategy::default(),
    }
  }

  /// Mark an attribute as updatable in place.
  pub fn updatable(mut self, attribute: impl Into<String>) -> Self {
    self.attributes.insert(attribute.into(), AttrPolicy::UpdateInPlace);
    self
  }

  /// Mark an attribute as forcing replacement when it changes.
  pub fn force_new(mut self, attribute: impl Into<String>) -> Self {
    self.attributes.insert(attribute.into(), AttrPolicy::RequiresReplace);
    self
  }

  pub fn with_default_policy(mut self, policy: AttrPolicy) -> Self {
    self.default_policy = policy;
    self
  }

  pub fn with_replace_strategy(mut self, strategy: ReplaceStrategy) -> Self {
    self.replace_strategy = strategy;
    self
  }

  /// Policy for a named attribute, falling back to the default policy.
  pub fn policy(&self, attribute: &str) -> AttrPolicy {
    self.attributes.get(attribute).copied().unwrap_or(self.default_policy)
  }
}

/// Schemas for every known resource type.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
  schemas: BTreeMap<String, ResourceSchema>,
}

impl SchemaRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a schema, replacing any previous schema for the same type.
  pub fn register(&mut self, schema: ResourceSchema) {
    self.schemas.insert(schema.resource_type.clone(), schema);
  }

  pub fn with(mut self, schema: ResourceSchema) -> Self {
    self.register(schema);
    self
  }

  pub fn get(&self, resource_type: &str) -> Option<&ResourceSchema> {
    self.schemas.get(resource_type)
  }

  pub fn contains(&self, resource_type: &str) -> bool {
    self.schemas.contains_key(resource_type)
  }

  pub fn len(&self) -> usize {
    self.schemas.len()
  }

  pub fn is_empty(&self) -> bool {
    self.schemas.is_empty()
  }
}
