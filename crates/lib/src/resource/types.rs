use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::expr::{AttrRef, Expr};
use super::key::ResourceKey;

/// Per-declaration lifecycle overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Lifecycle {
  /// Overrides the resource type's replacement order when set.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub create_before_destroy: Option<bool>,

  /// Refuse to plan any change that would destroy this resource.
  pub prevent_destroy: bool,
}

/// One declared resource: its identity and attribute expressions.
///
/// Immutable once parsed for a planning cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDeclaration {
  #[serde(rename = "type")]
  pub resource_type: String,

  pub name: String,

  /// Attribute name → expression, ordered by name.
  #[serde(default)]
  pub attributes: BTreeMap<String, Expr>,

  /// Explicit dependencies that no attribute references.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub depends_on: Vec<ResourceKey>,

  #[serde(default)]
  pub lifecycle: Lifecycle,
}

impl ResourceDeclaration {
  pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      resource_type: resource_type.into(),
      name: name.into(),
      attributes: BTreeMap::new(),
      depends_on: Vec::new(),
      lifecycle: Lifecycle::default(),
    }
  }

  pub fn key(&self) -> ResourceKey {
    ResourceKey::new(self.resource_type.clone(), self.name.clone())
  }

  /// Set an attribute expression.
  pub fn with_attr(mut self, name: impl Into<String>, expr: impl Into<Expr>) -> Self {
    self.attributes.insert(name.into(), expr.into());
    self
  }

  pub fn with_depends_on(mut self, key: ResourceKey) -> Self {
    self.depends_on.push(key);
    self
  }

  pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
    self.lifecycle = lifecycle;
    self
  }

  /// Every attribute reference with the attribute it appears in.
  pub fn references(&self) -> impl Iterator<Item = (&str, &AttrRef)> {
    self
      .attributes
      .iter()
      .flat_map(|(name, expr)| expr.references().into_iter().map(move |r| (name.as_str(), r)))
  }
}
