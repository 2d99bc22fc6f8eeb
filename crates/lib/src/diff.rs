//! Change computation between declared and stored state.
//!
//! For every key that is declared, stored, or both, the differ produces one
//! [`ResourceChange`]:
//!
//! - declared only → `Create`
//! - stored only → `Destroy`
//! - both, equal after resolving references → `NoOp`
//! - both, differing only in attributes updatable in place → `Update`
//! - both, differing in any attribute that requires replacement → `Replace`
//!
//! Deposed objects left by an interrupted create-before-destroy replacement
//! produce an extra `Destroy` each.
//!
//! # Plan-time reference resolution
//!
//! A reference to an attribute the target declares resolves to the target's
//! declared (resolved) value. A reference to a provider-computed attribute
//! resolves to the stored output when the target is unchanged, and is
//! otherwise unknown until apply. Unknown values always count as changed.
//!
//! The differ is pure: the same declarations, records and schemas always
//! yield the same list.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::graph::DependencyGraph;
use crate::resource::{
  AttrRef, Attributes, ReferenceResolver, ResolveError, Resolved, ResourceDeclaration, ResourceKey,
};
use crate::schema::{AttrPolicy, SchemaRegistry};
use crate::state::StateRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
  Create,
  Update,
  Replace,
  Destroy,
  NoOp,
}

impl ChangeKind {
  /// Plan symbol, as shown in plan listings.
  pub fn symbol(&self) -> &'static str {
    match self {
      ChangeKind::Create => "+",
      ChangeKind::Update => "~",
      ChangeKind::Replace => "-/+",
      ChangeKind::Destroy => "-",
      ChangeKind::NoOp => " ",
    }
  }
}

impl fmt::Display for ChangeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ChangeKind::Create => "create",
      ChangeKind::Update => "update",
      ChangeKind::Replace => "replace",
      ChangeKind::Destroy => "destroy",
      ChangeKind::NoOp => "no-op",
    };
    f.write_str(name)
  }
}

/// One typed change for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
  pub key: ResourceKey,
  pub kind: ChangeKind,

  /// Stored attributes, if the resource is tracked.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub before: Option<Attributes>,

  /// Declared attributes that are already known, if the resource is declared.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub after: Option<Attributes>,

  /// Declared attributes only known after apply.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub unknown: Vec<String>,

  /// Attribute names whose value differs.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub changed: Vec<String>,

  /// Changed attributes whose policy forces replacement.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub requires_replace: Vec<String>,

  /// Provider id of the deposed object this destroy targets.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub deposed: Option<String>,
}

impl ResourceChange {
  fn destroy(record: &StateRecord) -> Self {
    Self {
      key: record.key.clone(),
      kind: ChangeKind::Destroy,
      before: Some(record.attributes.clone()),
      after: None,
      unknown: Vec::new(),
      changed: Vec::new(),
      requires_replace: Vec::new(),
      deposed: None,
    }
  }

  pub fn is_noop(&self) -> bool {
    self.kind == ChangeKind::NoOp
  }
}

impl fmt::Display for ResourceChange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:>3} {}", self.kind.symbol(), self.key)?;
    if let Some(id) = &self.deposed {
      write!(f, " (deposed {})", id)?;
    }
    if !self.requires_replace.is_empty() {
      write!(f, " (forced by {})", self.requires_replace.join(", "))?;
    }
    Ok(())
  }
}

#[derive(Debug, Error)]
pub enum DiffError {
  #[error("resource {key}: no schema registered for type '{resource_type}'")]
  UnknownResourceType { key: ResourceKey, resource_type: String },

  #[error("resource {key} has prevent_destroy set but the plan would replace it (forced by {})", .attributes.join(", "))]
  PreventDestroy { key: ResourceKey, attributes: Vec<String> },

  #[error("resource {key}, attribute '{attribute}': {source}")]
  Resolve {
    key: ResourceKey,
    attribute: String,
    #[source]
    source: ResolveError,
  },
}

/// Resolution outcome of a declared resource, kept for later references.
struct Evaluated {
  kind: ChangeKind,
  known: Attributes,
  unknown: BTreeSet<String>,
}

struct PlanResolver<'a> {
  declarations: &'a HashMap<ResourceKey, &'a ResourceDeclaration>,
  records: &'a HashMap<ResourceKey, &'a StateRecord>,
  evaluated: &'a HashMap<ResourceKey, Evaluated>,
}

impl ReferenceResolver for PlanResolver<'_> {
  fn resolve_ref(&self, reference: &AttrRef) -> Result<Resolved, ResolveError> {
    let (Some(decl), Some(target)) = (
      self.declarations.get(&reference.key),
      self.evaluated.get(&reference.key),
    ) else {
      return Err(ResolveError::MissingResource(reference.clone()));
    };

    if decl.attributes.contains_key(&reference.attribute) {
      if target.unknown.contains(&reference.attribute) {
        return Ok(Resolved::Unknown);
      }
      return target
        .known
        .get(&reference.attribute)
        .cloned()
        .map(Resolved::Known)
        .ok_or_else(|| ResolveError::MissingAttribute(reference.clone()));
    }

    // Provider-computed attribute: only stable while the target is unchanged.
    if target.kind != ChangeKind::NoOp {
      return Ok(Resolved::Unknown);
    }
    self
      .records
      .get(&reference.key)
      .and_then(|record| record.outputs.get(&reference.attribute))
      .cloned()
      .map(Resolved::Known)
      .ok_or_else(|| ResolveError::MissingAttribute(reference.clone()))
  }
}

/// Compute the change list.
///
/// Declared resources come first in declaration order, then stored resources
/// that are no longer declared in key order, then destroys of deposed objects.
pub fn compute_changes(
  declarations: &[ResourceDeclaration],
  graph: &DependencyGraph,
  records: &[StateRecord],
  schemas: &SchemaRegistry,
) -> Result<Vec<ResourceChange>, DiffError> {
  let declared: HashMap<ResourceKey, &ResourceDeclaration> = declarations.iter().map(|d| (d.key(), d)).collect();
  let stored: HashMap<ResourceKey, &StateRecord> = records.iter().map(|r| (r.key.clone(), r)).collect();

  let mut evaluated: HashMap<ResourceKey, Evaluated> = HashMap::with_capacity(declarations.len());
  let mut changes: HashMap<ResourceKey, ResourceChange> = HashMap::with_capacity(declarations.len());

  // Dependencies first, so every reference sees an already-evaluated target.
  for key in graph.topological_order() {
    let Some(decl) = declared.get(key) else {
      continue;
    };
    let schema = schemas
      .get(&decl.resource_type)
      .ok_or_else(|| DiffError::UnknownResourceType {
        key: key.clone(),
        resource_type: decl.resource_type.clone(),
      })?;

    let mut known = Attributes::new();
    let mut unknown = BTreeSet::new();
    {
      let resolver = PlanResolver {
        declarations: &declared,
        records: &stored,
        evaluated: &evaluated,
      };
      for (name, expr) in &decl.attributes {
        let resolved = expr.resolve(&resolver).map_err(|source| DiffError::Resolve {
          key: key.clone(),
          attribute: name.clone(),
          source,
        })?;
        match resolved {
          Resolved::Known(value) => {
            known.insert(name.clone(), value);
          }
          Resolved::Unknown => {
            unknown.insert(name.clone());
          }
        }
      }
    }

    let record = stored.get(key).copied();
    let (kind, changed, requires_replace) = match record {
      None => {
        let changed: BTreeSet<&String> = known.keys().chain(unknown.iter()).collect();
        (ChangeKind::Create, changed.into_iter().cloned().collect(), Vec::new())
      }
      Some(record) => {
        let changed = changed_attributes(&known, &unknown, &record.attributes);
        let requires_replace: Vec<String> = changed
          .iter()
          .filter(|name| schema.policy(name) == AttrPolicy::RequiresReplace)
          .cloned()
          .collect();
        let kind = if changed.is_empty() {
          ChangeKind::NoOp
        } else if requires_replace.is_empty() {
          ChangeKind::Update
        } else {
          ChangeKind::Replace
        };
        (kind, changed, requires_replace)
      }
    };

    if kind == ChangeKind::Replace && decl.lifecycle.prevent_destroy {
      return Err(DiffError::PreventDestroy {
        key: key.clone(),
        attributes: requires_replace,
      });
    }

    debug!(key = %key, %kind, changed = ?changed, "computed change");

    changes.insert(
      key.clone(),
      ResourceChange {
        key: key.clone(),
        kind,
        before: record.map(|r| r.attributes.clone()),
        after: Some(known.clone()),
        unknown: unknown.iter().cloned().collect(),
        changed,
        requires_replace,
        deposed: None,
      },
    );
    evaluated.insert(key.clone(), Evaluated { kind, known, unknown });
  }

  let mut out: Vec<ResourceChange> = declarations
    .iter()
    .filter_map(|decl| changes.remove(&decl.key()))
    .collect();

  let mut orphans: Vec<&StateRecord> = records.iter().filter(|r| !declared.contains_key(&r.key)).collect();
  orphans.sort_by(|a, b| a.key.cmp(&b.key));
  for record in &orphans {
    debug!(key = %record.key, "resource no longer declared");
    out.push(ResourceChange::destroy(record));
  }

  let mut with_deposed: Vec<&StateRecord> = records.iter().filter(|r| !r.deposed.is_empty()).collect();
  with_deposed.sort_by(|a, b| a.key.cmp(&b.key));
  for record in with_deposed {
    for deposed in &record.deposed {
      out.push(ResourceChange {
        before: Some(deposed.attributes.clone()),
        deposed: Some(deposed.provider_id.clone()),
        ..ResourceChange::destroy(record)
      });
    }
  }

  Ok(out)
}

/// Names of attributes whose declared value differs from the stored one.
fn changed_attributes(known: &Attributes, unknown: &BTreeSet<String>, stored: &Attributes) -> Vec<String> {
  let names: BTreeSet<&String> = known.keys().chain(unknown.iter()).chain(stored.keys()).collect();
  names
    .into_iter()
    .filter(|name| {
      if unknown.contains(*name) {
        return true;
      }
      known.get(*name) != stored.get(*name)
    })
    .cloned()
    .collect()
}
