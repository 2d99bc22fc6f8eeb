//! Plan types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::PLAN_FORMAT_VERSION;
use crate::diff::{ChangeKind, ResourceChange};
use crate::resource::{Expr, ResourceKey};
use crate::schema::ReplaceStrategy;
use crate::util::hash::ObjectHash;
use crate::util::unix_now;

/// What a single plan step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
  Create,
  Update,
  Destroy,
}

impl fmt::Display for StepAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StepAction::Create => write!(f, "create"),
      StepAction::Update => write!(f, "update"),
      StepAction::Destroy => write!(f, "destroy"),
    }
  }
}

/// One provider call in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
  pub key: ResourceKey,
  pub action: StepAction,

  /// Declared attribute expressions, resolved against state at apply time.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub attributes: BTreeMap<String, Expr>,

  /// Dependencies recorded in state once the step succeeds.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<ResourceKey>,

  /// Set when the step is one half of a replacement.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub replacement: Option<ReplaceStrategy>,

  /// For destroys: provider id of the deposed object to remove instead of
  /// the current instance.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub deposed: Option<String>,
}

impl PlanStep {
  pub fn destroy(key: ResourceKey) -> Self {
    Self {
      key,
      action: StepAction::Destroy,
      attributes: BTreeMap::new(),
      dependencies: Vec::new(),
      replacement: None,
      deposed: None,
    }
  }

  pub fn destroy_deposed(key: ResourceKey, provider_id: impl Into<String>) -> Self {
    Self {
      deposed: Some(provider_id.into()),
      ..Self::destroy(key)
    }
  }

  pub fn apply(
    key: ResourceKey,
    action: StepAction,
    attributes: BTreeMap<String, Expr>,
    dependencies: Vec<ResourceKey>,
  ) -> Self {
    Self {
      key,
      action,
      attributes,
      dependencies,
      replacement: None,
      deposed: None,
    }
  }

  pub fn with_replacement(mut self, strategy: ReplaceStrategy) -> Self {
    self.replacement = Some(strategy);
    self
  }

  /// Whether this step destroys the current instance of its resource.
  pub fn destroys_current(&self) -> bool {
    self.action == StepAction::Destroy && self.deposed.is_none()
  }
}

impl fmt::Display for PlanStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.action, self.key)?;
    if let Some(id) = &self.deposed {
      write!(f, " (deposed {})", id)?;
    }
    Ok(())
  }
}

/// Counts of planned changes by kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
  pub create: usize,
  pub update: usize,
  pub replace: usize,
  pub destroy: usize,
  pub unchanged: usize,
}

impl PlanSummary {
  pub fn from_changes(changes: &[ResourceChange]) -> Self {
    let mut summary = Self::default();
    for change in changes {
      match change.kind {
        ChangeKind::Create => summary.create += 1,
        ChangeKind::Update => summary.update += 1,
        ChangeKind::Replace => summary.replace += 1,
        ChangeKind::Destroy => summary.destroy += 1,
        ChangeKind::NoOp => summary.unchanged += 1,
      }
    }
    summary
  }
}

impl fmt::Display for PlanSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} to create, {} to update, {} to replace, {} to destroy, {} unchanged",
      self.create, self.update, self.replace, self.destroy, self.unchanged
    )
  }
}

#[derive(Debug, Error)]
pub enum PlanError {
  /// The requested ordering constraints contradict each other.
  #[error("plan steps cannot be ordered, cycle among: {}", .steps.join(", "))]
  OrderingCycle { steps: Vec<String> },

  #[error("unsupported plan version {0}")]
  UnsupportedVersion(u32),

  #[error("failed to parse plan: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize plan: {0}")]
  Serialize(#[source] serde_json::Error),
}

/// An ordered, immutable set of steps computed against one state snapshot.
///
/// A plan is either fully applied or abandoned. It is not resumable after a
/// failed step: compute a new plan instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
  version: u32,
  created_at: u64,
  state_fingerprint: ObjectHash,
  changes: Vec<ResourceChange>,
  steps: Vec<PlanStep>,
}

impl Plan {
  pub(crate) fn new(changes: Vec<ResourceChange>, steps: Vec<PlanStep>, state_fingerprint: ObjectHash) -> Self {
    Self {
      version: PLAN_FORMAT_VERSION,
      created_at: unix_now(),
      state_fingerprint,
      changes,
      steps,
    }
  }

  /// Steps in execution order.
  pub fn steps(&self) -> &[PlanStep] {
    &self.steps
  }

  /// Every computed change, including no-ops, in listing order.
  pub fn changes(&self) -> &[ResourceChange] {
    &self.changes
  }

  pub fn summary(&self) -> PlanSummary {
    PlanSummary::from_changes(&self.changes)
  }

  /// True when applying the plan would call no provider.
  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }

  /// Fingerprint of the state the plan was computed against.
  pub fn state_fingerprint(&self) -> &ObjectHash {
    &self.state_fingerprint
  }

  pub fn created_at(&self) -> u64 {
    self.created_at
  }

  pub fn to_json(&self) -> Result<String, PlanError> {
    serde_json::to_string_pretty(self).map_err(PlanError::Serialize)
  }

  pub fn from_json(content: &str) -> Result<Self, PlanError> {
    let plan: Plan = serde_json::from_str(content).map_err(PlanError::Parse)?;
    if plan.version != PLAN_FORMAT_VERSION {
      return Err(PlanError::UnsupportedVersion(plan.version));
    }
    Ok(plan)
  }
}

impl fmt::Display for Plan {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for change in self.changes.iter().filter(|c| !c.is_noop()) {
      writeln!(f, "{}", change)?;
    }
    write!(f, "Plan: {}", self.summary())
  }
}
