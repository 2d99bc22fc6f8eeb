//! Ordering of change operations into plan steps.
//!
//! Every change expands to zero, one or two steps. Steps become nodes of a
//! step graph whose edges encode:
//!
//! - create/update of a dependency before create/update of its dependents
//! - destroy of a dependent before destroy of its dependencies, using the
//!   dependencies recorded in state (the declarations may no longer mention
//!   the destroyed resource)
//! - destroy-before-create replacement: destroy, then create
//! - create-before-destroy replacement: create, then every create/update of
//!   a dependent, then destroy of the old instance
//! - destroys of deposed objects before destroy of the current instance
//!
//! Ties are broken by declaration order, then by key for resources that are
//! only tracked in state.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, warn};

use crate::diff::{ChangeKind, ResourceChange};
use crate::graph::DependencyGraph;
use crate::resource::{ResourceDeclaration, ResourceKey};
use crate::schema::{ReplaceStrategy, SchemaRegistry};
use crate::state::StateRecord;

use super::types::{PlanError, PlanStep, StepAction};

/// Everything the orderer needs besides the change list.
#[derive(Debug, Clone, Copy)]
pub struct OrderContext<'a> {
  pub declarations: &'a [ResourceDeclaration],
  pub graph: &'a DependencyGraph,
  pub records: &'a [StateRecord],
  pub schemas: &'a SchemaRegistry,
  /// Per-type replacement order overrides from settings.
  pub strategy_overrides: &'a BTreeMap<String, ReplaceStrategy>,
}

impl OrderContext<'_> {
  /// Replacement order for one declaration.
  ///
  /// The declaration's lifecycle wins over the settings override, which wins
  /// over the schema default.
  pub fn strategy_for(&self, decl: &ResourceDeclaration) -> ReplaceStrategy {
    if let Some(cbd) = decl.lifecycle.create_before_destroy {
      return if cbd {
        ReplaceStrategy::CreateBeforeDestroy
      } else {
        ReplaceStrategy::DestroyBeforeCreate
      };
    }
    if let Some(strategy) = self.strategy_overrides.get(&decl.resource_type) {
      return *strategy;
    }
    self
      .schemas
      .get(&decl.resource_type)
      .map(|s| s.replace_strategy)
      .unwrap_or_default()
  }
}

/// Steps generated for one key, by role.
#[derive(Default)]
struct KeySteps {
  apply: Option<usize>,
  destroy_current: Option<usize>,
  /// Destroy of the old instance of a create-before-destroy replacement.
  destroy_replaced: Option<usize>,
  destroy_deposed: Vec<usize>,
}

impl KeySteps {
  /// Every step that destroys some instance of this key.
  fn destroys(&self) -> impl Iterator<Item = usize> + '_ {
    self
      .destroy_current
      .iter()
      .chain(self.destroy_replaced.iter())
      .chain(self.destroy_deposed.iter())
      .copied()
  }
}

/// Order a change list into plan steps.
pub fn order_changes(changes: &[ResourceChange], ctx: OrderContext<'_>) -> Result<Vec<PlanStep>, PlanError> {
  let declared: HashMap<ResourceKey, &ResourceDeclaration> = ctx.declarations.iter().map(|d| (d.key(), d)).collect();
  let stored: HashMap<&ResourceKey, &StateRecord> = ctx.records.iter().map(|r| (&r.key, r)).collect();
  let strategies = replace_strategies(changes, &declared, &ctx);

  let rank = |key: &ResourceKey| -> usize {
    ctx
      .graph
      .declaration_index(key)
      .unwrap_or_else(|| ctx.declarations.len() + orphan_position(ctx.records, &declared, key))
  };

  // Generate steps, remembering which role each plays for its key.
  let mut generated: Vec<(usize, usize, PlanStep)> = Vec::new();
  let mut push = |step: PlanStep| {
    let seq = generated.len();
    generated.push((rank(&step.key), seq, step));
  };

  for change in changes {
    let key = &change.key;
    let apply_step = |action: StepAction| {
      let decl = declared.get(key);
      PlanStep::apply(
        key.clone(),
        action,
        decl.map(|d| d.attributes.clone()).unwrap_or_default(),
        ctx.graph.dependencies(key),
      )
    };

    match change.kind {
      ChangeKind::NoOp => {}
      ChangeKind::Create => push(apply_step(StepAction::Create)),
      ChangeKind::Update => push(apply_step(StepAction::Update)),
      ChangeKind::Destroy => match &change.deposed {
        Some(id) => push(PlanStep::destroy_deposed(key.clone(), id.clone())),
        None => push(PlanStep::destroy(key.clone())),
      },
      ChangeKind::Replace => {
        let strategy = strategies.get(key).copied().unwrap_or_default();
        match strategy {
          ReplaceStrategy::DestroyBeforeCreate => {
            push(PlanStep::destroy(key.clone()).with_replacement(strategy));
            push(apply_step(StepAction::Create).with_replacement(strategy));
          }
          ReplaceStrategy::CreateBeforeDestroy => {
            let old_id = stored.get(key).map(|r| r.provider_id.clone()).unwrap_or_default();
            push(apply_step(StepAction::Create).with_replacement(strategy));
            push(PlanStep::destroy_deposed(key.clone(), old_id).with_replacement(strategy));
          }
        }
      }
    }
  }

  // Sort by (rank, generation order) so node index order is the tie-break order.
  generated.sort_by_key(|(rank, seq, _)| (*rank, *seq));
  let steps: Vec<PlanStep> = generated.into_iter().map(|(_, _, step)| step).collect();

  let mut by_key: HashMap<ResourceKey, KeySteps> = HashMap::new();
  for (idx, step) in steps.iter().enumerate() {
    let entry = by_key.entry(step.key.clone()).or_default();
    match (step.action, &step.deposed, step.replacement) {
      (StepAction::Create | StepAction::Update, _, _) => entry.apply = Some(idx),
      (StepAction::Destroy, None, _) => entry.destroy_current = Some(idx),
      (StepAction::Destroy, Some(_), Some(ReplaceStrategy::CreateBeforeDestroy)) => entry.destroy_replaced = Some(idx),
      (StepAction::Destroy, Some(_), _) => entry.destroy_deposed.push(idx),
    }
  }

  let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(steps.len(), 0);
  let nodes: Vec<NodeIndex> = (0..steps.len()).map(|i| graph.add_node(i)).collect();
  let mut edge = |from: usize, to: usize| {
    if from != to {
      graph.update_edge(nodes[from], nodes[to], ());
    }
  };

  for (key, roles) in &by_key {
    // Replacement halves.
    if let (Some(apply), Some(destroy)) = (roles.apply, roles.destroy_current) {
      edge(destroy, apply);
    }
    if let (Some(apply), Some(destroy)) = (roles.apply, roles.destroy_replaced) {
      edge(apply, destroy);
    }

    // Deposed objects go before the current instance.
    if let Some(current) = roles.destroy_current {
      for &deposed in &roles.destroy_deposed {
        edge(deposed, current);
      }
    }

    // Apply order follows declared dependencies.
    if let Some(apply) = roles.apply {
      for dep in ctx.graph.dependencies(key) {
        if let Some(dep_apply) = by_key.get(&dep).and_then(|r| r.apply) {
          edge(dep_apply, apply);
        }
      }
    }

    // Dependents of a create-before-destroy replacement are applied before
    // the old instance goes away.
    if let Some(replaced) = roles.destroy_replaced {
      for dependent in ctx.graph.dependents(key) {
        if let Some(dependent_apply) = by_key.get(&dependent).and_then(|r| r.apply) {
          edge(dependent_apply, replaced);
        }
      }
    }

    // Destroy order is the reverse of the dependencies recorded in state.
    if let Some(record) = stored.get(key) {
      let current_and_replaced: Vec<usize> = roles
        .destroy_current
        .iter()
        .chain(roles.destroy_replaced.iter())
        .copied()
        .collect();
      for dep in &record.dependencies {
        if let Some(dep_roles) = by_key.get(dep) {
          for from in &current_and_replaced {
            for to in dep_roles.destroys() {
              edge(*from, to);
            }
          }
        }
      }

      for deposed in &record.deposed {
        let Some(&idx) = roles
          .destroy_deposed
          .iter()
          .chain(roles.destroy_replaced.iter())
          .find(|&&i| steps[i].deposed.as_deref() == Some(deposed.provider_id.as_str()))
        else {
          continue;
        };
        for dep in &deposed.dependencies {
          if let Some(dep_roles) = by_key.get(dep) {
            for to in dep_roles.destroys() {
              edge(idx, to);
            }
          }
        }
      }
    }
  }

  let order = stable_toposort(&graph, &steps)?;
  debug!(steps = order.len(), "ordered plan steps");

  let mut slots: Vec<Option<PlanStep>> = steps.into_iter().map(Some).collect();
  Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

/// Position of an undeclared key among all undeclared stored keys.
fn orphan_position(
  records: &[StateRecord],
  declared: &HashMap<ResourceKey, &ResourceDeclaration>,
  key: &ResourceKey,
) -> usize {
  records
    .iter()
    .filter(|r| !declared.contains_key(&r.key) && &r.key < key)
    .count()
}

/// Choose the replacement order for every replaced resource.
///
/// A create-before-destroy resource forces create-before-destroy on the
/// replaced resources it depends on; otherwise the old dependency would have
/// to be destroyed before the dependent's new instance exists, while the
/// dependent's old instance still needs it.
fn replace_strategies(
  changes: &[ResourceChange],
  declared: &HashMap<ResourceKey, &ResourceDeclaration>,
  ctx: &OrderContext<'_>,
) -> HashMap<ResourceKey, ReplaceStrategy> {
  let replaced: HashSet<&ResourceKey> = changes
    .iter()
    .filter(|c| c.kind == ChangeKind::Replace)
    .map(|c| &c.key)
    .collect();

  let mut strategies: HashMap<ResourceKey, ReplaceStrategy> = replaced
    .iter()
    .filter_map(|key| declared.get(*key).map(|decl| ((*key).clone(), ctx.strategy_for(decl))))
    .collect();

  // Dependents before dependencies, so promotion flows down the graph.
  for key in ctx.graph.topological_order().iter().rev() {
    if strategies.get(key) != Some(&ReplaceStrategy::CreateBeforeDestroy) {
      continue;
    }
    for dep in ctx.graph.dependencies(key) {
      if let Some(strategy) = strategies.get_mut(&dep)
        && *strategy == ReplaceStrategy::DestroyBeforeCreate
      {
        warn!(
          key = %dep,
          dependent = %key,
          "replacing with create_before_destroy because a dependent requires it"
        );
        *strategy = ReplaceStrategy::CreateBeforeDestroy;
      }
    }
  }

  strategies
}

/// Kahn's algorithm over the step graph, always taking the lowest ready index.
fn stable_toposort(graph: &DiGraph<usize, ()>, steps: &[PlanStep]) -> Result<Vec<usize>, PlanError> {
  let mut in_degree: Vec<usize> = graph
    .node_indices()
    .map(|idx| graph.neighbors_directed(idx, Direction::Incoming).count())
    .collect();

  let mut ready: BinaryHeap<Reverse<usize>> = in_degree
    .iter()
    .enumerate()
    .filter(|(_, deg)| **deg == 0)
    .map(|(i, _)| Reverse(i))
    .collect();

  let mut order = Vec::with_capacity(steps.len());
  while let Some(Reverse(i)) = ready.pop() {
    order.push(i);
    for next in graph.neighbors_directed(NodeIndex::new(i), Direction::Outgoing) {
      let deg = &mut in_degree[next.index()];
      *deg = deg.saturating_sub(1);
      if *deg == 0 {
        ready.push(Reverse(next.index()));
      }
    }
  }

  if order.len() < steps.len() {
    let placed: HashSet<usize> = order.iter().copied().collect();
    let stuck = (0..steps.len())
      .filter(|i| !placed.contains(i))
      .map(|i| steps[i].to_string())
      .collect();
    return Err(PlanError::OrderingCycle { steps: stuck });
  }

  Ok(order)
}
