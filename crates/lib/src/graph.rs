//! Resource dependency graph.
//!
//! Built from the declarations of one manifest. Every attribute reference and
//! every explicit `depends_on` entry becomes an edge from the referenced
//! resource to the resource that references it, so edges point in apply
//! order: dependencies first.
//!
//! Node indices are assigned in declaration order, which makes the
//! declaration index the natural tie-break for a stable topological order.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::debug;

use crate::resource::{ResourceDeclaration, ResourceKey};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  /// The path starts and ends with the same key.
  #[error("dependency cycle detected: {}", render_path(.path))]
  Cycle { path: Vec<ResourceKey> },

  #[error("{from} references '{reference}', but {target} is not declared")]
  UnresolvedReference {
    from: ResourceKey,
    reference: String,
    target: ResourceKey,
  },

  #[error("resource {0} is declared more than once")]
  DuplicateDeclaration(ResourceKey),
}

fn render_path(path: &[ResourceKey]) -> String {
  path.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
}

/// Directed acyclic graph over the declarations of one manifest.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
  /// Edge `a -> b` means `b` depends on `a`.
  graph: DiGraph<ResourceKey, ()>,

  nodes: HashMap<ResourceKey, NodeIndex>,

  /// Dependencies first, ties broken by declaration order.
  order: Vec<ResourceKey>,
}

impl DependencyGraph {
  /// Build the graph and verify it is acyclic.
  ///
  /// # Errors
  ///
  /// - `DuplicateDeclaration` if two declarations share a key.
  /// - `UnresolvedReference` if a reference or `depends_on` entry names a
  ///   resource that is not declared.
  /// - `Cycle` if the references form a cycle, including a resource that
  ///   references itself.
  pub fn build(declarations: &[ResourceDeclaration]) -> Result<Self, GraphError> {
    let mut graph = DiGraph::with_capacity(declarations.len(), 0);
    let mut nodes = HashMap::with_capacity(declarations.len());

    // First pass: one node per declaration, in declaration order
    for decl in declarations {
      let key = decl.key();
      if nodes.contains_key(&key) {
        return Err(GraphError::DuplicateDeclaration(key));
      }
      let idx = graph.add_node(key.clone());
      nodes.insert(key, idx);
    }

    // Second pass: edges from each dependency to its dependent
    for decl in declarations {
      let from = decl.key();
      let dependent_idx = nodes[&from];

      let references = decl
        .references()
        .map(|(_, r)| (r.to_string(), &r.key))
        .chain(decl.depends_on.iter().map(|k| (format!("depends_on {}", k), k)));

      for (reference, target) in references {
        let Some(&dep_idx) = nodes.get(target) else {
          return Err(GraphError::UnresolvedReference {
            from,
            reference,
            target: target.clone(),
          });
        };
        graph.update_edge(dep_idx, dependent_idx, ());
      }
    }

    let mut dag = Self {
      graph,
      nodes,
      order: Vec::new(),
    };

    if let Some(path) = dag.find_cycle() {
      return Err(GraphError::Cycle { path });
    }
    dag.order = dag.stable_toposort();

    debug!(
      resources = dag.graph.node_count(),
      edges = dag.graph.edge_count(),
      "built dependency graph"
    );

    Ok(dag)
  }

  /// Find one cycle, as a path of keys that starts and ends at the same key.
  ///
  /// The path follows dependencies: each key depends on the next.
  fn find_cycle(&self) -> Option<Vec<ResourceKey>> {
    let mut components: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
      .into_iter()
      .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
      .collect();

    for scc in &mut components {
      scc.sort();
    }
    components.sort();

    let scc = components.first()?;
    let members: HashSet<NodeIndex> = scc.iter().copied().collect();
    let start = scc[0];

    let mut path = vec![start];
    let mut visited = HashSet::new();
    if self.walk_back_to(start, start, &members, &mut visited, &mut path) {
      Some(path.into_iter().map(|idx| self.graph[idx].clone()).collect())
    } else {
      None
    }
  }

  fn walk_back_to(
    &self,
    current: NodeIndex,
    target: NodeIndex,
    members: &HashSet<NodeIndex>,
    visited: &mut HashSet<NodeIndex>,
    path: &mut Vec<NodeIndex>,
  ) -> bool {
    for next in self.sorted_neighbors(current, Direction::Incoming) {
      if !members.contains(&next) {
        continue;
      }
      if next == target {
        path.push(next);
        return true;
      }
      if visited.insert(next) {
        path.push(next);
        if self.walk_back_to(next, target, members, visited, path) {
          return true;
        }
        path.pop();
      }
    }
    false
  }

  /// Kahn's algorithm, always picking the earliest-declared ready node.
  fn stable_toposort(&self) -> Vec<ResourceKey> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = in_degree
      .iter()
      .filter(|&(_, &deg)| deg == 0)
      .map(|(&idx, _)| Reverse(idx))
      .collect();

    let mut order = Vec::with_capacity(self.graph.node_count());
    while let Some(Reverse(idx)) = ready.pop() {
      order.push(self.graph[idx].clone());
      for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
        if let Some(deg) = in_degree.get_mut(&dependent) {
          *deg = deg.saturating_sub(1);
          if *deg == 0 {
            ready.push(Reverse(dependent));
          }
        }
      }
    }
    order
  }

  fn sorted_neighbors(&self, idx: NodeIndex, dir: Direction) -> Vec<NodeIndex> {
    let unique: BTreeSet<NodeIndex> = self.graph.neighbors_directed(idx, dir).collect();
    unique.into_iter().collect()
  }

  /// Keys in apply order: dependencies before dependents.
  pub fn topological_order(&self) -> &[ResourceKey] {
    &self.order
  }

  /// Direct dependencies of a resource, in declaration order.
  pub fn dependencies(&self, key: &ResourceKey) -> Vec<ResourceKey> {
    let Some(&idx) = self.nodes.get(key) else {
      return Vec::new();
    };
    self
      .sorted_neighbors(idx, Direction::Incoming)
      .into_iter()
      .map(|dep| self.graph[dep].clone())
      .collect()
  }

  /// Resources that directly depend on `key`, in declaration order.
  pub fn dependents(&self, key: &ResourceKey) -> Vec<ResourceKey> {
    let Some(&idx) = self.nodes.get(key) else {
      return Vec::new();
    };
    self
      .sorted_neighbors(idx, Direction::Outgoing)
      .into_iter()
      .map(|dep| self.graph[dep].clone())
      .collect()
  }

  /// Position of the declaration in the manifest.
  pub fn declaration_index(&self, key: &ResourceKey) -> Option<usize> {
    self.nodes.get(key).map(|idx| idx.index())
  }

  pub fn contains(&self, key: &ResourceKey) -> bool {
    self.nodes.contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  /// All edges as `(dependency, dependent)` pairs.
  pub fn edges(&self) -> Vec<(ResourceKey, ResourceKey)> {
    self
      .graph
      .edge_indices()
      .filter_map(|e| self.graph.edge_endpoints(e))
      .map(|(a, b)| (self.graph[a].clone(), self.graph[b].clone()))
      .collect()
  }
}
