//! Reconciliation orchestration.
//!
//! Ties the pieces together for one run:
//!
//! 1. Lock the state store
//! 2. Build the dependency graph from the declarations
//! 3. Diff declarations against every stored record
//! 4. Order the changes into a plan
//! 5. Execute the plan, recording each step in the store
//!
//! The lock is held from step 2 until execution completes or aborts. Graph,
//! diff and ordering errors abort before any provider is called, so a failed
//! plan never mutates state.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::diff::{DiffError, compute_changes};
use crate::execute::{ApplyOptions, ApplyResult, ExecuteError, ProviderRegistry, execute_plan};
use crate::graph::{DependencyGraph, GraphError};
use crate::manifest::{Manifest, ManifestError};
use crate::plan::{OrderContext, Plan, PlanError, order_changes};
use crate::resource::ResourceDeclaration;
use crate::schema::{ReplaceStrategy, SchemaRegistry};
use crate::settings::Settings;
use crate::state::{FileStateStore, LockMode, StateError, StateRecord, StateStore, fingerprint};
use crate::util::hash::{Hashable, ObjectHash};

#[derive(Debug, Error)]
pub enum ReconcileError {
  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Diff(#[from] DiffError),

  #[error(transparent)]
  Plan(#[from] PlanError),

  #[error(transparent)]
  State(#[from] StateError),

  #[error(transparent)]
  Execute(#[from] ExecuteError),

  /// The state changed after the saved plan was computed.
  #[error("saved plan is stale: computed against state {expected}, current state is {actual}")]
  StalePlan { expected: ObjectHash, actual: ObjectHash },
}

/// A plan together with the outcome of executing it.
#[derive(Debug)]
pub struct ApplyReport {
  pub plan: Plan,
  pub result: ApplyResult,
}

/// Build a plan without touching the store or any provider.
///
/// `records` must be the full store contents, sorted by key.
pub fn build_plan(
  declarations: &[ResourceDeclaration],
  records: &[StateRecord],
  schemas: &SchemaRegistry,
  strategy_overrides: &BTreeMap<String, ReplaceStrategy>,
) -> Result<Plan, ReconcileError> {
  let graph = DependencyGraph::build(declarations)?;
  debug!(resources = graph.len(), "dependency graph built");

  let changes = compute_changes(declarations, &graph, records, schemas)?;
  let steps = order_changes(
    &changes,
    OrderContext {
      declarations,
      graph: &graph,
      records,
      schemas,
      strategy_overrides,
    },
  )?;

  let state_fingerprint = records.compute_hash().map_err(StateError::Serialize)?;
  let plan = Plan::new(changes, steps, state_fingerprint);
  info!(steps = plan.steps().len(), summary = %plan.summary(), "plan computed");
  Ok(plan)
}

/// Plans and applies manifests against one state store.
pub struct Reconciler {
  store: Arc<dyn StateStore>,
  providers: ProviderRegistry,
  settings: Settings,
}

impl Reconciler {
  pub fn new(store: Arc<dyn StateStore>, providers: ProviderRegistry) -> Self {
    Self {
      store,
      providers,
      settings: Settings::default(),
    }
  }

  /// Reconciler backed by a file store at `settings.state_dir`.
  pub fn open(settings: Settings, providers: ProviderRegistry) -> Result<Self, ReconcileError> {
    let store = FileStateStore::open(&settings.state_dir)?;
    Ok(Self {
      store: Arc::new(store),
      providers,
      settings,
    })
  }

  pub fn with_settings(mut self, settings: Settings) -> Self {
    self.settings = settings;
    self
  }

  pub fn store(&self) -> &dyn StateStore {
    self.store.as_ref()
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  /// Compute a plan under a shared lock. Nothing is mutated.
  pub fn plan(&self, manifest: &Manifest) -> Result<Plan, ReconcileError> {
    let _lock = self.store.lock(LockMode::Shared, "plan")?;
    self.plan_locked(&manifest.resources)
  }

  /// Plan and execute in one run with the configured timeout.
  pub async fn apply(&self, manifest: &Manifest) -> Result<ApplyReport, ReconcileError> {
    self.apply_with(manifest, &self.settings.apply_options()).await
  }

  /// Plan and execute in one run, holding the exclusive lock throughout.
  pub async fn apply_with(&self, manifest: &Manifest, options: &ApplyOptions) -> Result<ApplyReport, ReconcileError> {
    let _lock = self.store.lock(LockMode::Exclusive, "apply")?;
    let plan = self.plan_locked(&manifest.resources)?;
    self.execute_locked(plan, options).await
  }

  /// Execute a previously computed plan.
  ///
  /// Fails with [`ReconcileError::StalePlan`] if the store no longer matches
  /// the state the plan was computed against.
  pub async fn apply_saved_plan(&self, plan: Plan, options: &ApplyOptions) -> Result<ApplyReport, ReconcileError> {
    let _lock = self.store.lock(LockMode::Exclusive, "apply")?;
    let actual = fingerprint(self.store.as_ref())?;
    if &actual != plan.state_fingerprint() {
      return Err(ReconcileError::StalePlan {
        expected: plan.state_fingerprint().clone(),
        actual,
      });
    }
    self.execute_locked(plan, options).await
  }

  /// Destroy every tracked resource.
  pub async fn destroy_all(&self, options: &ApplyOptions) -> Result<ApplyReport, ReconcileError> {
    let _lock = self.store.lock(LockMode::Exclusive, "destroy")?;
    let plan = self.plan_locked(&[])?;
    self.execute_locked(plan, options).await
  }

  fn plan_locked(&self, declarations: &[ResourceDeclaration]) -> Result<Plan, ReconcileError> {
    let records = self.store.list_all()?;
    info!(declared = declarations.len(), tracked = records.len(), "planning");
    build_plan(
      declarations,
      &records,
      &self.providers.schemas(),
      &self.settings.replace_strategy,
    )
  }

  async fn execute_locked(&self, plan: Plan, options: &ApplyOptions) -> Result<ApplyReport, ReconcileError> {
    if plan.is_empty() {
      info!("no changes to apply");
      return Ok(ApplyReport {
        plan,
        result: ApplyResult::default(),
      });
    }

    let result = execute_plan(&plan, self.store.as_ref(), &self.providers, options).await?;
    info!(applied = result.applied.len(), "apply complete");
    Ok(ApplyReport { plan, result })
  }
}
