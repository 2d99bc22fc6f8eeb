//! Plan execution.
//!
//! Steps run strictly one at a time, in plan order. Each step:
//! 1. Checks the cancel flag
//! 2. Resolves its declared attributes against the state store, which already
//!    reflects every earlier step
//! 3. Calls the provider registered for the resource type, bounded by the
//!    configured timeout
//! 4. Writes the outcome to the state store
//!
//! The first failing step aborts execution. Earlier steps stay applied and
//! recorded; the failing step and everything after it are not.

mod provider;
mod types;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::plan::{Plan, PlanStep, StepAction};
use crate::resource::{AttrRef, Attributes, ReferenceResolver, ResolveError, Resolved, ResourceKey};
use crate::schema::ReplaceStrategy;
use crate::state::{StateRecord, StateStore};
use crate::util::unix_now;

pub use provider::{Created, ProviderError, ProviderRegistry, ResourceProvider};
pub use types::{AppliedStep, ApplyOptions, ApplyResult, CancelFlag, ExecuteError};

/// Resolves references against records loaded from the state store.
struct AppliedValues {
  records: BTreeMap<ResourceKey, StateRecord>,
}

impl ReferenceResolver for AppliedValues {
  fn resolve_ref(&self, reference: &AttrRef) -> Result<Resolved, ResolveError> {
    let record = self
      .records
      .get(&reference.key)
      .ok_or_else(|| ResolveError::MissingResource(reference.clone()))?;
    let value = record
      .value(&reference.attribute)
      .ok_or_else(|| ResolveError::MissingAttribute(reference.clone()))?;
    Ok(Resolved::Known(value.clone()))
  }
}

/// Execute every step of a plan against the store.
pub async fn execute_plan(
  plan: &Plan,
  store: &dyn StateStore,
  providers: &ProviderRegistry,
  options: &ApplyOptions,
) -> Result<ApplyResult, ExecuteError> {
  info!(steps = plan.steps().len(), "starting plan execution");
  let mut result = ApplyResult::default();

  for (index, step) in plan.steps().iter().enumerate() {
    if options.cancel.is_cancelled() {
      info!(key = %step.key, action = %step.action, "apply cancelled");
      return Err(ExecuteError::Cancelled {
        key: step.key.clone(),
        action: step.action,
      });
    }

    info!(step = index + 1, key = %step.key, action = %step.action, "applying step");
    if let Err(err) = execute_step(step, store, providers, options).await {
      error!(key = %step.key, action = %step.action, error = %err, "step failed");
      return Err(err);
    }

    result.applied.push(AppliedStep {
      key: step.key.clone(),
      action: step.action,
    });
  }

  info!(applied = result.applied.len(), "plan execution complete");
  Ok(result)
}

async fn execute_step(
  step: &PlanStep,
  store: &dyn StateStore,
  providers: &ProviderRegistry,
  options: &ApplyOptions,
) -> Result<(), ExecuteError> {
  let provider = providers
    .get(&step.key.resource_type)
    .ok_or_else(|| ExecuteError::NoProvider {
      key: step.key.clone(),
      action: step.action,
    })?;

  match step.action {
    StepAction::Create => create(step, store, provider, options).await,
    StepAction::Update => update(step, store, provider, options).await,
    StepAction::Destroy => match &step.deposed {
      Some(id) => destroy_deposed(step, id, store, provider, options).await,
      None => destroy(step, store, provider, options).await,
    },
  }
}

async fn create(
  step: &PlanStep,
  store: &dyn StateStore,
  provider: &Arc<dyn ResourceProvider>,
  options: &ApplyOptions,
) -> Result<(), ExecuteError> {
  let inputs = resolve_inputs(step, store)?;
  let existing = load(step, store)?;

  let created = call(step, options, provider.create(&inputs)).await?;
  debug!(key = %step.key, id = %created.id, "provider created resource");

  let mut record = StateRecord::new(step.key.clone(), created.id, inputs, created.attributes)
    .with_dependencies(step.dependencies.clone());
  if let Some(old) = existing {
    record.deposed = old.deposed.clone();
    if step.replacement == Some(ReplaceStrategy::CreateBeforeDestroy) {
      debug!(key = %step.key, id = %old.provider_id, "deposing previous instance");
      record.deposed.push(old.to_deposed());
    }
  }
  save(step, store, record)
}

async fn update(
  step: &PlanStep,
  store: &dyn StateStore,
  provider: &Arc<dyn ResourceProvider>,
  options: &ApplyOptions,
) -> Result<(), ExecuteError> {
  let inputs = resolve_inputs(step, store)?;
  let mut record = require(step, store)?;

  let outputs = call(step, options, provider.update(&record.provider_id, &inputs)).await?;

  record.attributes = inputs;
  record.outputs = outputs;
  record.dependencies = step.dependencies.clone();
  record.updated_at = unix_now();
  save(step, store, record)
}

async fn destroy(
  step: &PlanStep,
  store: &dyn StateStore,
  provider: &Arc<dyn ResourceProvider>,
  options: &ApplyOptions,
) -> Result<(), ExecuteError> {
  let record = require(step, store)?;
  call(step, options, provider.destroy(&record.provider_id)).await?;

  store.remove(&step.key).map_err(|source| ExecuteError::State {
    key: step.key.clone(),
    action: step.action,
    source,
  })?;
  debug!(key = %step.key, id = %record.provider_id, "removed state record");
  Ok(())
}

async fn destroy_deposed(
  step: &PlanStep,
  id: &str,
  store: &dyn StateStore,
  provider: &Arc<dyn ResourceProvider>,
  options: &ApplyOptions,
) -> Result<(), ExecuteError> {
  let mut record = require(step, store)?;
  let Some(position) = record.deposed.iter().position(|d| d.provider_id == id) else {
    return Err(ExecuteError::MissingState {
      key: step.key.clone(),
      action: step.action,
    });
  };

  call(step, options, provider.destroy(id)).await?;

  record.deposed.remove(position);
  debug!(key = %step.key, id = %id, "removed deposed object");
  save(step, store, record)
}

/// Await a provider call under the step timeout.
async fn call<T>(
  step: &PlanStep,
  options: &ApplyOptions,
  fut: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ExecuteError> {
  match tokio::time::timeout(options.timeout, fut).await {
    Ok(Ok(value)) => Ok(value),
    Ok(Err(source)) => Err(ExecuteError::Provider {
      key: step.key.clone(),
      action: step.action,
      source,
    }),
    Err(_) => Err(ExecuteError::Timeout {
      key: step.key.clone(),
      action: step.action,
      timeout: options.timeout,
    }),
  }
}

/// Resolve a step's declared attributes to concrete values.
fn resolve_inputs(step: &PlanStep, store: &dyn StateStore) -> Result<Attributes, ExecuteError> {
  let mut records = BTreeMap::new();
  for expr in step.attributes.values() {
    for reference in expr.references() {
      if records.contains_key(&reference.key) {
        continue;
      }
      let record = store.get(&reference.key).map_err(|source| ExecuteError::State {
        key: step.key.clone(),
        action: step.action,
        source,
      })?;
      if let Some(record) = record {
        records.insert(reference.key.clone(), record);
      }
    }
  }

  let values = AppliedValues { records };
  let mut resolved = Attributes::new();
  for (name, expr) in &step.attributes {
    let unresolved = |source| ExecuteError::Unresolved {
      key: step.key.clone(),
      action: step.action,
      attribute: name.clone(),
      source,
    };
    match expr.resolve(&values).map_err(unresolved)? {
      Resolved::Known(value) => {
        resolved.insert(name.clone(), value);
      }
      Resolved::Unknown => {
        let reference = expr.references().first().map(|r| (*r).clone());
        return Err(match reference {
          Some(reference) => unresolved(ResolveError::StillUnknown(reference)),
          None => ExecuteError::MissingState {
            key: step.key.clone(),
            action: step.action,
          },
        });
      }
    }
  }
  Ok(resolved)
}

fn load(step: &PlanStep, store: &dyn StateStore) -> Result<Option<StateRecord>, ExecuteError> {
  store.get(&step.key).map_err(|source| ExecuteError::State {
    key: step.key.clone(),
    action: step.action,
    source,
  })
}

fn require(step: &PlanStep, store: &dyn StateStore) -> Result<StateRecord, ExecuteError> {
  load(step, store)?.ok_or_else(|| ExecuteError::MissingState {
    key: step.key.clone(),
    action: step.action,
  })
}

fn save(step: &PlanStep, store: &dyn StateStore, record: StateRecord) -> Result<(), ExecuteError> {
  store.put(record).map_err(|source| ExecuteError::State {
    key: step.key.clone(),
    action: step.action,
    source,
  })
}
