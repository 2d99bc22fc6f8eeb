//! Types for plan execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::consts::DEFAULT_OPERATION_TIMEOUT;
use crate::plan::StepAction;
use crate::resource::{ResolveError, ResourceKey};
use crate::state::StateError;

use super::provider::ProviderError;

/// Cooperative cancellation signal, checked between steps.
///
/// Cloning shares the flag. A step already in flight always runs to
/// completion (or timeout) before cancellation is observed.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// Options for executing a plan.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
  /// Upper bound for each provider call.
  pub timeout: Duration,

  pub cancel: CancelFlag,
}

impl Default for ApplyOptions {
  fn default() -> Self {
    Self {
      timeout: DEFAULT_OPERATION_TIMEOUT,
      cancel: CancelFlag::new(),
    }
  }
}

impl ApplyOptions {
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
    self.cancel = cancel;
    self
  }
}

/// A step that completed successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStep {
  pub key: ResourceKey,
  pub action: StepAction,
}

/// Outcome of executing a whole plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyResult {
  /// Steps applied, in execution order.
  pub applied: Vec<AppliedStep>,
}

impl ApplyResult {
  pub fn count(&self, action: StepAction) -> usize {
    self.applied.iter().filter(|s| s.action == action).count()
  }
}

/// Errors that abort plan execution.
///
/// Every variant names the step that failed. Steps before it are applied and
/// recorded in state; it and every later step are not.
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error("{action} {key} failed: {source}")]
  Provider {
    key: ResourceKey,
    action: StepAction,
    #[source]
    source: ProviderError,
  },

  #[error("{action} {key} timed out after {}", format_timeout(.timeout))]
  Timeout {
    key: ResourceKey,
    action: StepAction,
    timeout: Duration,
  },

  #[error("apply cancelled before {action} {key}")]
  Cancelled { key: ResourceKey, action: StepAction },

  #[error("{action} {key}: no provider registered for type '{}'", .key.resource_type)]
  NoProvider { key: ResourceKey, action: StepAction },

  #[error("{action} {key}: cannot resolve attribute '{attribute}': {source}")]
  Unresolved {
    key: ResourceKey,
    action: StepAction,
    attribute: String,
    #[source]
    source: ResolveError,
  },

  #[error("{action} {key}: resource has no recorded state")]
  MissingState { key: ResourceKey, action: StepAction },

  #[error("{action} {key}: state store error: {source}")]
  State {
    key: ResourceKey,
    action: StepAction,
    #[source]
    source: StateError,
  },
}

fn format_timeout(timeout: &Duration) -> String {
  humantime::format_duration(*timeout).to_string()
}

impl ExecuteError {
  /// Key of the step that failed.
  pub fn key(&self) -> &ResourceKey {
    match self {
      ExecuteError::Provider { key, .. }
      | ExecuteError::Timeout { key, .. }
      | ExecuteError::Cancelled { key, .. }
      | ExecuteError::NoProvider { key, .. }
      | ExecuteError::Unresolved { key, .. }
      | ExecuteError::MissingState { key, .. }
      | ExecuteError::State { key, .. } => key,
    }
  }

  /// Action of the step that failed.
  pub fn action(&self) -> StepAction {
    match self {
      ExecuteError::Provider { action, .. }
      | ExecuteError::Timeout { action, .. }
      | ExecuteError::Cancelled { action, .. }
      | ExecuteError::NoProvider { action, .. }
      | ExecuteError::Unresolved { action, .. }
      | ExecuteError::MissingState { action, .. }
      | ExecuteError::State { action, .. } => *action,
    }
  }
}
