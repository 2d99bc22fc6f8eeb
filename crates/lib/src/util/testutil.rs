//! Test utilities for converge-lib.
//!
//! [`MockProvider`] stands in for real infrastructure: it hands out ids,
//! records every call in a log that can be shared between providers, and can
//! be told to fail or stall.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::execute::{CancelFlag, Created, ProviderError, ResourceProvider};
use crate::plan::StepAction;
use crate::resource::{Attributes, Value};
use crate::schema::ResourceSchema;

/// Call log shared between providers, e.g. `"create db"`, `"destroy web web-1"`.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub struct MockProvider {
  schema: ResourceSchema,
  log: CallLog,
  next_id: AtomicUsize,
  outputs: Attributes,
  fail_on: Option<StepAction>,
  delay: Option<Duration>,
  cancel_on_call: Option<CancelFlag>,
}

impl MockProvider {
  pub fn new(schema: ResourceSchema) -> Self {
    Self {
      schema,
      log: CallLog::default(),
      next_id: AtomicUsize::new(1),
      outputs: Attributes::new(),
      fail_on: None,
      delay: None,
      cancel_on_call: None,
    }
  }

  pub fn with_log(mut self, log: CallLog) -> Self {
    self.log = log;
    self
  }

  /// Computed attribute returned from every create and update.
  pub fn with_output(mut self, name: &str, value: impl Into<Value>) -> Self {
    self.outputs.insert(name.to_string(), value.into());
    self
  }

  pub fn failing_on(mut self, action: StepAction) -> Self {
    self.fail_on = Some(action);
    self
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  /// Trip `flag` whenever this provider is called.
  pub fn cancelling(mut self, flag: CancelFlag) -> Self {
    self.cancel_on_call = Some(flag);
    self
  }

  pub fn calls(&self) -> Vec<String> {
    self.log.lock().map(|log| log.clone()).unwrap_or_default()
  }

  async fn enter(&self, action: StepAction, detail: &str) -> Result<(), ProviderError> {
    let entry = format!("{} {}{}", action, self.schema.resource_type, detail);
    if let Ok(mut log) = self.log.lock() {
      log.push(entry);
    }
    if let Some(flag) = &self.cancel_on_call {
      flag.cancel();
    }
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    if self.fail_on == Some(action) {
      return Err(ProviderError::msg(format!("{} refused", action)));
    }
    Ok(())
  }
}

#[async_trait]
impl ResourceProvider for MockProvider {
  fn schema(&self) -> ResourceSchema {
    self.schema.clone()
  }

  async fn create(&self, _attributes: &Attributes) -> Result<Created, ProviderError> {
    self.enter(StepAction::Create, "").await?;
    let n = self.next_id.fetch_add(1, Ordering::SeqCst);
    Ok(Created::new(
      format!("{}-{}", self.schema.resource_type, n),
      self.outputs.clone(),
    ))
  }

  async fn update(&self, id: &str, _attributes: &Attributes) -> Result<Attributes, ProviderError> {
    self.enter(StepAction::Update, &format!(" {}", id)).await?;
    Ok(self.outputs.clone())
  }

  async fn destroy(&self, id: &str) -> Result<(), ProviderError> {
    self.enter(StepAction::Destroy, &format!(" {}", id)).await
  }
}
