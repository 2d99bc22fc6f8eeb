//! Shared test helpers for reconciliation integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use converge_lib::execute::{CancelFlag, Created, ProviderError, ProviderRegistry, ResourceProvider};
use converge_lib::manifest::Manifest;
use converge_lib::plan::StepAction;
use converge_lib::reconcile::Reconciler;
use converge_lib::resource::{Attributes, Expr, ResourceDeclaration, Value};
use converge_lib::schema::ResourceSchema;
use converge_lib::settings::Settings;
use converge_lib::state::{FileStateStore, MemoryStateStore};
use tempfile::TempDir;

/// Provider that records calls instead of touching infrastructure.
pub struct RecordingProvider {
  schema: ResourceSchema,
  calls: Arc<Mutex<Vec<String>>>,
  counter: AtomicUsize,
  computed: Attributes,
  fail: Option<StepAction>,
  stall: Option<Duration>,
  cancel: Option<CancelFlag>,
}

impl RecordingProvider {
  pub fn new(schema: ResourceSchema, calls: &Arc<Mutex<Vec<String>>>) -> Self {
    Self {
      schema,
      calls: calls.clone(),
      counter: AtomicUsize::new(1),
      computed: Attributes::new(),
      fail: None,
      stall: None,
      cancel: None,
    }
  }

  pub fn computing(mut self, name: &str, value: &str) -> Self {
    self.computed.insert(name.to_string(), Value::from(value));
    self
  }

  pub fn failing(mut self, action: StepAction) -> Self {
    self.fail = Some(action);
    self
  }

  pub fn stalling(mut self, duration: Duration) -> Self {
    self.stall = Some(duration);
    self
  }

  pub fn cancelling(mut self, flag: &CancelFlag) -> Self {
    self.cancel = Some(flag.clone());
    self
  }

  async fn record(&self, action: StepAction, id: Option<&str>) -> Result<(), ProviderError> {
    let entry = match id {
      Some(id) => format!("{} {} {}", action, self.schema.resource_type, id),
      None => format!("{} {}", action, self.schema.resource_type),
    };
    self.calls.lock().unwrap().push(entry);

    if let Some(flag) = &self.cancel {
      flag.cancel();
    }
    if let Some(duration) = self.stall {
      tokio::time::sleep(duration).await;
    }
    if self.fail == Some(action) {
      return Err(ProviderError::msg("provider rejected the request"));
    }
    Ok(())
  }
}

#[async_trait]
impl ResourceProvider for RecordingProvider {
  fn schema(&self) -> ResourceSchema {
    self.schema.clone()
  }

  async fn create(&self, _attributes: &Attributes) -> Result<Created, ProviderError> {
    self.record(StepAction::Create, None).await?;
    let n = self.counter.fetch_add(1, Ordering::SeqCst);
    Ok(Created::new(
      format!("{}-{}", self.schema.resource_type, n),
      self.computed.clone(),
    ))
  }

  async fn update(&self, id: &str, _attributes: &Attributes) -> Result<Attributes, ProviderError> {
    self.record(StepAction::Update, Some(id)).await?;
    Ok(self.computed.clone())
  }

  async fn destroy(&self, id: &str) -> Result<(), ProviderError> {
    self.record(StepAction::Destroy, Some(id)).await
  }
}

/// Isolated test environment.
///
/// Each test gets its own temporary state directory and call log.
pub struct TestEnv {
  pub temp: TempDir,
  pub calls: Arc<Mutex<Vec<String>>>,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
      calls: Arc::default(),
    }
  }

  pub fn settings(&self) -> Settings {
    Settings::default().with_state_dir(self.temp.path().join("state"))
  }

  /// Reconciler over a file store in the temp directory.
  pub fn reconciler(&self, providers: ProviderRegistry) -> Reconciler {
    Reconciler::open(self.settings(), providers).unwrap()
  }

  /// Reconciler over a fresh in-memory store.
  pub fn memory_reconciler(&self, providers: ProviderRegistry) -> (Reconciler, Arc<MemoryStateStore>) {
    let store = Arc::new(MemoryStateStore::new());
    (Reconciler::new(store.clone(), providers), store)
  }

  pub fn file_store(&self) -> FileStateStore {
    FileStateStore::open(self.temp.path().join("state")).unwrap()
  }

  pub fn provider(&self, schema: ResourceSchema) -> RecordingProvider {
    RecordingProvider::new(schema, &self.calls)
  }

  /// Default providers: `db` computes an address, `web` updates in place
  /// except for `image`.
  pub fn providers(&self) -> ProviderRegistry {
    ProviderRegistry::new()
      .with(Arc::new(
        self
          .provider(ResourceSchema::new("db").force_new("engine"))
          .computing("address", "10.0.0.5"),
      ))
      .with(Arc::new(self.provider(ResourceSchema::new("web").force_new("image"))))
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn clear_calls(&self) {
    self.calls.lock().unwrap().clear();
  }
}

pub fn db(name: &str) -> ResourceDeclaration {
  ResourceDeclaration::new("db", name).with_attr("engine", "postgres")
}

/// A `web` resource pointing at `db.<db_name>`.
pub fn web(name: &str, db_name: &str) -> ResourceDeclaration {
  let upstream = Expr::parse_str(&format!("http://${{db.{}.address}}:5432", db_name)).unwrap();
  ResourceDeclaration::new("web", name)
    .with_attr("image", "nginx:1")
    .with_attr("upstream", upstream)
}

pub fn manifest(resources: Vec<ResourceDeclaration>) -> Manifest {
  Manifest::new(resources)
}

/// Render plan steps for comparison, e.g. `"create db.main"`.
pub fn step_names(plan: &converge_lib::plan::Plan) -> Vec<String> {
  plan.steps().iter().map(|s| s.to_string()).collect()
}
