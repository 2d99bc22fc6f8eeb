//! Execution behaviour: timeouts, cancellation, saved plans and teardown.

use std::sync::Arc;
use std::time::Duration;

use converge_lib::execute::{ApplyOptions, CancelFlag, ExecuteError, ProviderRegistry};
use converge_lib::plan::{Plan, StepAction};
use converge_lib::reconcile::{ReconcileError, Reconciler};
use converge_lib::resource::ResourceKey;
use converge_lib::schema::ResourceSchema;
use converge_lib::state::StateStore;

use super::common::{TestEnv, db, manifest, web};

fn key(s: &str) -> ResourceKey {
  s.parse().unwrap()
}

#[tokio::test]
async fn timed_out_create_is_not_recorded() {
  let env = TestEnv::new();
  let providers = ProviderRegistry::new().with(Arc::new(
    env
      .provider(ResourceSchema::new("db"))
      .stalling(Duration::from_millis(500)),
  ));
  let settings = env.settings().with_operation_timeout(Duration::from_millis(20));
  let reconciler = Reconciler::open(settings, providers).unwrap();

  let err = reconciler.apply(&manifest(vec![db("main")])).await.unwrap_err();
  assert!(matches!(
    err,
    ReconcileError::Execute(ExecuteError::Timeout {
      action: StepAction::Create,
      ..
    })
  ));
  assert!(env.file_store().list_all().unwrap().is_empty());

  // The lock is released once the failed run returns.
  let plan = reconciler.plan(&manifest(vec![db("main")])).unwrap();
  assert_eq!(plan.summary().create, 1);
}

#[tokio::test]
async fn cancellation_stops_before_the_next_step() {
  let env = TestEnv::new();
  let cancel = CancelFlag::new();
  let providers = ProviderRegistry::new()
    .with(Arc::new(
      env
        .provider(ResourceSchema::new("db"))
        .computing("address", "10.0.0.5")
        .cancelling(&cancel),
    ))
    .with(Arc::new(env.provider(ResourceSchema::new("web"))));
  let reconciler = env.reconciler(providers);

  let options = ApplyOptions::default().with_cancel(cancel);
  let err = reconciler
    .apply_with(&manifest(vec![db("main"), web("front", "main")]), &options)
    .await
    .unwrap_err();
  let ReconcileError::Execute(err) = &err else {
    panic!("expected execute error, got {err:?}");
  };
  assert!(matches!(err, ExecuteError::Cancelled { .. }));
  assert_eq!(err.key(), &key("web.front"));

  let store = env.file_store();
  assert!(store.get(&key("db.main")).unwrap().is_some());
  assert!(store.get(&key("web.front")).unwrap().is_none());
  assert_eq!(env.calls(), vec!["create db"]);
}

#[tokio::test]
async fn saved_plan_applies_after_reload() {
  let env = TestEnv::new();
  let reconciler = env.reconciler(env.providers());

  let plan = reconciler.plan(&manifest(vec![db("main"), web("front", "main")])).unwrap();
  let path = env.temp.path().join("plan.json");
  std::fs::write(&path, plan.to_json().unwrap()).unwrap();

  let loaded = Plan::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
  assert_eq!(loaded, plan);

  let report = reconciler
    .apply_saved_plan(loaded, &ApplyOptions::default())
    .await
    .unwrap();
  assert_eq!(report.result.count(StepAction::Create), 2);
  assert_eq!(env.file_store().list_all().unwrap().len(), 2);
}

#[tokio::test]
async fn saved_plan_against_changed_state_is_rejected() {
  let env = TestEnv::new();
  let reconciler = env.reconciler(env.providers());

  let plan = reconciler.plan(&manifest(vec![db("main")])).unwrap();
  reconciler.apply(&manifest(vec![db("other")])).await.unwrap();
  env.clear_calls();

  let err = reconciler
    .apply_saved_plan(plan, &ApplyOptions::default())
    .await
    .unwrap_err();
  assert!(matches!(err, ReconcileError::StalePlan { .. }));
  assert!(env.calls().is_empty());
  assert!(env.file_store().get(&key("db.main")).unwrap().is_none());
}

#[tokio::test]
async fn destroy_all_removes_dependents_first() {
  let env = TestEnv::new();
  let reconciler = env.reconciler(env.providers());
  reconciler
    .apply(&manifest(vec![web("front", "main"), db("main")]))
    .await
    .unwrap();
  env.clear_calls();

  let report = reconciler.destroy_all(&ApplyOptions::default()).await.unwrap();
  assert_eq!(report.result.count(StepAction::Destroy), 2);
  assert_eq!(env.calls(), vec!["destroy web web-1", "destroy db db-1"]);
  assert!(env.file_store().list_all().unwrap().is_empty());
}

#[tokio::test]
async fn unchanged_manifest_calls_no_provider() {
  let env = TestEnv::new();
  let reconciler = env.reconciler(env.providers());
  let desired = manifest(vec![db("main"), web("front", "main")]);
  reconciler.apply(&desired).await.unwrap();
  env.clear_calls();

  let report = reconciler.apply(&desired).await.unwrap();
  assert!(report.plan.is_empty());
  assert!(report.result.applied.is_empty());
  assert!(env.calls().is_empty());
}
