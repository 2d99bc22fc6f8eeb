//! Planning and applying the reference scenarios end to end.

use std::sync::Arc;

use converge_lib::diff::ChangeKind;
use converge_lib::execute::{ExecuteError, ProviderRegistry};
use converge_lib::plan::StepAction;
use converge_lib::reconcile::ReconcileError;
use converge_lib::resource::{Lifecycle, ResourceDeclaration, ResourceKey};
use converge_lib::schema::{ReplaceStrategy, ResourceSchema};
use converge_lib::state::StateStore;

use super::common::{TestEnv, db, manifest, step_names, web};

fn key(s: &str) -> ResourceKey {
  s.parse().unwrap()
}

fn sized_web(size: &str) -> ResourceDeclaration {
  ResourceDeclaration::new("web", "front").with_attr("instance_type", size)
}

#[tokio::test]
async fn dependency_is_created_first() {
  let env = TestEnv::new();
  let (reconciler, _) = env.memory_reconciler(env.providers());

  let plan = reconciler.plan(&manifest(vec![db("main"), web("front", "main")])).unwrap();
  assert_eq!(step_names(&plan), vec!["create db.main", "create web.front"]);

  let reversed = reconciler.plan(&manifest(vec![web("front", "main"), db("main")])).unwrap();
  assert_eq!(step_names(&reversed), vec!["create db.main", "create web.front"]);
}

#[tokio::test]
async fn undeclared_resource_is_destroyed() {
  let env = TestEnv::new();
  let (reconciler, store) = env.memory_reconciler(env.providers());
  reconciler.apply(&manifest(vec![db("old")])).await.unwrap();

  let plan = reconciler.plan(&manifest(vec![])).unwrap();
  assert_eq!(step_names(&plan), vec!["destroy db.old"]);
  assert_eq!(plan.changes()[0].kind, ChangeKind::Destroy);

  reconciler.apply(&manifest(vec![])).await.unwrap();
  assert!(store.list_all().unwrap().is_empty());
  assert_eq!(env.calls(), vec!["create db", "destroy db db-1"]);
}

#[tokio::test]
async fn updatable_attribute_updates_in_place() {
  let env = TestEnv::new();
  let (reconciler, store) = env.memory_reconciler(env.providers());
  reconciler.apply(&manifest(vec![sized_web("small")])).await.unwrap();
  env.clear_calls();

  let plan = reconciler.plan(&manifest(vec![sized_web("large")])).unwrap();
  assert_eq!(step_names(&plan), vec!["update web.front"]);
  assert_eq!(plan.changes()[0].changed, vec!["instance_type"]);

  reconciler.apply(&manifest(vec![sized_web("large")])).await.unwrap();
  assert_eq!(env.calls(), vec!["update web web-1"]);
  let record = store.get(&key("web.front")).unwrap().unwrap();
  assert_eq!(record.provider_id, "web-1");
  assert_eq!(record.attributes["instance_type"].as_str(), Some("large"));
}

#[tokio::test]
async fn forcing_attribute_replaces_destroy_first() {
  let env = TestEnv::new();
  let providers = ProviderRegistry::new().with(Arc::new(
    env.provider(ResourceSchema::new("web").force_new("instance_type")),
  ));
  let (reconciler, store) = env.memory_reconciler(providers);
  reconciler.apply(&manifest(vec![sized_web("small")])).await.unwrap();
  env.clear_calls();

  let plan = reconciler.plan(&manifest(vec![sized_web("large")])).unwrap();
  assert_eq!(step_names(&plan), vec!["destroy web.front", "create web.front"]);
  assert!(plan.to_string().contains("-/+ web.front (forced by instance_type)"));

  reconciler.apply(&manifest(vec![sized_web("large")])).await.unwrap();
  assert_eq!(env.calls(), vec!["destroy web web-1", "create web"]);
  assert_eq!(store.get(&key("web.front")).unwrap().unwrap().provider_id, "web-2");
}

#[tokio::test]
async fn forcing_attribute_replaces_create_first() {
  let env = TestEnv::new();
  let providers = ProviderRegistry::new().with(Arc::new(
    env.provider(ResourceSchema::new("web").force_new("instance_type")),
  ));
  let (reconciler, store) = env.memory_reconciler(providers);
  let cbd = Lifecycle {
    create_before_destroy: Some(true),
    ..Lifecycle::default()
  };
  reconciler
    .apply(&manifest(vec![sized_web("small").with_lifecycle(cbd.clone())]))
    .await
    .unwrap();
  env.clear_calls();

  let next = manifest(vec![sized_web("large").with_lifecycle(cbd)]);
  let plan = reconciler.plan(&next).unwrap();
  assert_eq!(
    step_names(&plan),
    vec!["create web.front", "destroy web.front (deposed web-1)"]
  );

  reconciler.apply(&next).await.unwrap();
  assert_eq!(env.calls(), vec!["create web", "destroy web web-1"]);
  let record = store.get(&key("web.front")).unwrap().unwrap();
  assert_eq!(record.provider_id, "web-2");
  assert!(record.deposed.is_empty());
}

#[tokio::test]
async fn replaced_dependency_updates_dependent_after_create() {
  let env = TestEnv::new();
  let (reconciler, store) = env.memory_reconciler(env.providers());
  reconciler
    .apply(&manifest(vec![db("main"), web("front", "main")]))
    .await
    .unwrap();

  let changed = manifest(vec![db("main").with_attr("engine", "mysql"), web("front", "main")]);
  let plan = reconciler.plan(&changed).unwrap();
  assert_eq!(
    step_names(&plan),
    vec!["destroy db.main", "create db.main", "update web.front"]
  );
  assert_eq!(plan.changes()[1].unknown, vec!["upstream"]);

  reconciler.apply(&changed).await.unwrap();
  let web = store.get(&key("web.front")).unwrap().unwrap();
  assert_eq!(web.attributes["upstream"].as_str(), Some("http://10.0.0.5:5432"));
  assert_eq!(store.get(&key("db.main")).unwrap().unwrap().provider_id, "db-2");
}

#[tokio::test]
async fn create_before_destroy_from_settings_keeps_dependent_served() {
  let env = TestEnv::new();
  let reconciler = env
    .reconciler(env.providers())
    .with_settings(env.settings().with_replace_strategy("db", ReplaceStrategy::CreateBeforeDestroy));
  reconciler
    .apply(&manifest(vec![db("main"), web("front", "main")]))
    .await
    .unwrap();
  env.clear_calls();

  let changed = manifest(vec![db("main").with_attr("engine", "mysql"), web("front", "main")]);
  let plan = reconciler.plan(&changed).unwrap();
  assert_eq!(
    step_names(&plan),
    vec!["create db.main", "update web.front", "destroy db.main (deposed db-1)"]
  );

  reconciler.apply(&changed).await.unwrap();
  assert_eq!(env.calls(), vec!["create db", "update web web-1", "destroy db db-1"]);
  assert!(reconciler.plan(&changed).unwrap().is_empty());
}

#[tokio::test]
async fn applied_create_plans_as_noop() {
  let env = TestEnv::new();
  let (reconciler, _) = env.memory_reconciler(env.providers());
  let desired = manifest(vec![db("main"), web("front", "main")]);
  reconciler.apply(&desired).await.unwrap();

  let plan = reconciler.plan(&desired).unwrap();
  assert!(plan.is_empty());
  assert!(plan.changes().iter().all(|c| c.kind == ChangeKind::NoOp));
  assert_eq!(plan.summary().unchanged, 2);
}

#[tokio::test]
async fn planning_is_deterministic() {
  let env = TestEnv::new();
  let (reconciler, _) = env.memory_reconciler(env.providers());
  reconciler.apply(&manifest(vec![db("main"), db("old")])).await.unwrap();

  let desired = manifest(vec![web("front", "main"), db("main").with_attr("engine", "mysql")]);
  let first = reconciler.plan(&desired).unwrap();
  let second = reconciler.plan(&desired).unwrap();
  assert_eq!(first.changes(), second.changes());
  assert_eq!(first.steps(), second.steps());
  assert_eq!(first.state_fingerprint(), second.state_fingerprint());
}

#[tokio::test]
async fn failed_step_leaves_earlier_steps_recorded() {
  let env = TestEnv::new();
  let providers = env
    .providers()
    .with(Arc::new(env.provider(ResourceSchema::new("cache")).failing(StepAction::Create)));
  let (reconciler, store) = env.memory_reconciler(providers);
  let desired = manifest(vec![
    db("main"),
    ResourceDeclaration::new("cache", "main").with_attr("size", "1g"),
    ResourceDeclaration::new("web", "front").with_attr("image", "nginx:1"),
  ]);

  let err = match reconciler.apply(&desired).await {
    Err(ReconcileError::Execute(err)) => err,
    other => panic!("expected execute error, got {other:?}"),
  };
  assert!(matches!(err, ExecuteError::Provider { .. }));
  assert_eq!(err.key(), &key("cache.main"));

  assert!(store.get(&key("db.main")).unwrap().is_some());
  assert!(store.get(&key("cache.main")).unwrap().is_none());
  assert!(store.get(&key("web.front")).unwrap().is_none());
  assert_eq!(env.calls(), vec!["create db", "create cache"]);

  let retry = reconciler.plan(&desired).unwrap();
  assert_eq!(step_names(&retry), vec!["create cache.main", "create web.front"]);
}
