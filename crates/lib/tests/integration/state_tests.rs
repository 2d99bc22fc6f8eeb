//! State persistence, locking and plan-time failures.

use converge_lib::graph::GraphError;
use converge_lib::manifest::Manifest;
use converge_lib::reconcile::ReconcileError;
use converge_lib::resource::{Expr, ResourceDeclaration, ResourceKey};
use converge_lib::state::{LockError, LockMode, StateError, StateStore};

use super::common::{TestEnv, db, manifest, web};

fn key(s: &str) -> ResourceKey {
  s.parse().unwrap()
}

#[tokio::test]
async fn state_survives_reopening() {
  let env = TestEnv::new();
  let desired = manifest(vec![db("main"), web("front", "main")]);
  env.reconciler(env.providers()).apply(&desired).await.unwrap();

  let record_path = env.temp.path().join("state/resources/db/main.json");
  let content: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(record_path).unwrap()).unwrap();
  assert_eq!(content["version"], 1);
  assert_eq!(content["record"]["key"], "db.main");
  assert_eq!(content["record"]["outputs"]["address"], "10.0.0.5");

  let reopened = env.reconciler(env.providers());
  assert!(reopened.plan(&desired).unwrap().is_empty());
  let web = reopened.store().get(&key("web.front")).unwrap().unwrap();
  assert_eq!(web.dependencies, vec![key("db.main")]);
}

#[tokio::test]
async fn corrupt_record_is_reported() {
  let env = TestEnv::new();
  let reconciler = env.reconciler(env.providers());
  reconciler.apply(&manifest(vec![db("main")])).await.unwrap();

  std::fs::write(env.temp.path().join("state/resources/db/main.json"), "{ not json").unwrap();

  let err = reconciler.plan(&manifest(vec![db("main")])).unwrap_err();
  assert!(matches!(err, ReconcileError::State(StateError::Parse { .. })));
}

// Windows locks are mandatory, so the holder metadata is unreadable there.
#[cfg(unix)]
#[tokio::test]
async fn held_lock_fails_fast_with_holder() {
  let env = TestEnv::new();
  let reconciler = env.reconciler(env.providers());

  let other = env.file_store();
  let _held = other.lock(LockMode::Exclusive, "apply").unwrap();

  let err = reconciler.apply(&manifest(vec![db("main")])).await.unwrap_err();
  match err {
    ReconcileError::State(StateError::Lock(LockError::Contention { operation, pid, .. })) => {
      assert_eq!(operation, "apply");
      assert_eq!(pid, std::process::id());
    }
    other => panic!("expected lock contention, got {other:?}"),
  }
  assert!(env.calls().is_empty());
}

#[tokio::test]
async fn shared_locks_allow_concurrent_plans() {
  let env = TestEnv::new();
  let reconciler = env.reconciler(env.providers());

  let other = env.file_store();
  let _reader = other.lock(LockMode::Shared, "plan").unwrap();
  assert!(reconciler.plan(&manifest(vec![db("main")])).is_ok());
}

#[tokio::test]
async fn cycle_fails_without_mutation() {
  let env = TestEnv::new();
  let reconciler = env.reconciler(env.providers());
  reconciler.apply(&manifest(vec![db("main")])).await.unwrap();
  env.clear_calls();
  let before = env.file_store().list_all().unwrap();

  let cyclic = manifest(vec![
    db("main").with_attr("replica_of", Expr::parse_str("${db.replica.engine}").unwrap()),
    db("replica").with_attr("primary", Expr::parse_str("${db.main.engine}").unwrap()),
  ]);
  let err = reconciler.apply(&cyclic).await.unwrap_err();
  let ReconcileError::Graph(GraphError::Cycle { path }) = &err else {
    panic!("expected cycle, got {err:?}");
  };
  assert_eq!(path.first(), path.last());
  assert!(err.to_string().contains("db.main -> db.replica -> db.main"));

  assert!(env.calls().is_empty());
  assert_eq!(env.file_store().list_all().unwrap(), before);
}

#[tokio::test]
async fn unknown_reference_target_is_rejected() {
  let env = TestEnv::new();
  let reconciler = env.reconciler(env.providers());

  let err = reconciler.plan(&manifest(vec![web("front", "missing")])).unwrap_err();
  assert!(matches!(
    err,
    ReconcileError::Graph(GraphError::UnresolvedReference { .. })
  ));
}

#[tokio::test]
async fn manifest_from_json_applies() {
  let env = TestEnv::new();
  let reconciler = env.reconciler(env.providers());
  let desired = Manifest::from_json_str(
    r#"{
      "resources": [
        { "type": "web", "name": "front", "attributes": { "upstream": "${db.main.address}", "image": "nginx:1" } },
        { "type": "db", "name": "main", "attributes": { "engine": "postgres" } }
      ]
    }"#,
  )
  .unwrap();

  reconciler.apply(&desired).await.unwrap();
  let web = env.file_store().get(&key("web.front")).unwrap().unwrap();
  assert_eq!(web.attributes["upstream"].as_str(), Some("10.0.0.5"));
}

#[tokio::test]
async fn prevent_destroy_blocks_replacement() {
  let env = TestEnv::new();
  let reconciler = env.reconciler(env.providers());
  let guarded = |engine: &str| {
    let mut decl = ResourceDeclaration::new("db", "main").with_attr("engine", engine);
    decl.lifecycle.prevent_destroy = true;
    decl
  };
  reconciler.apply(&manifest(vec![guarded("postgres")])).await.unwrap();

  let err = reconciler.plan(&manifest(vec![guarded("mysql")])).unwrap_err();
  assert!(matches!(err, ReconcileError::Diff(_)));
}
