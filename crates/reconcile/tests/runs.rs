//! Apply and delete runs against an in-memory cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kustodian_apply::ApplyEngine;
use kustodian_core::{
    Action, ApplyOptions, Change, DeleteFailure, DeleteOptions, Error, HasReplicaField, Identified, ObjectRef,
    Resource, ResourceId, Result, WaitOptions, OWNER_NAME_LABEL, PRUNE_ANNOTATION,
};
use kustodian_inventory::{Inventory, InventoryStore, MemoryInventoryStore};
use kustodian_reconcile::{ReconcileConfig, Reconciler, Reporter};
use serde_json::{json, Value as Json};

#[derive(Default)]
struct Cluster {
    live: BTreeMap<ResourceId, Resource>,
    journal: Vec<String>,
    fail_apply: BTreeSet<String>,
    fail_delete: BTreeSet<String>,
    never_ready: BTreeSet<String>,
    slow_wait: bool,
    fail_save: bool,
}

#[derive(Clone, Default)]
struct FakeEngine {
    cluster: Arc<Mutex<Cluster>>,
}

fn list(objects: &[ObjectRef]) -> String {
    objects.iter().map(|o| o.to_string()).collect::<Vec<_>>().join(", ")
}

#[async_trait]
impl ApplyEngine for FakeEngine {
    async fn apply(&self, object: &Resource, _: ApplyOptions) -> Result<Change> {
        let mut c = self.cluster.lock().unwrap();
        let id = object.id();
        c.journal.push(format!("apply {}", id));
        if c.fail_apply.contains(object.name()) {
            return Err(Error::apply(&id, "admission webhook denied the request"));
        }
        let action = match c.live.insert(id.clone(), object.clone()) {
            None => Action::Created,
            Some(prev) if &prev == object => Action::Unchanged,
            Some(_) => Action::Configured,
        };
        Ok(Change::new(id, action))
    }

    async fn delete(&self, object: &ObjectRef, _: DeleteOptions) -> Result<Change> {
        let mut c = self.cluster.lock().unwrap();
        c.journal.push(format!("delete {}", object));
        if c.fail_delete.contains(&object.id.name) {
            return Err(Error::Delete(vec![DeleteFailure { object: object.id(), message: "forbidden".into() }]));
        }
        let protected = c.live.get(&object.id).and_then(|r| r.annotation(PRUNE_ANNOTATION)) == Some("disabled");
        if protected {
            return Ok(Change::new(object.id(), Action::Skipped));
        }
        let action = if c.live.remove(&object.id).is_some() { Action::Deleted } else { Action::Skipped };
        Ok(Change::new(object.id(), action))
    }

    async fn wait(&self, objects: &[ObjectRef], _: WaitOptions) -> Result<()> {
        let slow = {
            let mut c = self.cluster.lock().unwrap();
            c.journal.push(format!("wait {}", list(objects)));
            let stuck: Vec<_> = objects.iter().filter(|o| c.never_ready.contains(&o.id.name)).cloned().collect();
            if !stuck.is_empty() {
                return Err(Error::Wait(format!("not ready: {}", list(&stuck))));
            }
            c.slow_wait
        };
        if slow {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(())
    }

    async fn wait_for_termination(&self, objects: &[ObjectRef], _: WaitOptions) -> Result<()> {
        self.cluster.lock().unwrap().journal.push(format!("terminated {}", list(objects)));
        Ok(())
    }
}

/// Records saves and deletes into the cluster journal so ordering against
/// engine calls can be asserted.
struct JournalStore {
    inner: MemoryInventoryStore,
    cluster: Arc<Mutex<Cluster>>,
}

#[async_trait]
impl InventoryStore for JournalStore {
    async fn load(&self, name: &str, namespace: &str) -> Result<Option<Inventory>> {
        self.inner.load(name, namespace).await
    }

    async fn save(&self, inventory: &Inventory) -> Result<()> {
        {
            let mut c = self.cluster.lock().unwrap();
            if c.fail_save {
                return Err(Error::Storage("connection refused".into()));
            }
            c.journal.push(format!("save {}", inventory.key()));
        }
        self.inner.save(inventory).await
    }

    async fn delete(&self, inventory: &Inventory) -> Result<()> {
        self.cluster.lock().unwrap().journal.push(format!("forget {}", inventory.key()));
        self.inner.delete(inventory).await
    }
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Reporter for Recorder {
    fn change(&self, change: &Change) {
        self.0.lock().unwrap().push(change.to_string());
    }
}

struct Harness {
    engine: FakeEngine,
    store: Arc<JournalStore>,
    reported: Recorder,
}

impl Harness {
    fn new() -> Self {
        let engine = FakeEngine::default();
        let store = Arc::new(JournalStore { inner: MemoryInventoryStore::new(), cluster: engine.cluster.clone() });
        Self { engine, store, reported: Recorder::default() }
    }

    fn reconciler(&self, config: ReconcileConfig) -> Reconciler<FakeEngine, Arc<JournalStore>> {
        Reconciler::new(self.engine.clone(), self.store.clone(), config).with_reporter(self.reported.clone())
    }

    fn cluster(&self) -> std::sync::MutexGuard<'_, Cluster> { self.engine.cluster.lock().unwrap() }

    fn journal(&self) -> Vec<String> { self.cluster().journal.clone() }

    fn position(&self, entry: &str) -> usize {
        let journal = self.journal();
        journal.iter().position(|e| e == entry).unwrap_or_else(|| panic!("{entry:?} not in {journal:#?}"))
    }

    fn is_live(&self, id: &ResourceId) -> bool { self.cluster().live.contains_key(id) }

    async fn stored(&self) -> Option<Inventory> { self.store.load("app", "flux-system").await.unwrap() }
}

fn config() -> ReconcileConfig { ReconcileConfig::new("app", "flux-system") }

fn obj(v: Json) -> Resource { Resource::from_json(v).unwrap() }

fn namespace(name: &str) -> Resource { obj(json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": name } })) }

fn deployment(ns: &str, name: &str) -> Resource {
    obj(json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": { "name": name, "namespace": ns },
        "spec": { "replicas": 2 }
    }))
}

fn config_map(ns: &str, name: &str) -> Resource {
    obj(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name, "namespace": ns }, "data": { "k": "v" } }))
}

fn dep_id(ns: &str, name: &str) -> ResourceId { ResourceId::new("apps", "Deployment", ns, name) }

#[tokio::test]
async fn first_run_applies_everything_and_records_both_objects() {
    let h = Harness::new();
    let report = h
        .reconciler(config())
        .apply(vec![deployment("ns-a", "app"), namespace("ns-a")], vec!["sha256:abc".into()])
        .await
        .unwrap();

    assert!(report.stale.is_empty());
    assert_eq!(report.applied.count(Action::Created), 2);
    assert!(h.is_live(&dep_id("ns-a", "app")));

    let stored = h.stored().await.expect("record saved");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored.digests, vec!["sha256:abc".to_string()]);
    assert_eq!(*h.reported.0.lock().unwrap(), vec!["Namespace/ns-a created", "Deployment/ns-a/app created"]);
}

#[tokio::test]
async fn applied_objects_carry_owner_labels() {
    let h = Harness::new();
    h.reconciler(config()).apply(vec![config_map("ns-a", "cfg")], vec![]).await.unwrap();
    let live = h.cluster().live.get(&ResourceId::new("", "ConfigMap", "ns-a", "cfg")).cloned().unwrap();
    assert_eq!(live.label(OWNER_NAME_LABEL), Some("app"));
}

#[tokio::test]
async fn second_run_prunes_what_was_removed_from_the_declaration() {
    let h = Harness::new();
    h.reconciler(config()).apply(vec![namespace("ns-a"), deployment("ns-a", "app")], vec![]).await.unwrap();

    let mut cfg = config();
    cfg.prune = true;
    let report = h.reconciler(cfg).apply(vec![namespace("ns-a")], vec![]).await.unwrap();

    let stale: Vec<_> = report.stale.iter().map(|o| o.id.clone()).collect();
    assert_eq!(stale, vec![dep_id("ns-a", "app")]);
    assert_eq!(report.pruned.count(Action::Deleted), 1);
    assert!(!h.is_live(&dep_id("ns-a", "app")));
    assert_eq!(h.stored().await.unwrap().len(), 1);
}

#[tokio::test]
async fn record_is_persisted_before_pruning() {
    let h = Harness::new();
    h.reconciler(config()).apply(vec![namespace("ns-a"), deployment("ns-a", "app")], vec![]).await.unwrap();
    let mut cfg = config();
    cfg.prune = true;
    h.reconciler(cfg).apply(vec![namespace("ns-a")], vec![]).await.unwrap();

    let journal = h.journal();
    let last_save = journal.iter().rposition(|e| e == "save flux-system/app").unwrap();
    assert!(last_save < h.position("delete Deployment/ns-a/app"), "{journal:#?}");
}

#[tokio::test]
async fn still_declared_objects_are_never_pruned() {
    let h = Harness::new();
    h.reconciler(config())
        .apply(vec![config_map("ns", "a"), config_map("ns", "b")], vec![])
        .await
        .unwrap();
    let mut cfg = config();
    cfg.prune = true;
    h.reconciler(cfg).apply(vec![config_map("ns", "b"), config_map("ns", "c")], vec![]).await.unwrap();

    let deletes: Vec<_> = h.journal().into_iter().filter(|e| e.starts_with("delete ")).collect();
    assert_eq!(deletes, vec!["delete ConfigMap/ns/a"]);
    assert!(h.is_live(&ResourceId::new("", "ConfigMap", "ns", "b")));
}

#[tokio::test]
async fn stale_objects_stay_when_pruning_is_off() {
    let h = Harness::new();
    h.reconciler(config()).apply(vec![namespace("ns-a"), deployment("ns-a", "app")], vec![]).await.unwrap();
    let report = h.reconciler(config()).apply(vec![namespace("ns-a")], vec![]).await.unwrap();
    assert_eq!(report.stale.len(), 1);
    assert!(report.pruned.is_empty());
    assert!(h.is_live(&dep_id("ns-a", "app")));
}

#[tokio::test]
async fn prune_skips_objects_with_deletion_disabled() {
    let h = Harness::new();
    let protected = obj(json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": { "name": "keep", "namespace": "ns", "annotations": { "kustodian.dev/prune": "disabled" } }
    }));
    h.reconciler(config()).apply(vec![protected, config_map("ns", "cfg")], vec![]).await.unwrap();
    let mut cfg = config();
    cfg.prune = true;
    let report = h.reconciler(cfg).apply(vec![config_map("ns", "cfg")], vec![]).await.unwrap();
    assert_eq!(report.pruned.count(Action::Skipped), 1);
    assert!(h.is_live(&ResourceId::new("", "ConfigMap", "ns", "keep")));
}

#[tokio::test]
async fn crd_is_ready_before_its_custom_resource_is_submitted() {
    let h = Harness::new();
    let crd = obj(json!({
        "apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition",
        "metadata": { "name": "widgets.acme.io" }
    }));
    let widget = obj(json!({ "apiVersion": "acme.io/v1", "kind": "Widget", "metadata": { "name": "w1", "namespace": "ns" } }));
    h.reconciler(config()).apply(vec![widget, crd], vec![]).await.unwrap();

    let apply_crd = h.position("apply CustomResourceDefinition/widgets.acme.io");
    let wait_crd = h.position("wait CustomResourceDefinition/widgets.acme.io");
    let apply_widget = h.position("apply Widget/ns/w1");
    assert!(apply_crd < wait_crd && wait_crd < apply_widget, "{:#?}", h.journal());
}

#[tokio::test]
async fn stage_one_not_ready_stops_the_run() {
    let h = Harness::new();
    h.cluster().never_ready.insert("ns-a".into());
    let err = h.reconciler(config()).apply(vec![namespace("ns-a"), deployment("ns-a", "app")], vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Wait(_)), "{err}");
    assert!(!h.journal().iter().any(|e| e.starts_with("apply Deployment")));
    assert!(h.stored().await.is_none());
}

#[tokio::test]
async fn first_apply_error_aborts_remaining_objects_and_skips_persist() {
    let h = Harness::new();
    h.cluster().fail_apply.insert("b".into());
    let err = h
        .reconciler(config())
        .apply(vec![config_map("ns", "a"), config_map("ns", "b"), config_map("ns", "c")], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Apply { .. }), "{err}");
    let journal = h.journal();
    assert!(journal.contains(&"apply ConfigMap/ns/a".to_string()));
    assert!(!journal.contains(&"apply ConfigMap/ns/c".to_string()));
    assert!(h.stored().await.is_none());
    // partial progress was reported before the failure
    assert_eq!(*h.reported.0.lock().unwrap(), vec!["ConfigMap/ns/a created"]);
}

#[tokio::test]
async fn persist_failure_prevents_pruning() {
    let h = Harness::new();
    h.reconciler(config()).apply(vec![namespace("ns-a"), deployment("ns-a", "app")], vec![]).await.unwrap();
    h.cluster().fail_save = true;
    let mut cfg = config();
    cfg.prune = true;
    let err = h.reconciler(cfg).apply(vec![namespace("ns-a")], vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Persist(_)), "{err}");
    assert!(!h.journal().iter().any(|e| e.starts_with("delete ")));
    assert!(h.is_live(&dep_id("ns-a", "app")));
}

#[tokio::test]
async fn prune_failure_is_reported_after_remaining_deletes() {
    let h = Harness::new();
    h.reconciler(config())
        .apply(vec![config_map("ns", "a"), config_map("ns", "b"), config_map("ns", "keep")], vec![])
        .await
        .unwrap();
    h.cluster().fail_delete.insert("a".into());
    let mut cfg = config();
    cfg.prune = true;
    let err = h.reconciler(cfg).apply(vec![config_map("ns", "keep")], vec![]).await.unwrap_err();
    match err {
        Error::Delete(failures) => assert_eq!(failures.len(), 1),
        other => panic!("unexpected error {other}"),
    }
    assert!(!h.is_live(&ResourceId::new("", "ConfigMap", "ns", "b")));
    // the new record was already persisted, so a rerun will not see b as stale again
    assert_eq!(h.stored().await.unwrap().len(), 1);
}

#[tokio::test]
async fn wait_covers_applied_and_pruned_objects() {
    let h = Harness::new();
    h.reconciler(config()).apply(vec![namespace("ns-a"), deployment("ns-a", "app")], vec![]).await.unwrap();
    let mut cfg = config();
    cfg.prune = true;
    cfg.wait = true;
    h.reconciler(cfg).apply(vec![namespace("ns-a")], vec![]).await.unwrap();
    let journal = h.journal();
    assert_eq!(journal.last().map(String::as_str), Some("terminated Deployment/ns-a/app"), "{journal:#?}");
}

#[tokio::test]
async fn autoscaled_workload_is_submitted_without_replicas() {
    let h = Harness::new();
    let hpa = obj(json!({
        "apiVersion": "autoscaling/v2", "kind": "HorizontalPodAutoscaler",
        "metadata": { "name": "app", "namespace": "ns-a" },
        "spec": { "maxReplicas": 5, "scaleTargetRef": { "apiVersion": "apps/v1", "kind": "Deployment", "name": "app" } }
    }));
    h.reconciler(config()).apply(vec![hpa, deployment("ns-a", "app"), deployment("ns-a", "other")], vec![]).await.unwrap();
    let c = h.cluster();
    assert!(c.live[&dep_id("ns-a", "app")].replicas().is_none());
    assert!(c.live[&dep_id("ns-a", "other")].replicas().is_some());
}

#[tokio::test]
async fn invalid_config_fails_before_touching_the_cluster() {
    let h = Harness::new();
    let err = h.reconciler(ReconcileConfig::new("App_1", "flux-system")).apply(vec![namespace("a")], vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Input(_)));
    assert!(h.journal().is_empty());
}

#[tokio::test]
async fn oversized_timeout_is_an_input_error_for_both_workflows() {
    let h = Harness::new();
    let mut cfg = config();
    cfg.timeout = Duration::from_secs(u64::MAX);
    let err = h.reconciler(cfg.clone()).apply(vec![namespace("ns-a")], vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Input(_)), "{err}");
    let err = h.reconciler(cfg).delete().await.unwrap_err();
    assert!(matches!(err, Error::Input(_)), "{err}");
    assert!(h.journal().is_empty());
}

#[tokio::test]
async fn duplicate_objects_fail_planning() {
    let h = Harness::new();
    let err = h.reconciler(config()).apply(vec![config_map("ns", "a"), config_map("ns", "a")], vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Plan(_)));
    assert!(h.journal().is_empty());
}

#[tokio::test]
async fn run_is_bounded_by_the_timeout() {
    let h = Harness::new();
    h.cluster().slow_wait = true;
    let mut cfg = config();
    cfg.timeout = Duration::from_millis(100);
    let err = h.reconciler(cfg).apply(vec![namespace("ns-a")], vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{err}");
}

#[tokio::test]
async fn corrupt_previous_record_is_fatal() {
    let h = Harness::new();
    h.store.inner.put_raw("app", "flux-system", "{not json");
    let mut cfg = config();
    cfg.prune = true;
    let err = h.reconciler(cfg).apply(vec![namespace("ns-a")], vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Corrupt { .. }), "{err}");
    assert!(h.journal().is_empty());
}

#[tokio::test]
async fn delete_workflow_continues_past_failures_and_keeps_the_record() {
    let h = Harness::new();
    h.reconciler(config())
        .apply(vec![namespace("ns-a"), config_map("ns-a", "cfg"), deployment("ns-a", "app")], vec![])
        .await
        .unwrap();
    h.cluster().fail_delete.insert("cfg".into());

    let err = h.reconciler(config()).delete().await.unwrap_err();
    match &err {
        Error::Delete(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].object, ResourceId::new("", "ConfigMap", "ns-a", "cfg"));
        }
        other => panic!("unexpected error {other}"),
    }
    let deletes: Vec<_> = h.journal().into_iter().filter(|e| e.starts_with("delete ")).collect();
    assert_eq!(
        deletes,
        vec!["delete Deployment/ns-a/app", "delete ConfigMap/ns-a/cfg", "delete Namespace/ns-a"]
    );
    assert!(!h.is_live(&dep_id("ns-a", "app")));
    assert_eq!(h.stored().await.unwrap().len(), 3);
}

#[tokio::test]
async fn delete_workflow_removes_objects_then_the_record() {
    let h = Harness::new();
    h.reconciler(config()).apply(vec![namespace("ns-a"), deployment("ns-a", "app")], vec![]).await.unwrap();
    let mut cfg = config();
    cfg.wait = true;
    let report = h.reconciler(cfg.clone()).delete().await.unwrap();
    assert_eq!(report.deleted.count(Action::Deleted), 2);
    assert!(h.stored().await.is_none());
    assert!(h.journal().contains(&"terminated Namespace/ns-a, Deployment/ns-a/app".to_string()));

    let err = h.reconciler(cfg).delete().await.unwrap_err();
    assert!(matches!(err, Error::InventoryNotFound(_)), "{err}");
}
